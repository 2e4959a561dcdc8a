//! The intake loop: drains the inbound source and drives each message
//! through extract, merge, plan and commit, then executes the planned action.
//!
//! Messages for one correspondent are processed strictly one at a time and in
//! arrival order; different correspondents run concurrently up to
//! `max_concurrency`. The commit is the linearization point: a crash before it
//! means the message is redelivered and reprocessed, a crash after it means
//! the dedup token stops a second commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use intake_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use intake_core::config::AppConfig;
use intake_core::domain::conversation::{Action, ActionId, ActionKind, DeliveryStatus};
use intake_core::domain::correspondent::{CorrespondentId, MessageDedupToken};
use intake_core::domain::record::FieldRecord;
use intake_core::domain::schema::FieldSchema;
use intake_core::errors::{ApplicationError, InboundError, OracleError};
use intake_core::planner::ActionPlanner;
use intake_core::policy::{is_complete, merge};
use intake_core::ports::{
    ClarificationGenerator, ExportSink, ExtractionOracle, InboundMessage, InboundSource,
    MessageSink,
};
use intake_db::repositories::{ConversationStore, RepositoryError};

const ACTOR: &str = "intake-loop";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeSettings {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    /// `None` disables periodic exports.
    pub export_interval: Option<Duration>,
    pub oracle_timeout: Duration,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 4,
            poll_interval: Duration::from_secs(60),
            export_interval: Some(Duration::from_secs(300)),
            oracle_timeout: Duration::from_secs(30),
        }
    }
}

impl IntakeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.intake.batch_size.max(1),
            max_concurrency: config.intake.max_concurrency.max(1),
            poll_interval: Duration::from_secs(config.intake.poll_interval_secs.max(1)),
            export_interval: (config.export.interval_secs > 0)
                .then(|| Duration::from_secs(config.export.interval_secs)),
            oracle_timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }
}

/// Collaborators the loop drives.
pub struct IntakeComponents {
    pub store: Arc<dyn ConversationStore>,
    pub oracle: Arc<dyn ExtractionOracle>,
    pub generator: Arc<dyn ClarificationGenerator>,
    pub source: Arc<dyn InboundSource>,
    pub messages: Arc<dyn MessageSink>,
    pub exports: Arc<dyn ExportSink>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    NotRequired,
    Delivered,
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Committed {
        correspondent_id: CorrespondentId,
        token: MessageDedupToken,
        action: ActionKind,
        oracle_degraded: bool,
        delivery: DeliveryOutcome,
        export_error: Option<String>,
    },
    Duplicate {
        correspondent_id: CorrespondentId,
        token: MessageDedupToken,
    },
    Rejected {
        sender: String,
        token: MessageDedupToken,
        reason: String,
    },
    /// Store failure before commit; the item stays in the source for retry.
    Failed {
        correspondent_id: CorrespondentId,
        token: MessageDedupToken,
        error: String,
    },
}

impl ItemOutcome {
    fn should_acknowledge(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    fn has_sink_failure(&self) -> bool {
        matches!(
            self,
            Self::Committed { delivery: DeliveryOutcome::Failed { .. }, .. }
                | Self::Committed { export_error: Some(_), .. }
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
    pub delivery_failures: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    fn from_outcomes(fetched: usize, outcomes: Vec<ItemOutcome>) -> Self {
        let mut report = Self { fetched, ..Self::default() };
        for outcome in &outcomes {
            match outcome {
                ItemOutcome::Committed { .. } => report.committed += 1,
                ItemOutcome::Duplicate { .. } => report.duplicates += 1,
                ItemOutcome::Rejected { .. } => report.rejected += 1,
                ItemOutcome::Failed { .. } => report.failed += 1,
            }
            if outcome.has_sink_failure() {
                report.delivery_failures += 1;
            }
        }
        report.outcomes = outcomes;
        report
    }
}

/// Running totals exposed on the health endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntakeStats {
    pub cycles: u64,
    pub committed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
    pub delivery_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_fetched: usize,
    pub last_export_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Per-correspondent async mutexes. Entries are pruned once nobody holds
/// or waits on them.
#[derive(Default)]
pub struct CorrespondentLocks {
    locks: Mutex<HashMap<CorrespondentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CorrespondentLocks {
    pub async fn acquire(&self, correspondent_id: &CorrespondentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() > 1024 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(correspondent_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct IntakeInner {
    schema: FieldSchema,
    planner: ActionPlanner,
    store: Arc<dyn ConversationStore>,
    oracle: Arc<dyn ExtractionOracle>,
    source: Arc<dyn InboundSource>,
    messages: Arc<dyn MessageSink>,
    exports: Arc<dyn ExportSink>,
    audit: Arc<dyn AuditSink>,
    locks: CorrespondentLocks,
    settings: IntakeSettings,
    stats: Mutex<IntakeStats>,
    export_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct IntakeLoop {
    inner: Arc<IntakeInner>,
}

impl IntakeLoop {
    pub fn new(
        schema: FieldSchema,
        components: IntakeComponents,
        settings: IntakeSettings,
    ) -> Self {
        let planner = ActionPlanner::new(schema.clone(), components.generator);
        Self {
            inner: Arc::new(IntakeInner {
                schema,
                planner,
                store: components.store,
                oracle: components.oracle,
                source: components.source,
                messages: components.messages,
                exports: components.exports,
                audit: components.audit,
                locks: CorrespondentLocks::default(),
                settings,
                stats: Mutex::new(IntakeStats::default()),
                export_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.inner.schema
    }

    pub fn settings(&self) -> &IntakeSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> IntakeStats {
        match self.inner.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_stats(&self, apply: impl FnOnce(&mut IntakeStats)) {
        match self.inner.stats.lock() {
            Ok(mut stats) => apply(&mut *stats),
            Err(poisoned) => apply(&mut *poisoned.into_inner()),
        }
    }

    /// Handles one inbound item end to end. Never panics and never returns
    /// an error: every failure is folded into the outcome.
    pub async fn process_message(&self, message: &InboundMessage) -> ItemOutcome {
        let inner = &self.inner;
        let token = message.token.clone();

        let correspondent_id = match CorrespondentId::parse(&message.sender) {
            Ok(id) => id,
            Err(error) => {
                warn!(
                    event_name = "intake.message.rejected",
                    correlation_id = %token,
                    sender = %message.sender,
                    error = %error,
                    "inbound message rejected"
                );
                self.emit(
                    None,
                    &token,
                    "intake.message.rejected",
                    AuditCategory::Ingress,
                    AuditOutcome::Rejected,
                    &[("reason", error.to_string())],
                );
                return ItemOutcome::Rejected {
                    sender: message.sender.clone(),
                    token,
                    reason: error.to_string(),
                };
            }
        };

        let _guard = inner.locks.acquire(&correspondent_id).await;

        let state = match inner.store.get(&correspondent_id).await {
            Ok(state) => state,
            Err(error) => return self.store_failure(correspondent_id, token, &error),
        };
        if state.has_processed(&token) {
            return self.duplicate(correspondent_id, token);
        }

        let (partial, oracle_degraded) =
            self.extract(&correspondent_id, &token, &message.text).await;
        let merged = merge(&inner.schema, &state.record, &partial);
        let action = inner.planner.plan(&state, &merged).await;

        let receipt = match inner.store.commit(&correspondent_id, &merged, &action, &token).await {
            Ok(receipt) => receipt,
            Err(RepositoryError::Conflict(_)) => return self.duplicate(correspondent_id, token),
            Err(error) => return self.store_failure(correspondent_id, token, &error),
        };

        info!(
            event_name = "intake.message.committed",
            correlation_id = %token,
            correspondent_id = %correspondent_id,
            action = action.kind().as_str(),
            known_fields = merged.known_count(),
            complete = is_complete(&inner.schema, &merged),
            oracle_degraded,
            "message committed"
        );
        self.emit(
            Some(&correspondent_id),
            &token,
            "intake.message.committed",
            AuditCategory::Persistence,
            if oracle_degraded { AuditOutcome::Degraded } else { AuditOutcome::Success },
            &[
                ("action_kind", action.kind().as_str().to_string()),
                ("known_fields", merged.known_count().to_string()),
            ],
        );

        let delivery =
            self.deliver(&correspondent_id, &token, &action, receipt.action_id.as_ref()).await;
        let export_error = match action {
            Action::Finalize { .. } => {
                self.export_snapshot().await.err().map(|error| error.to_string())
            }
            Action::None | Action::Clarify { .. } => None,
        };

        ItemOutcome::Committed {
            correspondent_id,
            token,
            action: action.kind(),
            oracle_degraded,
            delivery,
            export_error,
        }
    }

    /// Fetches one bounded batch and processes it. Items of one
    /// correspondent keep their arrival order; outcomes are returned in
    /// arrival order too.
    pub async fn process_batch(&self) -> Result<BatchReport, InboundError> {
        let batch = self.inner.source.fetch_batch(self.inner.settings.batch_size).await?;
        let fetched = batch.len();

        let mut partitions: BTreeMap<String, Vec<(usize, InboundMessage)>> = BTreeMap::new();
        for (index, message) in batch.into_iter().enumerate() {
            let key = CorrespondentId::parse(&message.sender)
                .map(|id| id.0)
                .unwrap_or_else(|_| message.sender.clone());
            partitions.entry(key).or_default().push((index, message));
        }

        let permits = Arc::new(Semaphore::new(self.inner.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (_, items) in partitions {
            let this = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let mut outcomes = Vec::with_capacity(items.len());
                for (index, message) in items {
                    let outcome = this.process_message(&message).await;
                    if outcome.should_acknowledge() {
                        this.acknowledge(&message).await;
                    }
                    outcomes.push((index, outcome));
                }
                outcomes
            });
        }

        let mut indexed = Vec::with_capacity(fetched);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => indexed.extend(outcomes),
                Err(join_error) => error!(
                    event_name = "intake.batch.partition_panicked",
                    error = %join_error,
                    "correspondent partition task failed"
                ),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);

        let outcomes = indexed.into_iter().map(|(_, outcome)| outcome).collect();
        let report = BatchReport::from_outcomes(fetched, outcomes);
        self.update_stats(|stats| {
            stats.cycles += 1;
            stats.committed += report.committed as u64;
            stats.duplicates += report.duplicates as u64;
            stats.rejected += report.rejected as u64;
            stats.failed += report.failed as u64;
            stats.delivery_failures += report.delivery_failures as u64;
            stats.last_cycle_at = Some(Utc::now());
            stats.last_cycle_fetched = report.fetched;
        });
        Ok(report)
    }

    /// Writes a full snapshot to the export sink. Returns the row count.
    ///
    /// Exports are serialized: the snapshot is taken under the export lock,
    /// so a later writer always carries every earlier commit.
    pub async fn export_snapshot(&self) -> Result<usize, ApplicationError> {
        let _export = self.inner.export_lock.lock().await;

        let snapshot = match self.inner.store.snapshot_all().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let error = ApplicationError::Persistence(error.to_string());
                self.export_failed(&error);
                return Err(error);
            }
        };

        if let Err(error) = self.inner.exports.write(&self.inner.schema, &snapshot).await {
            let error = ApplicationError::from(error);
            self.export_failed(&error);
            return Err(error);
        }

        self.update_stats(|stats| stats.last_export_at = Some(Utc::now()));
        Ok(snapshot.len())
    }

    fn export_failed(&self, error: &ApplicationError) {
        warn!(
            event_name = "intake.export.failed",
            error_class = error.error_class(),
            error = %error,
            "snapshot export failed"
        );
        self.emit(
            None,
            "",
            "intake.export.failed",
            AuditCategory::Export,
            AuditOutcome::Failed,
            &[("error", error.to_string())],
        );
        self.update_stats(|stats| stats.last_error = Some(error.to_string()));
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped. The
    /// in-flight cycle always completes and a final export is written before
    /// returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.inner.settings.clone();
        let mut last_export = Instant::now();
        info!(
            event_name = "intake.loop.started",
            batch_size = settings.batch_size,
            max_concurrency = settings.max_concurrency,
            poll_interval_secs = settings.poll_interval.as_secs(),
            "intake loop started"
        );

        loop {
            self.run_cycle().await;

            if let Some(interval) = settings.export_interval {
                if last_export.elapsed() >= interval {
                    // Failures are logged and recorded in stats by export_snapshot.
                    if let Ok(rows) = self.export_snapshot().await {
                        debug!(
                            event_name = "intake.export.periodic",
                            rows,
                            "periodic export written"
                        );
                    }
                    last_export = Instant::now();
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        match self.export_snapshot().await {
            Ok(rows) => info!(event_name = "intake.loop.stopped", rows, "final export written"),
            Err(error) => error!(
                event_name = "intake.loop.stopped",
                error = %error,
                "final export failed during shutdown"
            ),
        }
    }

    async fn run_cycle(&self) {
        match self.process_batch().await {
            Ok(report) if report.fetched > 0 => info!(
                event_name = "intake.cycle.completed",
                fetched = report.fetched,
                committed = report.committed,
                duplicates = report.duplicates,
                rejected = report.rejected,
                failed = report.failed,
                delivery_failures = report.delivery_failures,
                "intake cycle completed"
            ),
            Ok(_) => {}
            Err(error) => {
                warn!(
                    event_name = "intake.cycle.source_failed",
                    error = %error,
                    "inbound source failed"
                );
                self.update_stats(|stats| {
                    stats.cycles += 1;
                    stats.last_cycle_at = Some(Utc::now());
                    stats.last_error = Some(error.to_string());
                });
            }
        }
    }

    async fn extract(
        &self,
        correspondent_id: &CorrespondentId,
        token: &MessageDedupToken,
        text: &str,
    ) -> (FieldRecord, bool) {
        let inner = &self.inner;
        let timeout = inner.settings.oracle_timeout;
        let call = inner.oracle.extract(text, &inner.schema);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(timeout)),
        };

        match result {
            Ok(partial) => (partial, false),
            Err(error) => {
                warn!(
                    event_name = "intake.oracle.degraded",
                    correlation_id = %token,
                    correspondent_id = %correspondent_id,
                    error = %error,
                    "extraction failed; continuing with an empty partial"
                );
                self.emit(
                    Some(correspondent_id),
                    token,
                    "intake.oracle.degraded",
                    AuditCategory::Extraction,
                    AuditOutcome::Degraded,
                    &[("error", error.to_string())],
                );
                (FieldRecord::empty(&inner.schema), true)
            }
        }
    }

    async fn deliver(
        &self,
        correspondent_id: &CorrespondentId,
        token: &MessageDedupToken,
        action: &Action,
        action_id: Option<&ActionId>,
    ) -> DeliveryOutcome {
        let Some(reply) = action.reply() else {
            return DeliveryOutcome::NotRequired;
        };

        let sent = self.inner.messages.send(correspondent_id, &reply.subject, &reply.body).await;
        let (status, outcome) = match &sent {
            Ok(()) => (DeliveryStatus::Delivered, DeliveryOutcome::Delivered),
            Err(error) => {
                warn!(
                    event_name = "intake.delivery.failed",
                    correlation_id = %token,
                    correspondent_id = %correspondent_id,
                    action = action.kind().as_str(),
                    error = %error,
                    "reply delivery failed; record stays committed"
                );
                self.emit(
                    Some(correspondent_id),
                    token,
                    "intake.delivery.failed",
                    AuditCategory::Delivery,
                    AuditOutcome::Failed,
                    &[("error", error.to_string())],
                );
                (DeliveryStatus::Failed, DeliveryOutcome::Failed { error: error.to_string() })
            }
        };

        if let Some(action_id) = action_id {
            let detail = sent.as_ref().err().map(|error| error.to_string());
            let marked = self.inner.store.mark_delivery(action_id, status, detail.as_deref()).await;
            if let Err(error) = marked {
                warn!(
                    event_name = "intake.delivery.ledger_failed",
                    correlation_id = %token,
                    action_id = %action_id.0,
                    error = %error,
                    "could not record delivery status"
                );
            }
        }
        outcome
    }

    async fn acknowledge(&self, message: &InboundMessage) {
        if let Err(error) = self.inner.source.acknowledge(message).await {
            warn!(
                event_name = "intake.source.acknowledge_failed",
                correlation_id = %message.token,
                error = %error,
                "could not acknowledge inbound item"
            );
        }
    }

    fn duplicate(
        &self,
        correspondent_id: CorrespondentId,
        token: MessageDedupToken,
    ) -> ItemOutcome {
        info!(
            event_name = "intake.message.duplicate",
            correlation_id = %token,
            correspondent_id = %correspondent_id,
            "message already processed"
        );
        ItemOutcome::Duplicate { correspondent_id, token }
    }

    fn store_failure(
        &self,
        correspondent_id: CorrespondentId,
        token: MessageDedupToken,
        error: &RepositoryError,
    ) -> ItemOutcome {
        error!(
            event_name = "intake.store.failed",
            correlation_id = %token,
            correspondent_id = %correspondent_id,
            error = %error,
            "conversation store failure; message left for retry"
        );
        self.update_stats(|stats| stats.last_error = Some(error.to_string()));
        ItemOutcome::Failed { correspondent_id, token, error: error.to_string() }
    }

    fn emit(
        &self,
        correspondent_id: Option<&CorrespondentId>,
        correlation_id: impl std::fmt::Display,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        let mut event = AuditEvent::new(
            correspondent_id.cloned(),
            correlation_id.to_string(),
            event_type,
            category,
            ACTOR,
            outcome,
        );
        for (key, value) in metadata {
            event = event.with_metadata(*key, value.clone());
        }
        self.inner.audit.emit(event);
    }
}
