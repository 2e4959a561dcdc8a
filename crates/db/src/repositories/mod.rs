use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use intake_core::domain::conversation::{
    Action, ActionId, ConversationState, DeliveryRecord, DeliveryStatus,
};
use intake_core::domain::correspondent::{CorrespondentId, MessageDedupToken};
use intake_core::domain::record::FieldRecord;
use intake_core::errors::ConflictError;
use intake_core::ports::ExportSnapshot;

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use memory::InMemoryConversationStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Delivery ledger entry created for a Clarify/Finalize action.
    pub action_id: Option<ActionId>,
    pub committed_at: DateTime<Utc>,
}

/// Durable map from correspondent to conversation state.
///
/// Only the store mutates conversation state. `commit` is the single atomic
/// step that replaces the record, records the action and ledgers the dedup
/// token; it fails with [`RepositoryError::Conflict`] and writes nothing if
/// the token was already committed for that correspondent.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the state, creating an empty one on first contact.
    async fn get(
        &self,
        correspondent_id: &CorrespondentId,
    ) -> Result<ConversationState, RepositoryError>;

    async fn commit(
        &self,
        correspondent_id: &CorrespondentId,
        record: &FieldRecord,
        action: &Action,
        token: &MessageDedupToken,
    ) -> Result<CommitReceipt, RepositoryError>;

    /// Point-in-time view of every record, ordered by correspondent id.
    async fn snapshot_all(&self) -> Result<ExportSnapshot, RepositoryError>;

    async fn list_states(&self) -> Result<Vec<ConversationState>, RepositoryError>;

    async fn mark_delivery(
        &self,
        action_id: &ActionId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Pending and failed deliveries, oldest first.
    async fn list_undelivered(&self) -> Result<Vec<DeliveryRecord>, RepositoryError>;
}

pub(crate) fn planned_delivery(
    correspondent_id: &CorrespondentId,
    token: &MessageDedupToken,
    action: &Action,
    now: DateTime<Utc>,
) -> Option<DeliveryRecord> {
    let reply = action.reply()?;
    Some(DeliveryRecord {
        action_id: ActionId(Uuid::new_v4().to_string()),
        correspondent_id: correspondent_id.clone(),
        token: token.clone(),
        action_kind: action.kind(),
        reply: reply.clone(),
        status: DeliveryStatus::Pending,
        last_error: None,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `ConversationStore` must share.

    use intake_core::domain::conversation::{Action, ActionKind, DeliveryStatus, OutboundReply};
    use intake_core::domain::correspondent::{CorrespondentId, MessageDedupToken};
    use intake_core::domain::record::FieldRecord;
    use intake_core::domain::schema::FieldSchema;

    use super::{ConversationStore, RepositoryError};

    pub fn schema() -> FieldSchema {
        FieldSchema::new(["name", "price"]).expect("schema")
    }

    fn id(raw: &str) -> CorrespondentId {
        CorrespondentId::parse(raw).expect("correspondent")
    }

    fn clarify() -> Action {
        Action::Clarify {
            missing_fields: vec!["price".to_string()],
            reply: OutboundReply { subject: "Question".to_string(), body: "Price?".to_string() },
        }
    }

    pub async fn get_creates_empty_state(store: &dyn ConversationStore) {
        let state = store.get(&id("new@supplier.test")).await.expect("get");

        assert_eq!(state.correspondent_id, id("new@supplier.test"));
        assert_eq!(state.record.known_count(), 0);
        assert_eq!(state.last_action_kind, ActionKind::None);
        assert!(state.processed_tokens.is_empty());

        let again = store.get(&id("new@supplier.test")).await.expect("get again");
        assert_eq!(again.created_at, state.created_at);
        assert_eq!(store.list_states().await.expect("list").len(), 1);
    }

    pub async fn commit_persists_record_action_and_token(store: &dyn ConversationStore) {
        let supplier = id("a@supplier.test");
        store.get(&supplier).await.expect("get");

        let record = FieldRecord::from_extraction(&schema(), [("name", "Widget")]);
        let token = MessageDedupToken::new("m1");
        let receipt = store.commit(&supplier, &record, &clarify(), &token).await.expect("commit");
        assert!(receipt.action_id.is_some());

        let state = store.get(&supplier).await.expect("reload");
        assert_eq!(state.record, record);
        assert_eq!(state.last_action_kind, ActionKind::Clarify);
        assert!(state.last_action_at.is_some());
        assert!(state.has_processed(&token));

        let pending = store.list_undelivered().await.expect("undelivered");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, DeliveryStatus::Pending);
        assert_eq!(pending[0].reply.body, "Price?");
        assert_eq!(Some(&pending[0].action_id), receipt.action_id.as_ref());
    }

    pub async fn duplicate_token_conflicts_without_writing(store: &dyn ConversationStore) {
        let supplier = id("dup@supplier.test");
        let token = MessageDedupToken::new("m1");
        let first = FieldRecord::from_extraction(&schema(), [("name", "Widget")]);
        store.commit(&supplier, &first, &clarify(), &token).await.expect("first commit");

        let second = FieldRecord::from_extraction(&schema(), [("name", "Gadget"), ("price", "9")]);
        let error = store
            .commit(&supplier, &second, &Action::None, &token)
            .await
            .expect_err("duplicate token must conflict");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        let state = store.get(&supplier).await.expect("get");
        assert_eq!(state.record, first);
        assert_eq!(state.processed_tokens.len(), 1);
        assert_eq!(store.list_undelivered().await.expect("undelivered").len(), 1);
    }

    pub async fn same_token_is_independent_per_correspondent(store: &dyn ConversationStore) {
        let token = MessageDedupToken::new("shared");
        let record = FieldRecord::empty(&schema());

        store.commit(&id("x@a.test"), &record, &Action::None, &token).await.expect("x");
        store.commit(&id("y@a.test"), &record, &Action::None, &token).await.expect("y");
    }

    pub async fn none_action_keeps_previous_action_kind(store: &dyn ConversationStore) {
        let supplier = id("keep@supplier.test");
        let record = FieldRecord::empty(&schema());
        store
            .commit(&supplier, &record, &clarify(), &MessageDedupToken::new("m1"))
            .await
            .expect("clarify");
        let receipt = store
            .commit(&supplier, &record, &Action::None, &MessageDedupToken::new("m2"))
            .await
            .expect("none");

        assert!(receipt.action_id.is_none());
        let state = store.get(&supplier).await.expect("get");
        assert_eq!(state.last_action_kind, ActionKind::Clarify);
        assert_eq!(state.processed_tokens.len(), 2);
    }

    pub async fn snapshot_is_ordered_by_correspondent(store: &dyn ConversationStore) {
        let token = MessageDedupToken::new("m1");
        for raw in ["zeta@s.test", "alpha@s.test", "mid@s.test"] {
            let record = FieldRecord::from_extraction(&schema(), [("name", raw)]);
            store.commit(&id(raw), &record, &Action::None, &token).await.expect("commit");
        }

        let snapshot = store.snapshot_all().await.expect("snapshot");
        let keys: Vec<&str> = snapshot.keys().map(|key| key.as_str()).collect();
        assert_eq!(keys, ["alpha@s.test", "mid@s.test", "zeta@s.test"]);
        assert_eq!(snapshot[&id("mid@s.test")].get("name"), Some("mid@s.test"));
    }

    pub async fn delivery_status_transitions(store: &dyn ConversationStore) {
        let supplier = id("ledger@supplier.test");
        let record = FieldRecord::empty(&schema());
        let first = store
            .commit(&supplier, &record, &clarify(), &MessageDedupToken::new("m1"))
            .await
            .expect("commit m1")
            .action_id
            .expect("action id");
        let second = store
            .commit(&supplier, &record, &clarify(), &MessageDedupToken::new("m2"))
            .await
            .expect("commit m2")
            .action_id
            .expect("action id");

        store.mark_delivery(&first, DeliveryStatus::Delivered, None).await.expect("delivered");
        store
            .mark_delivery(&second, DeliveryStatus::Failed, Some("smtp down"))
            .await
            .expect("failed");

        let undelivered = store.list_undelivered().await.expect("undelivered");
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].action_id, second);
        assert_eq!(undelivered[0].status, DeliveryStatus::Failed);
        assert_eq!(undelivered[0].last_error.as_deref(), Some("smtp down"));

        let missing = store
            .mark_delivery(
                &intake_core::domain::conversation::ActionId("nope".to_string()),
                DeliveryStatus::Delivered,
                None,
            )
            .await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));
    }
}
