use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use intake_core::domain::conversation::{
    Action, ActionId, ActionKind, ConversationState, DeliveryRecord, DeliveryStatus,
    OutboundReply,
};
use intake_core::domain::correspondent::{CorrespondentId, MessageDedupToken};
use intake_core::domain::record::FieldRecord;
use intake_core::domain::schema::FieldSchema;
use intake_core::errors::ConflictError;
use intake_core::ports::ExportSnapshot;

use super::{planned_delivery, CommitReceipt, ConversationStore, RepositoryError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
    schema: FieldSchema,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool, schema: FieldSchema) -> Self {
        Self { pool, schema }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load_tokens(
        &self,
        correspondent_id: &CorrespondentId,
    ) -> Result<BTreeSet<MessageDedupToken>, RepositoryError> {
        let rows = sqlx::query("SELECT token FROM processed_message WHERE correspondent_id = ?")
            .bind(correspondent_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<MessageDedupToken, RepositoryError> {
                Ok(MessageDedupToken(row.try_get("token")?))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn get(
        &self,
        correspondent_id: &CorrespondentId,
    ) -> Result<ConversationState, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let empty = encode_record(&FieldRecord::empty(&self.schema))?;

        sqlx::query(
            "INSERT INTO conversation (
                correspondent_id,
                record_json,
                last_action_kind,
                last_action_at,
                created_at,
                updated_at
             ) VALUES (?, ?, 'none', NULL, ?, ?)
             ON CONFLICT(correspondent_id) DO NOTHING",
        )
        .bind(correspondent_id.as_str())
        .bind(&empty)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT
                correspondent_id,
                record_json,
                last_action_kind,
                last_action_at,
                created_at,
                updated_at
             FROM conversation
             WHERE correspondent_id = ?",
        )
        .bind(correspondent_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let tokens = self.load_tokens(correspondent_id).await?;
        state_from_row(row, tokens)
    }

    async fn commit(
        &self,
        correspondent_id: &CorrespondentId,
        record: &FieldRecord,
        action: &Action,
        token: &MessageDedupToken,
    ) -> Result<CommitReceipt, RepositoryError> {
        let now = Utc::now();
        let now_text = now.to_rfc3339();
        let record_json = encode_record(record)?;
        let kind = action.kind();
        let action_at = (kind != ActionKind::None).then(|| now_text.clone());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation (
                correspondent_id,
                record_json,
                last_action_kind,
                last_action_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(correspondent_id) DO UPDATE SET
                record_json = excluded.record_json,
                last_action_kind = CASE
                    WHEN excluded.last_action_kind = 'none' THEN conversation.last_action_kind
                    ELSE excluded.last_action_kind
                END,
                last_action_at = CASE
                    WHEN excluded.last_action_kind = 'none' THEN conversation.last_action_at
                    ELSE excluded.last_action_at
                END,
                updated_at = excluded.updated_at",
        )
        .bind(correspondent_id.as_str())
        .bind(&record_json)
        .bind(kind.as_str())
        .bind(action_at.as_deref())
        .bind(&now_text)
        .bind(&now_text)
        .execute(&mut *tx)
        .await?;

        let ledgered = sqlx::query(
            "INSERT INTO processed_message (correspondent_id, token, action_kind, processed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(correspondent_id.as_str())
        .bind(token.as_str())
        .bind(kind.as_str())
        .bind(&now_text)
        .execute(&mut *tx)
        .await;

        if let Err(error) = ledgered {
            let duplicate = matches!(
                &error,
                sqlx::Error::Database(db_error) if db_error.is_unique_violation()
            );
            tx.rollback().await?;
            if duplicate {
                debug!(
                    event_name = "intake.store.commit_conflict",
                    correspondent_id = %correspondent_id,
                    correlation_id = %token,
                    "dedup token already committed"
                );
                return Err(ConflictError {
                    correspondent_id: correspondent_id.clone(),
                    token: token.clone(),
                }
                .into());
            }
            return Err(error.into());
        }

        let delivery = planned_delivery(correspondent_id, token, action, now);
        if let Some(delivery) = &delivery {
            sqlx::query(
                "INSERT INTO delivery (
                    action_id,
                    correspondent_id,
                    token,
                    action_kind,
                    subject,
                    body,
                    status,
                    last_error,
                    created_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
            )
            .bind(&delivery.action_id.0)
            .bind(delivery.correspondent_id.as_str())
            .bind(delivery.token.as_str())
            .bind(delivery.action_kind.as_str())
            .bind(&delivery.reply.subject)
            .bind(&delivery.reply.body)
            .bind(delivery.status.as_str())
            .bind(delivery.created_at.to_rfc3339())
            .bind(delivery.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(CommitReceipt {
            action_id: delivery.map(|delivery| delivery.action_id),
            committed_at: now,
        })
    }

    async fn snapshot_all(&self) -> Result<ExportSnapshot, RepositoryError> {
        let rows = sqlx::query(
            "SELECT correspondent_id, record_json FROM conversation ORDER BY correspondent_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(CorrespondentId, FieldRecord), RepositoryError> {
                let id = CorrespondentId(row.try_get("correspondent_id")?);
                let record = decode_record(&row.try_get::<String, _>("record_json")?)?;
                Ok((id, record))
            })
            .collect()
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, RepositoryError> {
        let token_rows = sqlx::query("SELECT correspondent_id, token FROM processed_message")
            .fetch_all(&self.pool)
            .await?;
        let mut tokens: BTreeMap<String, BTreeSet<MessageDedupToken>> = BTreeMap::new();
        for row in token_rows {
            tokens
                .entry(row.try_get("correspondent_id")?)
                .or_default()
                .insert(MessageDedupToken(row.try_get("token")?));
        }

        let rows = sqlx::query(
            "SELECT
                correspondent_id,
                record_json,
                last_action_kind,
                last_action_at,
                created_at,
                updated_at
             FROM conversation
             ORDER BY correspondent_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ConversationState, RepositoryError> {
                let id: String = row.try_get("correspondent_id")?;
                let processed = tokens.remove(&id).unwrap_or_default();
                state_from_row(row, processed)
            })
            .collect()
    }

    async fn mark_delivery(
        &self,
        action_id: &ActionId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE delivery SET status = ?, last_error = ?, updated_at = ? WHERE action_id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(&action_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("delivery `{}`", action_id.0)));
        }
        Ok(())
    }

    async fn list_undelivered(&self) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                action_id,
                correspondent_id,
                token,
                action_kind,
                subject,
                body,
                status,
                last_error,
                created_at,
                updated_at
             FROM delivery
             WHERE status != 'delivered'
             ORDER BY created_at ASC, action_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(delivery_from_row).collect()
    }
}

fn encode_record(record: &FieldRecord) -> Result<String, RepositoryError> {
    serde_json::to_string(record)
        .map_err(|error| RepositoryError::Decode(format!("could not encode record: {error}")))
}

fn decode_record(raw: &str) -> Result<FieldRecord, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid record_json: {error}")))
}

fn state_from_row(
    row: SqliteRow,
    processed_tokens: BTreeSet<MessageDedupToken>,
) -> Result<ConversationState, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("last_action_kind")?;
    let last_action_kind = ActionKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action kind `{kind_raw}`")))?;

    Ok(ConversationState {
        correspondent_id: CorrespondentId(row.try_get("correspondent_id")?),
        record: decode_record(&row.try_get::<String, _>("record_json")?)?,
        last_action_kind,
        last_action_at: parse_optional_timestamp("last_action_at", row.try_get("last_action_at")?)?,
        processed_tokens,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn delivery_from_row(row: SqliteRow) -> Result<DeliveryRecord, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("action_kind")?;
    let action_kind = ActionKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action kind `{kind_raw}`")))?;
    let status_raw = row.try_get::<String, _>("status")?;
    let status = DeliveryStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown delivery status `{status_raw}`")))?;

    Ok(DeliveryRecord {
        action_id: ActionId(row.try_get("action_id")?),
        correspondent_id: CorrespondentId(row.try_get("correspondent_id")?),
        token: MessageDedupToken(row.try_get("token")?),
        action_kind,
        reply: OutboundReply { subject: row.try_get("subject")?, body: row.try_get("body")? },
        status,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
