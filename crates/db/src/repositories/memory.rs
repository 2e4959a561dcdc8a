use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use intake_core::domain::conversation::{
    Action, ActionId, ActionKind, ConversationState, DeliveryRecord, DeliveryStatus,
};
use intake_core::domain::correspondent::{CorrespondentId, MessageDedupToken};
use intake_core::domain::record::FieldRecord;
use intake_core::domain::schema::FieldSchema;
use intake_core::errors::ConflictError;
use intake_core::ports::ExportSnapshot;

use super::{planned_delivery, CommitReceipt, ConversationStore, RepositoryError};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<CorrespondentId, ConversationState>,
    deliveries: BTreeMap<String, DeliveryRecord>,
}

/// Process-local store with the same contract as the SQL store. One lock
/// covers conversations and deliveries so a commit is all-or-nothing.
pub struct InMemoryConversationStore {
    schema: FieldSchema,
    state: RwLock<MemoryState>,
}

impl InMemoryConversationStore {
    pub fn new(schema: FieldSchema) -> Self {
        Self { schema, state: RwLock::new(MemoryState::default()) }
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(
        &self,
        correspondent_id: &CorrespondentId,
    ) -> Result<ConversationState, RepositoryError> {
        let mut state = self.state.write().await;
        let conversation = state.conversations.entry(correspondent_id.clone()).or_insert_with(|| {
            ConversationState::new(correspondent_id.clone(), &self.schema, Utc::now())
        });
        Ok(conversation.clone())
    }

    async fn commit(
        &self,
        correspondent_id: &CorrespondentId,
        record: &FieldRecord,
        action: &Action,
        token: &MessageDedupToken,
    ) -> Result<CommitReceipt, RepositoryError> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let already = state
            .conversations
            .get(correspondent_id)
            .map(|conversation| conversation.has_processed(token))
            .unwrap_or(false);
        if already {
            return Err(ConflictError {
                correspondent_id: correspondent_id.clone(),
                token: token.clone(),
            }
            .into());
        }

        let conversation = state
            .conversations
            .entry(correspondent_id.clone())
            .or_insert_with(|| ConversationState::new(correspondent_id.clone(), &self.schema, now));
        conversation.record = record.clone();
        conversation.processed_tokens.insert(token.clone());
        conversation.updated_at = now;
        if action.kind() != ActionKind::None {
            conversation.last_action_kind = action.kind();
            conversation.last_action_at = Some(now);
        }

        let delivery = planned_delivery(correspondent_id, token, action, now);
        let action_id = delivery.as_ref().map(|delivery| delivery.action_id.clone());
        if let Some(delivery) = delivery {
            state.deliveries.insert(delivery.action_id.0.clone(), delivery);
        }

        Ok(CommitReceipt { action_id, committed_at: now })
    }

    async fn snapshot_all(&self) -> Result<ExportSnapshot, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .iter()
            .map(|(id, conversation)| (id.clone(), conversation.record.clone()))
            .collect())
    }

    async fn list_states(&self) -> Result<Vec<ConversationState>, RepositoryError> {
        let state = self.state.read().await;
        let mut states: Vec<ConversationState> = state.conversations.values().cloned().collect();
        states.sort_by(|left, right| left.correspondent_id.cmp(&right.correspondent_id));
        Ok(states)
    }

    async fn mark_delivery(
        &self,
        action_id: &ActionId,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let delivery = state
            .deliveries
            .get_mut(&action_id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("delivery `{}`", action_id.0)))?;
        delivery.status = status;
        delivery.last_error = error.map(str::to_string);
        delivery.updated_at = Utc::now();
        Ok(())
    }

    async fn list_undelivered(&self) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let state = self.state.read().await;
        let mut pending: Vec<DeliveryRecord> = state
            .deliveries
            .values()
            .filter(|delivery| delivery.status != DeliveryStatus::Delivered)
            .cloned()
            .collect();
        pending.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.action_id.0.cmp(&right.action_id.0))
        });
        Ok(pending)
    }
}
