use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::correspondent::{CorrespondentId, MessageDedupToken};
use crate::domain::record::FieldRecord;
use crate::domain::schema::FieldSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    None,
    Clarify,
    Finalize,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Clarify => "clarify",
            Self::Finalize => "finalize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "clarify" => Some(Self::Clarify),
            "finalize" => Some(Self::Finalize),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub correspondent_id: CorrespondentId,
    pub record: FieldRecord,
    pub last_action_kind: ActionKind,
    pub last_action_at: Option<DateTime<Utc>>,
    pub processed_tokens: BTreeSet<MessageDedupToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(
        correspondent_id: CorrespondentId,
        schema: &FieldSchema,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            correspondent_id,
            record: FieldRecord::empty(schema),
            last_action_kind: ActionKind::None,
            last_action_at: None,
            processed_tokens: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_processed(&self, token: &MessageDedupToken) -> bool {
        self.processed_tokens.contains(token)
    }
}

/// Plain-text message addressed to a correspondent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub subject: String,
    pub body: String,
}

/// The single outbound decision taken for one processed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    None,
    Clarify { missing_fields: Vec<String>, reply: OutboundReply },
    Finalize { record: FieldRecord, reply: OutboundReply },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::None => ActionKind::None,
            Self::Clarify { .. } => ActionKind::Clarify,
            Self::Finalize { .. } => ActionKind::Finalize,
        }
    }

    pub fn reply(&self) -> Option<&OutboundReply> {
        match self {
            Self::None => None,
            Self::Clarify { reply, .. } | Self::Finalize { reply, .. } => Some(reply),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outbound obligation created by a commit and tracked until a sink accepts it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub action_id: ActionId,
    pub correspondent_id: CorrespondentId,
    pub token: MessageDedupToken,
    pub action_kind: ActionKind,
    pub reply: OutboundReply,
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Action, ActionKind, ConversationState, DeliveryStatus, OutboundReply};
    use crate::domain::correspondent::{CorrespondentId, MessageDedupToken};
    use crate::domain::schema::FieldSchema;

    #[test]
    fn action_kind_round_trips_from_storage_encoding() {
        for kind in [ActionKind::None, ActionKind::Clarify, ActionKind::Finalize] {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::parse("escalate"), None);
    }

    #[test]
    fn delivery_status_round_trips_from_storage_encoding() {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Delivered, DeliveryStatus::Failed]
        {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn new_state_starts_empty() {
        let schema = FieldSchema::new(["name", "price"]).expect("schema");
        let state = ConversationState::new(
            CorrespondentId::parse("a@b.test").expect("id"),
            &schema,
            Utc::now(),
        );

        assert_eq!(state.last_action_kind, ActionKind::None);
        assert_eq!(state.record.known_count(), 0);
        assert!(!state.has_processed(&MessageDedupToken::new("m1")));
    }

    #[test]
    fn only_clarify_and_finalize_carry_replies() {
        let reply = OutboundReply { subject: "s".to_string(), body: "b".to_string() };
        let clarify = Action::Clarify { missing_fields: vec!["price".to_string()], reply };

        assert_eq!(clarify.kind(), ActionKind::Clarify);
        assert!(clarify.reply().is_some());
        assert!(Action::None.reply().is_none());
    }
}
