use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Normalized sender address. Two raw `From` values that name the same
/// mailbox produce equal ids.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrespondentId(pub String);

impl CorrespondentId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let address = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(open), Some(close)) if open < close => &raw[open + 1..close],
            _ => raw,
        };
        let normalized = address.trim().trim_matches(|ch| ch == '<' || ch == '>').trim();

        if normalized.is_empty() {
            return Err(DomainError::InvalidCorrespondent(raw.to_string()));
        }

        Ok(Self(normalized.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrespondentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one raw inbound item across redeliveries.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageDedupToken(pub String);

impl MessageDedupToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Content-addressed token for sources that cannot supply a stable id.
    /// The sender is normalized first, so every form of one address hashes
    /// the same.
    pub fn derive(sender: &str, text: &str) -> Self {
        let sender = CorrespondentId::parse(sender)
            .map(|id| id.0)
            .unwrap_or_else(|_| sender.trim().to_lowercase());
        let mut hasher = blake3::Hasher::new();
        hasher.update(sender.as_bytes());
        hasher.update(&[0]);
        hasher.update(text.as_bytes());
        Self(format!("blake3:{}", hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageDedupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
