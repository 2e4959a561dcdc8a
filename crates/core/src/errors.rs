use std::time::Duration;

use thiserror::Error;

use crate::domain::correspondent::{CorrespondentId, MessageDedupToken};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid field schema: {0}")]
    InvalidSchema(String),
    #[error("sender `{0}` does not contain a usable address")]
    InvalidCorrespondent(String),
}

/// Extraction or clarification call failed. Always recovered locally.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle transport failure: {0}")]
    Transport(String),
    #[error("oracle returned malformed output: {0}")]
    Malformed(String),
    #[error("oracle quota exhausted: {0}")]
    Quota(String),
}

/// The dedup token was already committed for this correspondent.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("message `{token}` already processed for `{correspondent_id}`")]
pub struct ConflictError {
    pub correspondent_id: CorrespondentId,
    pub token: MessageDedupToken,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("delivery to `{recipient}` failed: {message}")]
    Delivery { recipient: String, message: String },
    #[error("export write failed: {0}")]
    Export(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("inbound source unavailable: {0}")]
    Unavailable(String),
    #[error("inbound item `{item}` could not be read: {message}")]
    Unreadable { item: String, message: String },
    #[error("inbound acknowledge failed for `{item}`: {message}")]
    Acknowledge { item: String, message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Stable machine-readable class used by CLI payloads and audit metadata.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain_validation",
            Self::Persistence(_) => "persistence",
            Self::Integration(_) => "integration",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<SinkError> for ApplicationError {
    fn from(value: SinkError) -> Self {
        Self::Integration(value.to_string())
    }
}

impl From<InboundError> for ApplicationError {
    fn from(value: InboundError) -> Self {
        Self::Integration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::domain::correspondent::{CorrespondentId, MessageDedupToken};
    use crate::errors::{
        ApplicationError, ConflictError, DomainError, OracleError, SinkError,
    };

    #[test]
    fn conflict_error_names_token_and_correspondent() {
        let error = ConflictError {
            correspondent_id: CorrespondentId::parse("Sales <sales@acme.test>").expect("address"),
            token: MessageDedupToken::new("msg-1"),
        };

        let message = error.to_string();
        assert!(message.contains("msg-1"));
        assert!(message.contains("sales@acme.test"));
    }

    #[test]
    fn sink_error_maps_to_integration_class() {
        let error = ApplicationError::from(SinkError::Export("disk full".to_owned()));
        assert_eq!(error.error_class(), "integration");
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn domain_error_maps_to_validation_class() {
        let error = ApplicationError::from(DomainError::InvalidSchema("empty".to_owned()));
        assert_eq!(error.error_class(), "domain_validation");
    }

    #[test]
    fn oracle_timeout_renders_duration() {
        let error = OracleError::Timeout(Duration::from_secs(30));
        assert_eq!(error.to_string(), "oracle call timed out after 30s");
    }
}
