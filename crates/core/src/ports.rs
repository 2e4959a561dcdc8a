//! Boundaries to the collaborators the intake core drives but does not own:
//! the extraction oracle, the clarification writer, the inbound source and
//! the two sinks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::correspondent::{CorrespondentId, MessageDedupToken};
use crate::domain::record::FieldRecord;
use crate::domain::schema::FieldSchema;
use crate::errors::{InboundError, OracleError, SinkError};

#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    /// Best-effort partial record for one message. Missing keys are allowed.
    async fn extract(&self, text: &str, schema: &FieldSchema) -> Result<FieldRecord, OracleError>;
}

#[async_trait]
pub trait ClarificationGenerator: Send + Sync {
    async fn generate(&self, missing_fields: &[String]) -> Result<String, OracleError>;
}

/// One decoded inbound item as handed over by a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Raw sender as the transport saw it, normalized later.
    pub sender: String,
    pub subject: Option<String>,
    pub text: String,
    pub token: MessageDedupToken,
    /// Source-specific handle used by `acknowledge`.
    #[serde(default)]
    pub receipt: Option<String>,
}

#[async_trait]
pub trait InboundSource: Send + Sync {
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<InboundMessage>, InboundError>;

    /// Called once the item is durably handled (committed or a known duplicate).
    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), InboundError>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(
        &self,
        recipient: &CorrespondentId,
        subject: &str,
        body: &str,
    ) -> Result<(), SinkError>;
}

/// Point-in-time projection of every stored record.
pub type ExportSnapshot = BTreeMap<CorrespondentId, FieldRecord>;

#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Must be idempotent: writing the same snapshot twice leaves one export.
    async fn write(&self, schema: &FieldSchema, records: &ExportSnapshot) -> Result<(), SinkError>;
}

/// Source that never yields anything; used when no inbox is configured.
#[derive(Clone, Debug, Default)]
pub struct NoopInboundSource;

#[async_trait]
impl InboundSource for NoopInboundSource {
    async fn fetch_batch(&self, _limit: usize) -> Result<Vec<InboundMessage>, InboundError> {
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _message: &InboundMessage) -> Result<(), InboundError> {
        Ok(())
    }
}
