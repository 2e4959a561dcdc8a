pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod planner;
pub mod policy;
pub mod ports;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use domain::conversation::{
    Action, ActionId, ActionKind, ConversationState, DeliveryRecord, DeliveryStatus,
    OutboundReply,
};
pub use domain::correspondent::{CorrespondentId, MessageDedupToken};
pub use domain::record::FieldRecord;
pub use domain::schema::FieldSchema;
pub use errors::{
    ApplicationError, ConflictError, DomainError, InboundError, OracleError, SinkError,
};
pub use planner::{ActionPlanner, ReplyTemplates};
pub use ports::{
    ClarificationGenerator, ExportSink, ExportSnapshot, ExtractionOracle, InboundMessage,
    InboundSource, MessageSink,
};
