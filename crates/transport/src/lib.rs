//! File-backed adapters for the intake ports: a spool-directory inbound
//! source, an outbox-directory message sink and a CSV export sink.

pub mod export;
pub mod outbox;
pub mod spool;

pub use export::CsvExportSink;
pub use outbox::{OutboxEnvelope, OutboxMessageSink};
pub use spool::{SpoolDirSource, SpoolMessage};
