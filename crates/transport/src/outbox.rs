use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use intake_core::domain::correspondent::CorrespondentId;
use intake_core::errors::SinkError;
use intake_core::ports::MessageSink;

/// Plain-text reply as handed to the outgoing mail relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Writes one JSON envelope per reply into the outbox directory. Files are
/// staged under a dot-prefixed name and renamed into place, so a relay
/// watching the directory never reads a partial envelope.
#[derive(Clone, Debug)]
pub struct OutboxMessageSink {
    outbox: PathBuf,
    sender_name: String,
}

impl OutboxMessageSink {
    pub fn new(outbox: impl Into<PathBuf>, sender_name: impl Into<String>) -> Self {
        Self { outbox: outbox.into(), sender_name: sender_name.into() }
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox
    }

    fn delivery_error(recipient: &CorrespondentId, message: impl ToString) -> SinkError {
        SinkError::Delivery { recipient: recipient.to_string(), message: message.to_string() }
    }
}

#[async_trait]
impl MessageSink for OutboxMessageSink {
    async fn send(
        &self,
        recipient: &CorrespondentId,
        subject: &str,
        body: &str,
    ) -> Result<(), SinkError> {
        let envelope = OutboxEnvelope {
            to: recipient.to_string(),
            from: self.sender_name.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(|error| Self::delivery_error(recipient, error))?;

        fs::create_dir_all(&self.outbox)
            .await
            .map_err(|error| Self::delivery_error(recipient, error))?;

        let stamp = envelope.created_at.format("%Y%m%dT%H%M%S%.3fZ");
        let name = format!("{stamp}-{}.json", Uuid::new_v4());
        let staged = self.outbox.join(format!(".{name}.tmp"));
        let target = self.outbox.join(&name);

        fs::write(&staged, json).await.map_err(|error| Self::delivery_error(recipient, error))?;
        fs::rename(&staged, &target).await.map_err(|error| Self::delivery_error(recipient, error))?;

        info!(
            event_name = "intake.outbox.queued",
            correspondent_id = %recipient,
            path = %target.display(),
            "reply queued in outbox"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use intake_core::domain::correspondent::CorrespondentId;
    use intake_core::errors::SinkError;
    use intake_core::ports::MessageSink;

    use super::{OutboxEnvelope, OutboxMessageSink};

    #[tokio::test]
    async fn send_writes_one_envelope_per_reply() {
        let dir = TempDir::new().expect("tempdir");
        let sink = OutboxMessageSink::new(dir.path().join("outbox"), "Supplier Intake");
        let recipient = CorrespondentId::parse("Acme <sales@acme.test>").expect("id");

        sink.send(&recipient, "Clarification", "What is the weight?").await.expect("send");
        sink.send(&recipient, "Data received", "Thank you!").await.expect("send");

        let mut envelopes: Vec<OutboxEnvelope> = fs::read_dir(sink.outbox_dir())
            .expect("read outbox")
            .map(|entry| {
                let raw = fs::read(entry.expect("entry").path()).expect("read envelope");
                serde_json::from_slice(&raw).expect("decode envelope")
            })
            .collect();
        envelopes.sort_by(|left, right| left.created_at.cmp(&right.created_at));

        assert_eq!(envelopes.len(), 2);
        assert!(envelopes.iter().all(|envelope| envelope.to == "sales@acme.test"));
        assert!(envelopes.iter().any(|envelope| envelope.body == "What is the weight?"));
        assert_eq!(envelopes[0].from, "Supplier Intake");
    }

    #[tokio::test]
    async fn unwritable_outbox_reports_delivery_error() {
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("outbox");
        fs::write(&blocker, "not a directory").expect("write blocker");
        let sink = OutboxMessageSink::new(&blocker, "Supplier Intake");
        let recipient = CorrespondentId::parse("a@s.test").expect("id");

        let error = sink.send(&recipient, "s", "b").await.expect_err("must fail");
        assert!(matches!(
            error,
            SinkError::Delivery { ref recipient, .. } if recipient == "a@s.test"
        ));
    }
}
