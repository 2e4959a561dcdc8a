use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use intake_core::domain::correspondent::MessageDedupToken;
use intake_core::errors::InboundError;
use intake_core::ports::{InboundMessage, InboundSource};

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

/// One decoded message as dropped into the inbox by a mail fetcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolMessage {
    pub from: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    /// Stable transport id (Message-ID, mailbox UID). Content hash when absent.
    #[serde(default)]
    pub message_id: Option<String>,
}

impl SpoolMessage {
    pub fn token(&self) -> MessageDedupToken {
        match self.message_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => MessageDedupToken::new(id),
            _ => MessageDedupToken::derive(&self.from, &self.body),
        }
    }

    fn into_inbound(self, receipt: String) -> InboundMessage {
        let token = self.token();
        InboundMessage {
            sender: self.from,
            subject: self.subject,
            text: self.body,
            token,
            receipt: Some(receipt),
        }
    }
}

/// Inbound source over a directory of `*.json` files, read in file-name
/// order. Acknowledged files move to `processed/`; undecodable ones move to
/// `rejected/` so they never block the queue.
#[derive(Clone, Debug)]
pub struct SpoolDirSource {
    inbox: PathBuf,
}

impl SpoolDirSource {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self { inbox: inbox.into() }
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.inbox.join(PROCESSED_DIR)
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.inbox.join(REJECTED_DIR)
    }

    pub async fn ensure_dirs(&self) -> Result<(), InboundError> {
        for dir in [self.inbox.clone(), self.processed_dir(), self.rejected_dir()] {
            fs::create_dir_all(&dir).await.map_err(|error| {
                InboundError::Unavailable(format!("could not create `{}`: {error}", dir.display()))
            })?;
        }
        Ok(())
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>, InboundError> {
        let mut entries = fs::read_dir(&self.inbox).await.map_err(|error| {
            InboundError::Unavailable(format!("inbox `{}`: {error}", self.inbox.display()))
        })?;

        let mut files = Vec::new();
        let unavailable = |error: std::io::Error| InboundError::Unavailable(error.to_string());
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| !name.starts_with('.'))
                .unwrap_or(false);
            let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
            let is_file = entry.file_type().await.map(|kind| kind.is_file()).unwrap_or(false);
            if visible && is_json && is_file {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn quarantine(&self, path: &Path, reason: &str) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.rejected_dir().join(name);
        if let Err(error) = move_file(path, &target).await {
            warn!(
                event_name = "intake.spool.quarantine_failed",
                path = %path.display(),
                error = %error,
                "could not move unreadable spool file aside"
            );
            return;
        }
        warn!(
            event_name = "intake.spool.rejected",
            path = %target.display(),
            reason = %reason,
            "unreadable spool file moved to rejected"
        );
    }
}

#[async_trait]
impl InboundSource for SpoolDirSource {
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<InboundMessage>, InboundError> {
        let mut batch = Vec::new();
        for path in self.pending_files().await? {
            if batch.len() >= limit {
                break;
            }

            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => {
                    return Err(InboundError::Unreadable {
                        item: path.display().to_string(),
                        message: error.to_string(),
                    })
                }
            };

            match serde_json::from_str::<SpoolMessage>(&raw) {
                Ok(message) => batch.push(message.into_inbound(path.display().to_string())),
                Err(error) => self.quarantine(&path, &error.to_string()).await,
            }
        }

        debug!(event_name = "intake.spool.fetched", count = batch.len(), "spool batch read");
        Ok(batch)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), InboundError> {
        let Some(receipt) = message.receipt.as_deref() else {
            return Ok(());
        };
        let source = PathBuf::from(receipt);
        let Some(name) = source.file_name() else {
            return Err(InboundError::Acknowledge {
                item: receipt.to_string(),
                message: "receipt does not name a file".to_string(),
            });
        };

        match move_file(&source, &self.processed_dir().join(name)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(InboundError::Acknowledge {
                item: receipt.to_string(),
                message: error.to_string(),
            }),
        }
    }
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(from, to).await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use intake_core::domain::correspondent::MessageDedupToken;
    use intake_core::ports::InboundSource;

    use super::{SpoolDirSource, SpoolMessage};

    fn write_message(dir: &TempDir, name: &str, message: &SpoolMessage) {
        let json = serde_json::to_string(message).expect("encode");
        fs::write(dir.path().join(name), json).expect("write spool file");
    }

    fn message(from: &str, body: &str, message_id: Option<&str>) -> SpoolMessage {
        SpoolMessage {
            from: from.to_string(),
            subject: Some("Product".to_string()),
            body: body.to_string(),
            message_id: message_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn fetch_reads_in_name_order_and_respects_limit() {
        let dir = TempDir::new().expect("tempdir");
        write_message(&dir, "002.json", &message("b@s.test", "second", Some("<m2>")));
        write_message(&dir, "001.json", &message("a@s.test", "first", Some("<m1>")));
        write_message(&dir, "003.json", &message("c@s.test", "third", None));
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let source = SpoolDirSource::new(dir.path());
        let batch = source.fetch_batch(2).await.expect("fetch");

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].text, "first");
        assert_eq!(batch[0].token, MessageDedupToken::new("<m1>"));
        assert_eq!(batch[1].sender, "b@s.test");
    }

    #[test]
    fn missing_message_id_falls_back_to_content_token() {
        let spooled = message("Acme <sales@acme.test>", "price 10", Some("   "));
        let derived = MessageDedupToken::derive("Acme <sales@acme.test>", "price 10");
        assert_eq!(spooled.token(), derived);
    }

    #[tokio::test]
    async fn acknowledge_moves_file_to_processed() {
        let dir = TempDir::new().expect("tempdir");
        write_message(&dir, "001.json", &message("a@s.test", "hello", Some("<m1>")));
        let source = SpoolDirSource::new(dir.path());
        source.ensure_dirs().await.expect("dirs");

        let batch = source.fetch_batch(10).await.expect("fetch");
        source.acknowledge(&batch[0]).await.expect("ack");
        source.acknowledge(&batch[0]).await.expect("second ack is a no-op");

        assert!(!dir.path().join("001.json").exists());
        assert!(source.processed_dir().join("001.json").exists());
        assert!(source.fetch_batch(10).await.expect("refetch").is_empty());
    }

    #[tokio::test]
    async fn malformed_files_are_quarantined_not_returned() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("001.json"), "{not json").expect("write");
        write_message(&dir, "002.json", &message("a@s.test", "ok", None));

        let source = SpoolDirSource::new(dir.path());
        let batch = source.fetch_batch(10).await.expect("fetch");

        assert_eq!(batch.len(), 1);
        assert!(source.rejected_dir().join("001.json").exists());
    }

    #[tokio::test]
    async fn missing_inbox_is_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let source = SpoolDirSource::new(dir.path().join("absent"));

        assert!(source.fetch_batch(1).await.is_err());
    }
}
