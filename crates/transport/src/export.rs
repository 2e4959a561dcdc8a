use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use intake_core::domain::schema::FieldSchema;
use intake_core::errors::SinkError;
use intake_core::ports::{ExportSink, ExportSnapshot};

pub const CORRESPONDENT_COLUMN: &str = "correspondent";

/// Full-overwrite CSV export: header `correspondent` then the schema fields,
/// one row per correspondent in id order, missing values as empty cells.
/// The file is written next to its target and renamed into place.
#[derive(Clone, Debug)]
pub struct CsvExportSink {
    path: PathBuf,
}

impl CsvExportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique per write so concurrent writers never share a staging file.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export.csv".to_string());
        self.path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
    }
}

pub fn render_csv(schema: &FieldSchema, records: &ExportSnapshot) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let header =
        std::iter::once(CORRESPONDENT_COLUMN).chain(schema.fields().iter().map(String::as_str));
    writer.write_record(header).map_err(|error| SinkError::Export(error.to_string()))?;

    for (correspondent, record) in records {
        let row = std::iter::once(correspondent.as_str())
            .chain(schema.fields().iter().map(|field| record.get(field).unwrap_or("")));
        writer.write_record(row).map_err(|error| SinkError::Export(error.to_string()))?;
    }

    writer.into_inner().map_err(|error| SinkError::Export(error.to_string()))
}

#[async_trait]
impl ExportSink for CsvExportSink {
    async fn write(&self, schema: &FieldSchema, records: &ExportSnapshot) -> Result<(), SinkError> {
        let bytes = render_csv(schema, records)?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| SinkError::Export(format!("{}: {error}", parent.display())))?;
        }

        let staged = self.staging_path();
        fs::write(&staged, bytes)
            .await
            .map_err(|error| SinkError::Export(format!("{}: {error}", staged.display())))?;
        fs::rename(&staged, &self.path).await.map_err(|error| {
            SinkError::Export(format!("{} -> {}: {error}", staged.display(), self.path.display()))
        })?;

        info!(
            event_name = "intake.export.written",
            path = %self.path.display(),
            rows = records.len(),
            "snapshot export written"
        );
        Ok(())
    }
}
