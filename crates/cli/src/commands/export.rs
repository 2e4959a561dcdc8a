use std::path::PathBuf;

use intake_core::ports::ExportSink;
use intake_db::ConversationStore;
use intake_transport::CsvExportSink;
use serde_json::json;

use crate::commands::{load_config, open_store, runtime, CommandFailure, CommandResult};

pub fn run(output: Option<PathBuf>) -> CommandResult {
    let config = match load_config("export") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("export") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let sink = CsvExportSink::new(output.unwrap_or_else(|| config.export.path.clone()));

    let result = runtime.block_on(async {
        let (pool, store) = open_store(&config).await?;
        let schema =
            config.schema().map_err(|error| ("config_validation", error.to_string(), 2u8))?;
        let snapshot = store
            .snapshot_all()
            .await
            .map_err(|error| ("persistence", error.to_string(), 6u8))?;
        sink.write(&schema, &snapshot).await.map_err(|error| ("export", error.to_string(), 7u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(snapshot.len())
    });

    match result {
        Ok(rows) => CommandResult::success_with_data(
            "export",
            format!("wrote {rows} record(s) to {}", sink.path().display()),
            Some(json!({ "path": sink.path().display().to_string(), "rows": rows })),
        ),
        Err(failure) => CommandResult::from_failure("export", failure),
    }
}
