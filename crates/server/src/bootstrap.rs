use std::sync::Arc;
use std::time::Duration;

use intake_agent::{
    HttpLlmClient, IntakeComponents, IntakeLoop, IntakeSettings, LlmClarificationGenerator,
    LlmClient, LlmExtractionOracle,
};
use intake_core::audit::TracingAuditSink;
use intake_core::config::{AppConfig, ConfigError, LoadOptions};
use intake_core::errors::InboundError;
use intake_db::{connect_with_settings, migrations, DbPool, SqlConversationStore};
use intake_transport::{CsvExportSink, OutboxMessageSink, SpoolDirSource};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub intake: IntakeLoop,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    LlmClient(String),
    #[error("spool directories could not be prepared: {0}")]
    Spool(#[source] InboundError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "intake.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let schema = config.schema()?;

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "intake.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "intake.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::from_config(&config.llm)
            .map_err(|error| BootstrapError::LlmClient(error.to_string()))?,
    );
    let oracle_timeout = Duration::from_secs(config.llm.timeout_secs);

    let source = SpoolDirSource::new(&config.transport.inbox_dir);
    source.ensure_dirs().await.map_err(BootstrapError::Spool)?;

    let components = IntakeComponents {
        store: Arc::new(SqlConversationStore::new(db_pool.clone(), schema.clone())),
        oracle: Arc::new(LlmExtractionOracle::new(llm.clone(), oracle_timeout)),
        generator: Arc::new(LlmClarificationGenerator::new(llm, oracle_timeout)),
        source: Arc::new(source),
        messages: Arc::new(OutboxMessageSink::new(
            &config.transport.outbox_dir,
            config.transport.sender_name.clone(),
        )),
        exports: Arc::new(CsvExportSink::new(&config.export.path)),
        audit: Arc::new(TracingAuditSink),
    };
    let intake = IntakeLoop::new(schema, components, IntakeSettings::from_config(&config));

    info!(
        event_name = "intake.bootstrap.ready",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        required_fields = %config.intake.required_fields.join(","),
        inbox_dir = %config.transport.inbox_dir.display(),
        export_path = %config.export.path.display(),
        "intake loop wired"
    );

    Ok(Application { config, db_pool, intake })
}
