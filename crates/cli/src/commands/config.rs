use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use intake_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let entries: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "INTAKE_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "INTAKE_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "INTAKE_DATABASE_TIMEOUT_SECS",
        ),
        ("llm.provider", config.llm.provider.as_str().to_string(), "INTAKE_LLM_PROVIDER"),
        ("llm.model", config.llm.model.clone(), "INTAKE_LLM_MODEL"),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "INTAKE_LLM_BASE_URL",
        ),
        ("llm.api_key", llm_api_key.to_string(), "INTAKE_LLM_API_KEY"),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), "INTAKE_LLM_TIMEOUT_SECS"),
        ("llm.max_retries", config.llm.max_retries.to_string(), "INTAKE_LLM_MAX_RETRIES"),
        (
            "intake.required_fields",
            config.intake.required_fields.join(","),
            "INTAKE_REQUIRED_FIELDS",
        ),
        ("intake.batch_size", config.intake.batch_size.to_string(), "INTAKE_BATCH_SIZE"),
        (
            "intake.max_concurrency",
            config.intake.max_concurrency.to_string(),
            "INTAKE_MAX_CONCURRENCY",
        ),
        (
            "intake.poll_interval_secs",
            config.intake.poll_interval_secs.to_string(),
            "INTAKE_POLL_INTERVAL_SECS",
        ),
        (
            "transport.inbox_dir",
            config.transport.inbox_dir.display().to_string(),
            "INTAKE_TRANSPORT_INBOX_DIR",
        ),
        (
            "transport.outbox_dir",
            config.transport.outbox_dir.display().to_string(),
            "INTAKE_TRANSPORT_OUTBOX_DIR",
        ),
        (
            "transport.sender_name",
            config.transport.sender_name.clone(),
            "INTAKE_TRANSPORT_SENDER_NAME",
        ),
        ("export.path", config.export.path.display().to_string(), "INTAKE_EXPORT_PATH"),
        (
            "export.interval_secs",
            config.export.interval_secs.to_string(),
            "INTAKE_EXPORT_INTERVAL_SECS",
        ),
        ("server.bind_address", config.server.bind_address.clone(), "INTAKE_SERVER_BIND_ADDRESS"),
        (
            "server.health_check_port",
            config.server.health_check_port.to_string(),
            "INTAKE_SERVER_HEALTH_CHECK_PORT",
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            "INTAKE_LOGGING_LEVEL",
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            "INTAKE_LOGGING_FORMAT",
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in entries {
        lines.push(render_line(
            key,
            &value,
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref()),
        ));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("intake.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/intake.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let mut candidates = std::iter::once(env_key).chain(short_alias(env_key));
    if let Some(env_key) = candidates.find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn short_alias(env_key: &str) -> Option<&'static str> {
    match env_key {
        "INTAKE_LOGGING_LEVEL" => Some("INTAKE_LOG_LEVEL"),
        "INTAKE_LOGGING_FORMAT" => Some("INTAKE_LOG_FORMAT"),
        _ => None,
    }
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
