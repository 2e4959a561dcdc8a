use std::path::Path;

use intake_core::config::{AppConfig, LlmProvider, LoadOptions};
use serde::Serialize;

use crate::commands::{connect, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["required_fields", "database_connectivity", "spool_directories", "llm_settings"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_required_fields(&config));
            checks.push(check_database_connectivity(&config));
            checks.push(check_spool_directories(&config));
            checks.push(check_llm_settings(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_required_fields(config: &AppConfig) -> DoctorCheck {
    match config.schema() {
        Ok(schema) => DoctorCheck {
            name: "required_fields",
            status: CheckStatus::Pass,
            details: format!("{} field(s): {}", schema.len(), schema.fields().join(", ")),
        },
        Err(error) => {
            DoctorCheck {
                name: "required_fields",
                status: CheckStatus::Fail,
                details: error.to_string(),
            }
        }
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(config).await.map_err(|(_, message, _)| message)?;
        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected and migrated using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn check_spool_directories(config: &AppConfig) -> DoctorCheck {
    let dirs = [config.transport.inbox_dir.as_path(), config.transport.outbox_dir.as_path()];
    let missing: Vec<&Path> = dirs
        .into_iter()
        .filter(|dir| !dir.is_dir())
        .collect();

    if missing.is_empty() {
        DoctorCheck {
            name: "spool_directories",
            status: CheckStatus::Pass,
            details: format!(
                "inbox `{}` and outbox `{}` exist",
                config.transport.inbox_dir.display(),
                config.transport.outbox_dir.display()
            ),
        }
    } else {
        let listed = missing.iter().map(|dir| format!("`{}`", dir.display())).collect::<Vec<_>>();
        DoctorCheck {
            name: "spool_directories",
            status: CheckStatus::Fail,
            details: format!("missing director(ies): {}", listed.join(", ")),
        }
    }
}

fn check_llm_settings(config: &AppConfig) -> DoctorCheck {
    let endpoint = config.llm.base_url.as_deref().unwrap_or("provider default");
    let key_state = match config.llm.provider {
        LlmProvider::OpenAi => "api key present",
        LlmProvider::Ollama => "no api key required",
    };

    DoctorCheck {
        name: "llm_settings",
        status: CheckStatus::Pass,
        details: format!(
            "{} model `{}` at {endpoint}, {key_state}",
            config.llm.provider.as_str(),
            config.llm.model
        ),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
