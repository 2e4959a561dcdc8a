pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "intake",
    about = "Supplier intake operator CLI",
    long_about = "Operate the supplier intake store: migrations, config inspection, readiness checks, exports and conversation status.",
    after_help = "Examples:\n  intake doctor --json\n  intake status --correspondent sales@acme.test\n  intake export --output /tmp/products.csv"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, spool directories and LLM settings")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Write a full snapshot of every record to the CSV export")]
    Export {
        #[arg(long, help = "Write to this path instead of the configured export path")]
        output: Option<PathBuf>,
    },
    #[command(about = "Show known and missing fields per correspondent")]
    Status {
        #[arg(long, help = "Only show this correspondent (any sender form is accepted)")]
        correspondent: Option<String>,
    },
    #[command(about = "List replies that are still pending or failed delivery")]
    Deliveries,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Export { output } => commands::export::run(output),
        Command::Status { correspondent } => commands::status::run(correspondent.as_deref()),
        Command::Deliveries => commands::deliveries::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
