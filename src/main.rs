use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use llm_connector::comms::local_api;
use llm_connector::security::credential::{hash_secret, Credential};
use llm_connector::utils;

#[derive(Parser)]
#[command(name = "llm-connector", version, about = "Scoped read access for LLM agents")]
struct AppCli {
    /// Settings file path
    #[arg(short, long, env = "LLM_CONNECTOR_SETTINGS", default_value = "settings.json", global = true)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Append-only audit log (JSON lines)
        #[arg(long, env = "LLM_CONNECTOR_AUDIT_LOG", default_value = "audit.jsonl")]
        audit_log: PathBuf,
    },
    /// Mint a new API key; prints the raw key once and the record to store
    GenerateKey {
        #[arg(long)]
        name: String,
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Print the stored digest of a raw key
    HashKey { raw: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    match args.command {
        Commands::Serve { port, audit_log } => {
            info!(settings = %args.settings.display(), audit_log = %audit_log.display(), "starting llm-connector {}", llm_connector::VERSION);
            local_api::serve(&args.settings, &audit_log, port).await?;
        }
        Commands::GenerateKey {
            name,
            expires_in_days,
        } => {
            let expires_at = match expires_in_days {
                Some(days) if days <= 0 => bail!("--expires-in-days must be positive"),
                Some(days) => Some(Utc::now() + Duration::days(days)),
                None => None,
            };
            let (credential, raw) = Credential::issue(&name, expires_at);
            println!("API key (shown once): {raw}");
            println!("{}", serde_json::to_string_pretty(&credential)?);
        }
        Commands::HashKey { raw } => {
            println!("{}", hash_secret(&raw));
        }
    }

    Ok(())
}
