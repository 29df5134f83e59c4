//! Tabsplit application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the store
//! 4. Run one maintenance command and print its result as JSON

mod cli;

use clap::Parser;
use serde::Serialize;

use tabsplit_core::config::TabsplitConfig;
use tabsplit_storage::Vault;

use cli::{CliArgs, Command};

type AppResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(vault: &Vault, command: Command) -> AppResult<()> {
    match command {
        Command::Stats => {
            let stats = vault.queries().storage_stats().await?;
            print_json(&stats)?;
            let quota = vault.retention().check_quota().await?;
            if quota.warning {
                tracing::warn!(
                    used_bytes = quota.used_bytes,
                    quota_bytes = ?quota.quota_bytes,
                    "Storage is close to its quota"
                );
            }
        }
        Command::Export(args) => {
            let options = args.options(chrono::Utc::now());
            let json = vault.transfer().export_json(options).await?;
            std::fs::write(&args.output, json)?;
            tracing::info!(path = %args.output.display(), "Snapshot written");
        }
        Command::Import(args) => {
            let text = std::fs::read_to_string(&args.file)?;
            let report = vault.transfer().import_json(&text, args.options()).await?;
            print_json(&report)?;
        }
        Command::Cleanup(args) => match args.options() {
            Some(options) => print_json(&vault.retention().run(options).await?)?,
            None => match vault.retention().run_scheduled().await? {
                Some(report) => print_json(&report)?,
                None => tracing::info!("Automatic cleanup is disabled in settings"),
            },
        },
        Command::Check => {
            let report = vault.retention().integrity_check().await?;
            if !report.is_clean() {
                tracing::warn!(
                    orphan_images = report.orphan_images.len(),
                    dangling_references = report.dangling_references.len(),
                    "Integrity problems found"
                );
            }
            print_json(&report)?;
        }
        Command::Settings => {
            print_json(&vault.settings().get().await)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = TabsplitConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing. RUST_LOG takes precedence over the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::debug!("Tabsplit v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    let db_path = config.database_path();
    let vault = Vault::from_config(&config);
    if let Err(e) = vault.connect().await {
        tracing::error!(path = %db_path.display(), error = %e, "Failed to open store");
        return Err(e.into());
    }

    run(&vault, args.command).await
}
