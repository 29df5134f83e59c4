//! CLI argument definitions for the `tabsplit` maintenance tool.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};

use tabsplit_core::types::DateRange;
use tabsplit_storage::{CleanupOptions, ExportOptions, ImportOptions};

/// Tabsplit - inspect and maintain the local receipt-split store.
#[derive(Parser, Debug)]
#[command(name = "tabsplit", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the database file.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print record counts and sizes.
    Stats,
    /// Write a JSON snapshot of the store.
    Export(ExportArgs),
    /// Load a JSON snapshot into the store.
    Import(ImportArgs),
    /// Remove old calculations and orphaned images.
    Cleanup(CleanupArgs),
    /// Report orphaned images and dangling image references.
    Check,
    /// Print the stored settings.
    Settings,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// File to write the snapshot to.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Include image bytes.
    #[arg(long = "with-images")]
    pub with_images: bool,

    /// Only calculations created on or after this day (YYYY-MM-DD).
    #[arg(long = "from")]
    pub from: Option<NaiveDate>,

    /// Only calculations created on or before this day (YYYY-MM-DD).
    #[arg(long = "to")]
    pub to: Option<NaiveDate>,
}

impl ExportArgs {
    pub fn options(&self, now: DateTime<Utc>) -> ExportOptions {
        let date_range = if self.from.is_none() && self.to.is_none() {
            None
        } else {
            let from = self
                .from
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|start| start.and_utc())
                .unwrap_or(DateTime::UNIX_EPOCH);
            let to = self
                .to
                .and_then(|day| day.and_hms_milli_opt(23, 59, 59, 999))
                .map(|end| end.and_utc())
                .unwrap_or(now);
            Some(DateRange::new(from, to))
        };
        ExportOptions {
            include_images: self.with_images,
            date_range,
        }
    }
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Snapshot file produced by `export`.
    pub file: PathBuf,

    /// Replace records that already exist.
    #[arg(long = "overwrite")]
    pub overwrite: bool,

    #[arg(long = "no-calculations")]
    pub no_calculations: bool,

    #[arg(long = "no-images")]
    pub no_images: bool,

    #[arg(long = "no-templates")]
    pub no_templates: bool,

    #[arg(long = "no-settings")]
    pub no_settings: bool,
}

impl ImportArgs {
    pub fn options(&self) -> ImportOptions {
        ImportOptions {
            calculations: !self.no_calculations,
            images: !self.no_images,
            templates: !self.no_templates,
            settings: !self.no_settings,
            overwrite_existing: self.overwrite,
        }
    }
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Remove calculations at least this many days old.
    #[arg(long = "older-than-days")]
    pub older_than_days: Option<u32>,

    /// Keep only the newest N calculations.
    #[arg(long = "max-count")]
    pub max_count: Option<u32>,

    /// Also remove images whose calculation is gone.
    #[arg(long = "orphans")]
    pub orphans: bool,
}

impl CleanupArgs {
    /// `None` when no flag was given, meaning the stored retention policy applies.
    pub fn options(&self) -> Option<CleanupOptions> {
        if self.older_than_days.is_none() && self.max_count.is_none() && !self.orphans {
            return None;
        }
        Some(CleanupOptions {
            older_than_days: self.older_than_days,
            max_calculations: self.max_count,
            reclaim_orphans: self.orphans,
        })
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TABSPLIT_CONFIG env var > ~/.tabsplit/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TABSPLIT_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --data-dir flag > TABSPLIT_DATA_DIR env var. `None` leaves
    /// the config file value in place.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .or_else(|| env_override("TABSPLIT_DATA_DIR"))
    }

    /// Priority: --log-level flag > TABSPLIT_LOG_LEVEL env var.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level
            .clone()
            .or_else(|| env_override("TABSPLIT_LOG_LEVEL"))
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tabsplit").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tabsplit").join("config.toml");
    }
    PathBuf::from("config.toml")
}
