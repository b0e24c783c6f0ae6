//! Command-line surface: `backup`, `restore`, `show`, `validate`, `delete`,
//! and `init`, each a thin driver over the orchestrators and catalog.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};

use crate::backup_record::BackupMode;
use utils::id::{BackupId, TimelineId};

#[derive(Parser)]
#[command(name = "pg_rman", about = "Online physical backup and PITR for a PostgreSQL-compatible cluster", version)]
pub struct Cli {
    /// Path to a `pg_rman.ini`-style config file, overridden by any flag
    /// given alongside it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub backup_path: Option<PathBuf>,

    #[arg(long, global = true)]
    pub pgdata: Option<PathBuf>,

    #[arg(long, global = true)]
    pub arclog_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Take one backup of the cluster at `--pgdata`.
    Backup {
        #[arg(long, value_enum)]
        mode: Option<CliBackupMode>,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        smooth_checkpoint: bool,
        #[arg(long)]
        with_serverlog: bool,
    },
    /// Restore the base + incremental chain covering a recovery target.
    Restore {
        #[arg(long)]
        timeline: Option<u32>,
        #[arg(long)]
        target_time: Option<String>,
        #[arg(long)]
        target_xid: Option<u64>,
        #[arg(long)]
        target_inclusive: Option<bool>,
        #[arg(long)]
        target_action: Option<String>,
        #[arg(long)]
        hard_copy: bool,
    },
    /// List every backup in the catalog.
    Show,
    /// Check a backup's files against their recorded CRCs.
    Validate { backup_id: String },
    /// Remove a backup and its files from the catalog. Either a single
    /// `backup_id`, or `--before` to purge every backup older than a
    /// retention cutoff while keeping whatever a newer restore still needs.
    Delete {
        backup_id: Option<String>,
        #[arg(long, conflicts_with = "backup_id")]
        before: Option<String>,
    },
    /// Create an empty catalog at `--backup-path`.
    Init,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliBackupMode {
    Full,
    Incremental,
    Archive,
}

impl From<CliBackupMode> for BackupMode {
    fn from(m: CliBackupMode) -> Self {
        match m {
            CliBackupMode::Full => BackupMode::Full,
            CliBackupMode::Incremental => BackupMode::Incremental,
            CliBackupMode::Archive => BackupMode::Archive,
        }
    }
}

pub fn parse_backup_id(s: &str) -> anyhow::Result<BackupId> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("invalid backup id {s:?}: {e}"))
}

pub fn parse_target_time(s: &str) -> anyhow::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| anyhow::anyhow!("invalid --target-time {s:?}: {e}"))
}

/// §4.8 `newestOnDisk(start)`: when `--timeline` isn't given, restore
/// targets the newest timeline this catalog's archive directory actually
/// has history for, not hardcoded to `1`.
pub fn default_timeline(arclog_path: &std::path::Path) -> TimelineId {
    crate::timeline::newest_on_disk(arclog_path, TimelineId(1))
}
