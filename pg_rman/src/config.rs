//! The key/value configuration blob (§9 "Dynamic-style config object").
//! Ingesting it from a CLI + config file is an external collaborator per
//! the scope note in §1; what lives here is the struct itself and a small
//! loader tolerant of unknown keys, in the same `KEY=VALUE` style as
//! `backup.ini` (§4.6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::backup_record::BackupMode;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pgdata: PathBuf,
    pub arclog_path: PathBuf,
    pub srvlog_path: Option<PathBuf>,
    pub backup_path: PathBuf,
    pub pgconf_path: Option<PathBuf>,
    /// Path to the user blacklist file (§4.4): one skip-pattern per line,
    /// `#`-comments allowed, joined against the data-directory root. Lives
    /// under the catalog by convention (e.g. `$BACKUP_PATH/pgrman.blacklist`).
    pub blacklist_path: Option<PathBuf>,
    /// libpq connection string used to reach the cluster for
    /// `pg_backup_start`/`pg_backup_stop` (§1 scope: ingesting this from the
    /// environment/CLI is an external concern, the field itself is not).
    pub connstr: Option<String>,

    pub mode: BackupMode,
    pub with_serverlog: bool,
    pub compress_data: bool,
    pub smooth_checkpoint: bool,
    pub full_backup_on_error: bool,

    pub standby_host: Option<String>,
    pub standby_port: Option<u16>,

    pub keep_data_days: Option<u32>,
    pub keep_data_generations: Option<u32>,

    pub recovery_target_time: Option<String>,
    pub recovery_target_xid: Option<String>,
    pub recovery_target_inclusive: Option<bool>,
    pub recovery_target_timeline: Option<String>,
    pub recovery_target_action: Option<String>,
    pub hard_copy: bool,
}

impl Config {
    /// Parse a `pg_rman.ini`-style `KEY=VALUE` blob. Unknown keys are
    /// collected as warnings instead of failing the load, matching the
    /// forward-compatibility rule for `backup.ini` (§3.2 invariant 7).
    pub fn from_str(text: &str, warnings: &mut Vec<String>) -> Self {
        let mut raw = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                raw.insert(k.trim().to_ascii_uppercase(), v.trim().to_string());
            }
        }

        let mut cfg = Config::default();
        let mut take = |key: &str| raw.remove(key);

        if let Some(v) = take("PGDATA") {
            cfg.pgdata = PathBuf::from(v);
        }
        if let Some(v) = take("ARCLOG_PATH") {
            cfg.arclog_path = PathBuf::from(v);
        }
        if let Some(v) = take("SRVLOG_PATH") {
            cfg.srvlog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = take("BACKUP_PATH") {
            cfg.backup_path = PathBuf::from(v);
        }
        if let Some(v) = take("PGCONF_PATH") {
            cfg.pgconf_path = Some(PathBuf::from(v));
        }
        if let Some(v) = take("BLACKLIST_PATH") {
            cfg.blacklist_path = Some(PathBuf::from(v));
        }
        if let Some(v) = take("CONNSTR") {
            cfg.connstr = Some(v);
        }
        if let Some(v) = take("BACKUP_MODE") {
            cfg.mode = v.parse().unwrap_or_default();
        }
        if let Some(v) = take("WITH_SERVERLOG") {
            cfg.with_serverlog = parse_bool(&v);
        }
        if let Some(v) = take("COMPRESS_DATA") {
            cfg.compress_data = parse_bool(&v);
        }
        if let Some(v) = take("SMOOTH_CHECKPOINT") {
            cfg.smooth_checkpoint = parse_bool(&v);
        }
        if let Some(v) = take("FULL_BACKUP_ON_ERROR") {
            cfg.full_backup_on_error = parse_bool(&v);
        }
        if let Some(v) = take("STANDBY_HOST") {
            cfg.standby_host = Some(v);
        }
        if let Some(v) = take("STANDBY_PORT") {
            cfg.standby_port = v.parse().ok();
        }
        if let Some(v) = take("KEEP_DATA_DAYS") {
            cfg.keep_data_days = v.parse().ok();
        }
        if let Some(v) = take("KEEP_DATA_GENERATIONS") {
            cfg.keep_data_generations = v.parse().ok();
        }
        if let Some(v) = take("RECOVERY_TARGET_TIME") {
            cfg.recovery_target_time = Some(v);
        }
        if let Some(v) = take("RECOVERY_TARGET_XID") {
            cfg.recovery_target_xid = Some(v);
        }
        if let Some(v) = take("RECOVERY_TARGET_INCLUSIVE") {
            cfg.recovery_target_inclusive = Some(parse_bool(&v));
        }
        if let Some(v) = take("RECOVERY_TARGET_TIMELINE") {
            cfg.recovery_target_timeline = Some(v);
        }
        if let Some(v) = take("RECOVERY_TARGET_ACTION") {
            cfg.recovery_target_action = Some(v);
        }
        if let Some(v) = take("HARD_COPY") {
            cfg.hard_copy = parse_bool(&v);
        }

        for unknown in raw.keys() {
            warnings.push(format!("unknown configuration key ignored: {unknown}"));
        }

        cfg
    }

    pub fn load(path: &Path, warnings: &mut Vec<String>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_str(&text, warnings))
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_warn_instead_of_failing() {
        let mut warnings = Vec::new();
        let cfg = Config::from_str(
            "BACKUP_PATH=/var/backup\nSOME_FUTURE_KEY=123\n",
            &mut warnings,
        );
        assert_eq!(cfg.backup_path, PathBuf::from("/var/backup"));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("SOME_FUTURE_KEY"));
    }

    #[test]
    fn blacklist_path_is_loaded_from_config() {
        let mut warnings = Vec::new();
        let cfg = Config::from_str("BACKUP_PATH=/var/backup\nBLACKLIST_PATH=/var/backup/pgrman.blacklist\n", &mut warnings);
        assert_eq!(cfg.blacklist_path, Some(PathBuf::from("/var/backup/pgrman.blacklist")));
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("no"));
    }
}
