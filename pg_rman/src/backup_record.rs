//! The `Backup` entity (C6): one backup's metadata and status, persisted as
//! the `KEY=VALUE` lines of `backup.ini` (§6.5).

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local};
use ini::Ini;
use utils::id::{BackupId, TimelineId};
use utils::lsn::Lsn;

use crate::error::{RmanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupMode {
    #[default]
    Full,
    Incremental,
    Archive,
}

impl BackupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Full => "FULL",
            BackupMode::Incremental => "INCREMENTAL",
            BackupMode::Archive => "ARCHIVE",
        }
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "INCREMENTAL" => Ok(BackupMode::Incremental),
            "ARCHIVE" => Ok(BackupMode::Archive),
            other => Err(format!("unknown backup mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Invalid,
    Running,
    Ok,
    Done,
    Error,
    Deleting,
    Deleted,
    Corrupt,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Ok => "OK",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INVALID" => Ok(BackupStatus::Invalid),
            "RUNNING" => Ok(BackupStatus::Running),
            "OK" => Ok(BackupStatus::Ok),
            "DONE" => Ok(BackupStatus::Done),
            "ERROR" => Ok(BackupStatus::Error),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            other => Err(format!("unknown backup status {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub id: BackupId,
    pub mode: BackupMode,
    pub status: BackupStatus,

    pub with_serverlog: bool,
    pub compressed: bool,
    pub full_backup_on_error: bool,

    pub timeline_id: TimelineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,

    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub recovery_time: Option<DateTime<Local>>,
    pub recovery_xid: Option<u64>,

    pub total_data_bytes: i64,
    pub read_data_bytes: i64,
    pub read_arclog_bytes: i64,
    pub read_srvlog_bytes: i64,
    pub write_bytes: i64,

    pub block_size: u32,
    pub wal_block_size: u32,
}

impl Backup {
    pub fn new_running(id: BackupId, mode: BackupMode, timeline_id: TimelineId) -> Self {
        Backup {
            id,
            mode,
            status: BackupStatus::Running,
            with_serverlog: false,
            compressed: false,
            full_backup_on_error: false,
            timeline_id,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time: id.time(),
            end_time: None,
            recovery_time: None,
            recovery_xid: None,
            total_data_bytes: 0,
            read_data_bytes: 0,
            read_arclog_bytes: 0,
            read_srvlog_bytes: 0,
            write_bytes: 0,
            block_size: 0,
            wal_block_size: 0,
        }
    }

    const TIME_FMT: &'static str = "%Y-%m-%d %H:%M:%S%z";

    pub fn to_ini_string(&self) -> String {
        let mut ini = Ini::new();
        {
            let section = ini.with_general_section();
            section.set("BACKUP_MODE", self.mode.as_str());
            section.set(
                "FULL_BACKUP_ON_ERROR",
                bool_str(self.full_backup_on_error),
            );
            section.set("WITH_SERVERLOG", bool_str(self.with_serverlog));
            section.set("COMPRESS_DATA", bool_str(self.compressed));
            section.set("TIMELINEID", self.timeline_id.to_string());
            section.set("START_LSN", self.start_lsn.to_string());
            section.set("STOP_LSN", self.stop_lsn.to_string());
            section.set("START_TIME", self.start_time.format(Self::TIME_FMT).to_string());
            if let Some(t) = self.end_time {
                section.set("END_TIME", t.format(Self::TIME_FMT).to_string());
            }
            if let Some(xid) = self.recovery_xid {
                section.set("RECOVERY_XID", xid.to_string());
            }
            if let Some(t) = self.recovery_time {
                section.set("RECOVERY_TIME", t.format(Self::TIME_FMT).to_string());
            }
            section.set("TOTAL_DATA_BYTES", self.total_data_bytes.to_string());
            section.set("READ_DATA_BYTES", self.read_data_bytes.to_string());
            section.set("READ_ARCLOG_BYTES", self.read_arclog_bytes.to_string());
            section.set("READ_SRVLOG_BYTES", self.read_srvlog_bytes.to_string());
            section.set("WRITE_BYTES", self.write_bytes.to_string());
            section.set("BLOCK_SIZE", self.block_size.to_string());
            section.set("XLOG_BLOCK_SIZE", self.wal_block_size.to_string());
            section.set("STATUS", self.status.as_str());
        }
        let mut buf = Vec::new();
        ini.write_to(&mut buf).expect("writing to an in-memory buffer cannot fail");
        String::from_utf8(buf).expect("ini writer only emits UTF-8")
    }

    pub fn write_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let text = self.to_ini_string();
        let tmp = path.with_extension("ini.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Parse a `backup.ini` file. `id` comes from the directory name, not
    /// from inside the file. Missing required keys are reported as
    /// `Corrupted`; unknown keys are warned about and ignored (§3.2
    /// invariant 7).
    pub fn read_from_file(path: &Path, id: BackupId, warnings: &mut Vec<String>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RmanError::Corrupted(format!("{}: {e}", path.display())))?;
        Self::parse(&text, id, warnings)
    }

    pub fn parse(text: &str, id: BackupId, warnings: &mut Vec<String>) -> Result<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| RmanError::Corrupted(format!("invalid backup.ini: {e}")))?;
        let section = ini.general_section();

        let bad = |key: &str| RmanError::Corrupted(format!("backup.ini missing required key {key}"));
        let get = |key: &str| section.get(key).ok_or_else(|| bad(key));

        let mode: BackupMode = get("BACKUP_MODE")?
            .parse()
            .map_err(RmanError::Corrupted)?;
        let status: BackupStatus = get("STATUS")?.parse().map_err(RmanError::Corrupted)?;
        let timeline_id = TimelineId(
            get("TIMELINEID")?
                .parse()
                .map_err(|_| RmanError::Corrupted("bad TIMELINEID".into()))?,
        );
        let start_lsn: Lsn = get("START_LSN")?
            .parse()
            .map_err(|_| RmanError::Corrupted("bad START_LSN".into()))?;
        let stop_lsn: Lsn = get("STOP_LSN")?
            .parse()
            .map_err(|_| RmanError::Corrupted("bad STOP_LSN".into()))?;
        let start_time = parse_time(get("START_TIME")?)?;
        let end_time = section.get("END_TIME").map(parse_time).transpose()?;
        let recovery_time = section.get("RECOVERY_TIME").map(parse_time).transpose()?;
        let recovery_xid = section.get("RECOVERY_XID").and_then(|v| v.parse().ok());

        let backup = Backup {
            id,
            mode,
            status,
            with_serverlog: section.get("WITH_SERVERLOG").map(bool_val).unwrap_or(false),
            compressed: section.get("COMPRESS_DATA").map(bool_val).unwrap_or(false),
            full_backup_on_error: section
                .get("FULL_BACKUP_ON_ERROR")
                .map(bool_val)
                .unwrap_or(false),
            timeline_id,
            start_lsn,
            stop_lsn,
            start_time,
            end_time,
            recovery_time,
            recovery_xid,
            total_data_bytes: section.get("TOTAL_DATA_BYTES").and_then(|v| v.parse().ok()).unwrap_or(0),
            read_data_bytes: section.get("READ_DATA_BYTES").and_then(|v| v.parse().ok()).unwrap_or(0),
            read_arclog_bytes: section.get("READ_ARCLOG_BYTES").and_then(|v| v.parse().ok()).unwrap_or(0),
            read_srvlog_bytes: section.get("READ_SRVLOG_BYTES").and_then(|v| v.parse().ok()).unwrap_or(0),
            write_bytes: section.get("WRITE_BYTES").and_then(|v| v.parse().ok()).unwrap_or(0),
            block_size: section.get("BLOCK_SIZE").and_then(|v| v.parse().ok()).unwrap_or(0),
            wal_block_size: section.get("XLOG_BLOCK_SIZE").and_then(|v| v.parse().ok()).unwrap_or(0),
        };

        const KNOWN: &[&str] = &[
            "BACKUP_MODE", "FULL_BACKUP_ON_ERROR", "WITH_SERVERLOG", "COMPRESS_DATA",
            "TIMELINEID", "START_LSN", "STOP_LSN", "START_TIME", "END_TIME", "RECOVERY_XID",
            "RECOVERY_TIME", "TOTAL_DATA_BYTES", "READ_DATA_BYTES", "READ_ARCLOG_BYTES",
            "READ_SRVLOG_BYTES", "WRITE_BYTES", "BLOCK_SIZE", "XLOG_BLOCK_SIZE", "STATUS",
        ];
        for (key, _) in section.iter() {
            if !KNOWN.contains(&key) {
                warnings.push(format!("unknown backup.ini key ignored: {key}"));
            }
        }

        Ok(backup)
    }

    pub fn is_mutating_state(&self) -> bool {
        matches!(self.status, BackupStatus::Running | BackupStatus::Deleting)
    }
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

fn bool_val(s: &str) -> bool {
    matches!(s, "true" | "1" | "yes")
}

fn parse_time(s: &str) -> Result<DateTime<Local>> {
    DateTime::parse_from_str(s, Backup::TIME_FMT)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| RmanError::Corrupted(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_ini() {
        let id = BackupId::now();
        let mut backup = Backup::new_running(id, BackupMode::Full, TimelineId(1));
        backup.status = BackupStatus::Done;
        backup.start_lsn = Lsn(0x1000);
        backup.stop_lsn = Lsn(0x2000);
        backup.block_size = 8192;

        let text = backup.to_ini_string();
        let mut warnings = Vec::new();
        let parsed = Backup::parse(&text, id, &mut warnings).unwrap();

        assert!(warnings.is_empty());
        assert_eq!(parsed.mode, BackupMode::Full);
        assert_eq!(parsed.status, BackupStatus::Done);
        assert_eq!(parsed.start_lsn, Lsn(0x1000));
        assert_eq!(parsed.stop_lsn, Lsn(0x2000));
        assert_eq!(parsed.block_size, 8192);
    }

    #[test]
    fn unknown_keys_warn_not_fail() {
        let id = BackupId::now();
        let backup = Backup::new_running(id, BackupMode::Full, TimelineId(1));
        let mut text = backup.to_ini_string();
        text.push_str("FUTURE_KEY=123\n");

        let mut warnings = Vec::new();
        let parsed = Backup::parse(&text, id, &mut warnings).unwrap();
        assert_eq!(parsed.mode, BackupMode::Full);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn missing_required_key_is_corrupted() {
        let id = BackupId::now();
        let mut warnings = Vec::new();
        let err = Backup::parse("STATUS=OK\n", id, &mut warnings).unwrap_err();
        assert!(matches!(err, RmanError::Corrupted(_)));
    }
}
