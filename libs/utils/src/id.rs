//! Identifiers used across the catalog: timeline IDs and backup IDs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, TimeZone};

/// A PostgreSQL timeline identifier: a 1-based counter, incremented every
/// time a recovery creates a new branch of history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TimelineId(pub u32);

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimelineId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TimelineId(s.parse()?))
    }
}

/// A backup's catalog key: the second-precision time its backup started.
///
/// Persisted and displayed as `YYYYMMDD/HHMMSS`, which doubles as the
/// relative directory path of the backup inside `$BACKUP_PATH`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(DateTime<Local>);

impl BackupId {
    pub fn new(time: DateTime<Local>) -> Self {
        // truncate to second precision: this is the catalog key.
        BackupId(time.with_nanosecond_truncated())
    }

    pub fn now() -> Self {
        BackupId::new(Local::now())
    }

    pub fn time(self) -> DateTime<Local> {
        self.0
    }

    pub fn dir_name(self) -> String {
        format!("{}/{}", self.0.format("%Y%m%d"), self.0.format("%H%M%S"))
    }
}

trait TruncateNanos {
    fn with_nanosecond_truncated(self) -> Self;
}

impl TruncateNanos for DateTime<Local> {
    fn with_nanosecond_truncated(self) -> Self {
        use chrono::Timelike;
        self.with_nanosecond(0).unwrap()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid backup id {0:?}: expected YYYYMMDD/HHMMSS")]
pub struct BackupIdParseError(String);

impl FromStr for BackupId {
    type Err = BackupIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BackupIdParseError(s.to_string());
        let (ymd, hms) = s.split_once('/').ok_or_else(bad)?;
        let combined = format!("{ymd}{hms}");
        let naive = chrono::NaiveDateTime::parse_from_str(&combined, "%Y%m%d%H%M%S")
            .map_err(|_| bad())?;
        let local = Local
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(bad)?;
        Ok(BackupId(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_roundtrips_through_dir_name() {
        let id = BackupId::now();
        let s = id.dir_name();
        let parsed: BackupId = s.parse().unwrap();
        assert_eq!(parsed.dir_name(), s);
    }

    #[test]
    fn backup_id_orders_by_time() {
        let a: BackupId = "20240101/120000".parse().unwrap();
        let b: BackupId = "20240101/130000".parse().unwrap();
        assert!(a < b);
    }
}
