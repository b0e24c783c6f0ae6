//! The backup catalog (C7): the on-disk directory of backups under
//! `$BACKUP_PATH`, the advisory lock that keeps it single-writer, and the
//! bookkeeping operations the orchestrators and the `show`/`validate`
//! subcommands drive it through.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use fs2::FileExt;

use utils::id::BackupId;

use crate::backup_record::{Backup, BackupMode, BackupStatus};
use crate::error::{RmanError, Result};

const LOCK_FILE_NAME: &str = "pg_rman.lock";
const BACKUP_INI_NAME: &str = "backup.ini";
const SYSTEM_IDENTIFIER_FILE: &str = "system_identifier";

pub struct Catalog {
    backup_path: PathBuf,
    lock: Option<File>,
}

impl Catalog {
    pub fn new(backup_path: impl Into<PathBuf>) -> Self {
        Catalog {
            backup_path: backup_path.into(),
            lock: None,
        }
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Create an empty catalog directory. Idempotent: calling this against
    /// an already-initialized catalog is a no-op, not an error.
    pub fn init(backup_path: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(backup_path)?;
        Ok(())
    }

    fn dir_for(&self, id: BackupId) -> PathBuf {
        self.backup_path.join(id.dir_name())
    }

    /// Take the catalog's exclusive advisory lock. Held for the lifetime of
    /// the orchestration; a second concurrent `pg_rman` process against the
    /// same `$BACKUP_PATH` observes `AlreadyRunning` rather than blocking
    /// (§5 "single-writer catalog").
    pub fn lock(&mut self) -> Result<()> {
        let path = self.backup_path.join(LOCK_FILE_NAME);
        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.lock = Some(file);
                Ok(())
            }
            Err(_) => Err(RmanError::AlreadyRunning),
        }
    }

    pub fn unlock(&mut self) {
        if let Some(file) = self.lock.take() {
            let _ = file.unlock();
        }
    }

    /// All backups on disk, newest first. Entries whose `backup.ini` fails
    /// to parse are dropped (with a warning) rather than surfaced, per
    /// §4.7: "Corrupted entries are dropped with a warning."
    pub fn list(&self) -> Result<Vec<Backup>> {
        self.list_range(None, None)
    }

    /// Like [`Catalog::list`], filtered to backups whose `start_time` falls
    /// in `[begin, end]` (either bound optional). §4.7 `list(range?)`.
    pub fn list_range(&self, begin: Option<DateTime<Local>>, end: Option<DateTime<Local>>) -> Result<Vec<Backup>> {
        let mut out = Vec::new();
        let read_dir = match fs::read_dir(&self.backup_path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(RmanError::System(e.into())),
        };

        for date_entry in read_dir {
            let date_entry = date_entry.map_err(|e| RmanError::System(e.into()))?;
            if !date_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let date_name = date_entry.file_name().to_string_lossy().into_owned();

            let time_entries = match fs::read_dir(date_entry.path()) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            for time_entry in time_entries {
                let time_entry = time_entry.map_err(|e| RmanError::System(e.into()))?;
                if !time_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let time_name = time_entry.file_name().to_string_lossy().into_owned();
                let dir_name = format!("{date_name}/{time_name}");
                let Ok(id) = dir_name.parse::<BackupId>() else {
                    continue; // not a backup directory (e.g. a stray dotfile)
                };
                match self.get(id) {
                    Ok(backup) => {
                        if begin.is_some_and(|b| backup.start_time < b) || end.is_some_and(|e| backup.start_time > e) {
                            continue;
                        }
                        out.push(backup);
                    }
                    Err(e) => {
                        tracing::warn!(backup = %id, "dropping corrupted backup record: {e}");
                    }
                }
            }
        }

        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    pub fn get(&self, id: BackupId) -> Result<Backup> {
        let path = self.dir_for(id).join(BACKUP_INI_NAME);
        let mut warnings = Vec::new();
        let backup = Backup::read_from_file(&path, id, &mut warnings)?;
        for w in warnings {
            tracing::warn!(backup = %id, "{w}");
        }
        Ok(backup)
    }

    /// Persist `backup`'s current state to its `backup.ini`, creating the
    /// backup's directory on first write.
    pub fn write_record(&self, backup: &Backup) -> Result<()> {
        let dir = self.dir_for(backup.id);
        fs::create_dir_all(&dir)?;
        backup
            .write_to_file(&dir.join(BACKUP_INI_NAME))
            .map_err(RmanError::from)
    }

    pub fn data_dir(&self, id: BackupId) -> PathBuf {
        self.dir_for(id).join("database")
    }

    pub fn manifest_path(&self, id: BackupId) -> PathBuf {
        self.dir_for(id).join("file_database.txt")
    }

    /// The backup's own root directory (`YYYYMMDD/HHMMSS/`), the parent of
    /// `database/`, `arclog/`, `backup.ini`, and `mkdirs.sh`.
    pub fn dir(&self, id: BackupId) -> PathBuf {
        self.dir_for(id)
    }

    /// Check the incoming cluster's page/WAL block sizes against the most
    /// recent non-corrupt backup's recorded ones. A catalog only ever holds
    /// backups of one cluster identity (§3.1 "block_size"/"wal_block_size");
    /// a mismatch means this `$BACKUP_PATH` belongs to a different cluster.
    pub fn verify_identity(&self, block_size: u32, wal_block_size: u32) -> Result<()> {
        let reference = self
            .list()?
            .into_iter()
            .find(|b| b.status != BackupStatus::Corrupt && b.block_size != 0);

        if let Some(backup) = reference {
            if backup.block_size != block_size || backup.wal_block_size != wal_block_size {
                return Err(RmanError::PgIncompatible(format!(
                    "catalog was created against block_size={}, wal_block_size={}, but this \
                     cluster reports block_size={block_size}, wal_block_size={wal_block_size}",
                    backup.block_size, backup.wal_block_size
                )));
            }
        }
        Ok(())
    }

    /// Pin (or check) the cluster this catalog belongs to. The first backup
    /// ever taken against a fresh `$BACKUP_PATH` writes `system_identifier`
    /// next to it; every later operation — including restore, which has no
    /// `backup.ini` reference to compare against until it picks one — reads
    /// the same file back and refuses to proceed against a different
    /// cluster (invariant 5: "system_identifier pinned at the first backup
    /// equals the cluster's identifier at every subsequent operation").
    pub fn verify_system_identifier(&self, system_identifier: u64) -> Result<()> {
        let path = self.backup_path.join(SYSTEM_IDENTIFIER_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let pinned: u64 = text.trim().parse().map_err(|_| {
                    RmanError::Corrupted(format!("{} does not contain a valid identifier", path.display()))
                })?;
                if pinned != system_identifier {
                    return Err(RmanError::PgIncompatible(format!(
                        "catalog is pinned to cluster system_identifier={pinned}, but this \
                         cluster reports system_identifier={system_identifier}"
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.backup_path)?;
                fs::write(&path, system_identifier.to_string())?;
                Ok(())
            }
            Err(e) => Err(RmanError::System(e.into())),
        }
    }

    /// Mark `id` for deletion and remove its directory tree. Two-phase so a
    /// crash mid-delete leaves a `DELETING` record behind instead of a
    /// half-removed directory masquerading as complete (§3.1 status set).
    pub fn delete(&self, id: BackupId) -> Result<()> {
        let mut backup = self.get(id)?;
        backup.status = BackupStatus::Deleting;
        self.write_record(&backup)?;
        fs::remove_dir_all(self.dir_for(id))?;
        Ok(())
    }

    /// Retention purge (`KEEP_DATA_DAYS`/`KEEP_DATA_GENERATIONS`): delete
    /// every backup older than `threshold`, except those still needed to
    /// restore anything newer. The anchor is the newest FULL, OK-or-DONE
    /// backup at or before `threshold`; it and everything from it forward
    /// (its own incrementals plus anything younger than the cutoff) survive,
    /// since discarding the anchor would strand its dependents. Backups
    /// older than the anchor are the ones nothing still needs, and those are
    /// the only ones removed. With no qualifying anchor, nothing is safely
    /// prunable, so nothing is deleted.
    pub fn delete_before(&self, threshold: DateTime<Local>) -> Result<Vec<BackupId>> {
        let backups = self.list()?; // newest first

        let anchor = backups.iter().find(|b| {
            b.mode == BackupMode::Full
                && matches!(b.status, BackupStatus::Ok | BackupStatus::Done)
                && b.start_time <= threshold
        });

        let Some(anchor) = anchor else {
            return Ok(Vec::new());
        };
        let anchor_id = anchor.id;

        let mut deleted = Vec::new();
        for backup in &backups {
            if backup.id < anchor_id {
                self.delete(backup.id)?;
                deleted.push(backup.id);
            }
        }
        Ok(deleted)
    }

    /// Human-readable summary table driving the `show` subcommand.
    pub fn show(&self) -> Result<Vec<Backup>> {
        self.list()
    }

    /// Re-check `id` against its own manifest: every entry's recorded
    /// CRC-32C must match what's actually on disk under its data directory.
    /// Persists the outcome: `DONE` -> `OK` on a clean pass (§3.3 lifecycle),
    /// and a previously `OK` backup that no longer checks out flips to
    /// `CORRUPT` (§8.1 property 6, scenario S6) — in both cases the new
    /// status is written back to `backup.ini` before returning.
    pub fn validate(&self, id: BackupId) -> Result<()> {
        let mut backup = self.get(id)?;
        if backup.status != BackupStatus::Ok && backup.status != BackupStatus::Done {
            return Err(RmanError::Corrupted(format!(
                "backup {id} is not in a validated-complete state ({:?})",
                backup.status
            )));
        }

        let entries = crate::manifest::read_manifest(&self.manifest_path(id))?;
        let data_dir = self.data_dir(id);

        let mut mismatch = None;
        for entry in &entries {
            if entry.written_bytes < 0 {
                continue; // unchanged since parent: nothing of this backup's own to check
            }
            if !matches!(entry.file_type, crate::manifest::FileType::DataFile | crate::manifest::FileType::File) {
                continue;
            }
            let path = data_dir.join(&entry.rel_path);
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(_) => {
                    mismatch = Some(format!("missing backed-up file {}", entry.rel_path));
                    break;
                }
            };
            let crc = crc32c::crc32c(&bytes);
            if crc != entry.crc32c {
                mismatch = Some(format!("CRC mismatch for {} in backup {id}", entry.rel_path));
                break;
            }
        }

        match mismatch {
            Some(reason) => {
                backup.status = BackupStatus::Corrupt;
                self.write_record(&backup)?;
                Err(RmanError::Corrupted(reason))
            }
            None => {
                backup.status = BackupStatus::Ok;
                self.write_record(&backup)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_record::BackupMode;
    use utils::id::TimelineId;

    #[test]
    fn write_then_list_round_trips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().as_std_path());
        Catalog::init(dir.path().as_std_path()).unwrap();

        let id = BackupId::now();
        let mut backup = Backup::new_running(id, BackupMode::Full, TimelineId(1));
        backup.status = BackupStatus::Done;
        catalog.write_record(&backup).unwrap();

        let listed = catalog.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].status, BackupStatus::Done);
    }

    #[test]
    fn lock_rejects_second_holder() {
        let dir = camino_tempfile::tempdir().unwrap();
        Catalog::init(dir.path().as_std_path()).unwrap();
        let mut first = Catalog::new(dir.path().as_std_path());
        let mut second = Catalog::new(dir.path().as_std_path());

        first.lock().unwrap();
        assert!(matches!(second.lock(), Err(RmanError::AlreadyRunning)));
        first.unlock();
        assert!(second.lock().is_ok());
    }

    #[test]
    fn verify_identity_rejects_mismatched_cluster() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().as_std_path());
        Catalog::init(dir.path().as_std_path()).unwrap();

        let id = BackupId::now();
        let mut backup = Backup::new_running(id, BackupMode::Full, TimelineId(1));
        backup.status = BackupStatus::Done;
        backup.block_size = 8192;
        backup.wal_block_size = 8192;
        catalog.write_record(&backup).unwrap();

        assert!(catalog.verify_identity(8192, 8192).is_ok());
        assert!(matches!(
            catalog.verify_identity(4096, 8192),
            Err(RmanError::PgIncompatible(_))
        ));
    }

    #[test]
    fn system_identifier_pins_on_first_use_and_rejects_mismatch() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().as_std_path());
        Catalog::init(dir.path().as_std_path()).unwrap();

        catalog.verify_system_identifier(0xC0FFEE).unwrap();
        assert!(catalog.verify_system_identifier(0xC0FFEE).is_ok());
        assert!(matches!(
            catalog.verify_system_identifier(0xBADC0DE),
            Err(RmanError::PgIncompatible(_))
        ));
    }

    #[test]
    fn delete_before_keeps_the_chain_a_newer_restore_still_needs() {
        use chrono::Duration;

        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().as_std_path());
        Catalog::init(dir.path().as_std_path()).unwrap();

        let base_time = Local::now() - Duration::days(10);
        let mut ids = Vec::new();
        for (i, mode) in [
            (0, BackupMode::Full),        // too old, superseded -> pruned
            (1, BackupMode::Incremental), // depends on the pruned full -> pruned
            (2, BackupMode::Full),        // anchor: newest full at/before threshold
            (3, BackupMode::Incremental), // depends on the anchor -> kept
            (9, BackupMode::Full),        // newer than threshold -> kept
        ] {
            let id = BackupId::new(base_time + Duration::days(i));
            let mut backup = Backup::new_running(id, mode, TimelineId(1));
            backup.status = BackupStatus::Done;
            catalog.write_record(&backup).unwrap();
            ids.push(id);
        }

        let threshold = base_time + Duration::days(5);
        let deleted = catalog.delete_before(threshold).unwrap();

        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&ids[0]));
        assert!(deleted.contains(&ids[1]));

        let remaining: Vec<_> = catalog.list().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&ids[2]));
        assert!(remaining.contains(&ids[3]));
        assert!(remaining.contains(&ids[4]));
    }

    #[test]
    fn delete_before_deletes_nothing_without_a_qualifying_anchor() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().as_std_path());
        Catalog::init(dir.path().as_std_path()).unwrap();

        let id = BackupId::now();
        let mut backup = Backup::new_running(id, BackupMode::Full, TimelineId(1));
        backup.status = BackupStatus::Done;
        catalog.write_record(&backup).unwrap();

        let deleted = catalog.delete_before(Local::now() - chrono::Duration::days(365)).unwrap();
        assert!(deleted.is_empty());
        assert_eq!(catalog.list().unwrap().len(), 1);
    }
}
