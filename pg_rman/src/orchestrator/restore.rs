//! Restore orchestrator (C10): select a base + incremental chain covering
//! a recovery target, lay it down into the destination data directory,
//! and emit the recovery-signal artifacts that bring the cluster up at
//! the right point.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use postgres_ffi::constants::BLCKSZ;
use postgres_ffi::page::{self, BackupPageRecord};

use crate::backup_record::{Backup, BackupMode, BackupStatus};
use crate::catalog::Catalog;
use crate::cio::{copy_with_interrupt, FileSource};
use crate::config::Config;
use crate::dbclient::read_control_file_from_disk;
use crate::dirwalker::{self, WalkFileType};
use crate::error::{RmanError, Result};
use crate::manifest::{self, FileManifestEntry, FileType};
use crate::recovery_signal::{self, RecoveryTarget};
use crate::timeline;
use utils::id::TimelineId;
use utils::interrupt;

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub target_tli: TimelineId,
    pub target_time: Option<DateTime<Local>>,
    pub target_xid: Option<u64>,
    pub target_inclusive: Option<bool>,
    pub target_action: Option<String>,
    pub hard_copy: bool,
    /// Whether the upstream server is currently running. Checking this is
    /// an external concern (process/PID inspection); restore only needs
    /// the boolean answer.
    pub server_running: bool,
}

pub fn run_restore(config: &Config, req: &RestoreRequest) -> Result<()> {
    let mut catalog = Catalog::new(&config.backup_path);
    catalog.lock()?;
    let result = run_restore_locked(config, req, &catalog);
    catalog.unlock();
    result
}

fn run_restore_locked(config: &Config, req: &RestoreRequest, catalog: &Catalog) -> Result<()> {
    if req.server_running {
        return Err(RmanError::PgRunning);
    }

    // A destination pgdata that still has its own control file (restoring
    // over a broken-but-present cluster, rather than into an empty
    // directory prepared for disaster recovery) must belong to the same
    // cluster the catalog's backups were taken from.
    if config.pgdata.join("global/pg_control").exists() {
        let control = read_control_file_from_disk(&config.pgdata)?;
        catalog.verify_system_identifier(control.system_identifier)?;
    }

    let staging_dir = catalog.backup_path().join("backup").join("pg_wal");
    let segments = timeline::read_history(&config.arclog_path, Some(staging_dir.as_path()), req.target_tli)?;

    // newest first, per Catalog::list
    let backups = catalog.list()?;

    let base = backups
        .iter()
        .find(|b| {
            b.mode == BackupMode::Full
                && b.status == BackupStatus::Ok
                && timeline::reachable(&segments, b.timeline_id, b.stop_lsn)
                && satisfies_target(b, req)
        })
        .cloned()
        .ok_or(RmanError::NoBackup)?;

    let mut incrementals: Vec<Backup> = backups
        .iter()
        .filter(|b| {
            b.mode == BackupMode::Incremental
                && b.id > base.id
                && timeline::reachable(&segments, b.timeline_id, b.stop_lsn)
                && satisfies_target(b, req)
        })
        .cloned()
        .collect();
    incrementals.sort_by_key(|b| b.id);

    // §4.10 step 9: every backup from `base` forward whose archived-WAL
    // slice is needed — this includes ARCHIVE-mode backups, which carry no
    // data files of their own and therefore never show up in `incrementals`.
    let mut wal_chain: Vec<Backup> = backups
        .iter()
        .filter(|b| {
            b.id >= base.id
                && timeline::reachable(&segments, b.timeline_id, b.stop_lsn)
                && satisfies_target(b, req)
        })
        .cloned()
        .collect();
    wal_chain.sort_by_key(|b| b.id);

    let work_dir = catalog.backup_path().join("restore_work");
    let staged_wal = stage_online_wal(&config.pgdata, &work_dir)?;

    clear_data_directory(&config.pgdata)?;

    let mut known_paths = HashSet::new();
    restore_one_backup(catalog, &base, &config.pgdata, &mut known_paths)?;
    for inc in &incrementals {
        restore_one_backup(catalog, inc, &config.pgdata, &mut known_paths)?;
    }
    prune_stale_files(&config.pgdata, &known_paths)?;
    let _ = fs::remove_file(config.pgdata.join("postmaster.pid"));

    extract_archived_wal(catalog, &wal_chain, &config.arclog_path, req.hard_copy)?;

    restore_staged_wal(&staged_wal, &config.pgdata)?;

    let target = RecoveryTarget {
        time: req.target_time.map(|t| t.to_rfc3339()),
        xid: req.target_xid.map(|x| x.to_string()),
        inclusive: req.target_inclusive,
        timeline: req.target_tli.to_string(),
        action: req.target_action.clone(),
    };
    let main_conf = config
        .pgconf_path
        .clone()
        .unwrap_or_else(|| config.pgdata.join("postgresql.conf"));
    recovery_signal::write_recovery_artifacts(
        &config.pgdata,
        &main_conf,
        &config.arclog_path,
        &target,
        env!("CARGO_PKG_VERSION"),
    )?;

    info!(backup = %base.id, incrementals = incrementals.len(), "restore completed");
    Ok(())
}

fn satisfies_target(backup: &Backup, req: &RestoreRequest) -> bool {
    if let Some(t) = req.target_time {
        if backup.start_time > t {
            return false;
        }
    }
    if let (Some(target_xid), Some(backup_xid)) = (req.target_xid, backup.recovery_xid) {
        if backup_xid > target_xid {
            return false;
        }
    }
    true
}

fn clear_data_directory(pgdata: &Path) -> Result<()> {
    let read_dir = match fs::read_dir(pgdata) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RmanError::System(e.into())),
    };
    for entry in read_dir {
        let entry = entry.map_err(|e| RmanError::System(e.into()))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| RmanError::System(e.into()))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn stage_online_wal(pgdata: &Path, work_dir: &Path) -> Result<PathBuf> {
    let src = pgdata.join("pg_wal");
    let dest = work_dir.join("pg_wal");
    fs::create_dir_all(&dest)?;
    if src.is_dir() {
        for entry in fs::read_dir(&src)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
    }
    Ok(dest)
}

fn restore_staged_wal(staged: &Path, pgdata: &Path) -> Result<()> {
    let dest = pgdata.join("pg_wal");
    fs::create_dir_all(&dest)?;
    if staged.is_dir() {
        for entry in fs::read_dir(staged)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
    }
    Ok(())
}

fn extract_archived_wal(catalog: &Catalog, chain: &[Backup], arclog_path: &Path, hard_copy: bool) -> Result<()> {
    fs::create_dir_all(arclog_path)?;
    for backup in chain {
        let src_dir = catalog.backup_path().join(backup.id.dir_name()).join("arclog");
        if !src_dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&src_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let dest = arclog_path.join(entry.file_name());
            if dest.exists() {
                continue;
            }
            if hard_copy {
                fs::copy(entry.path(), &dest)?;
            } else {
                std::os::unix::fs::symlink(entry.path(), &dest)?;
            }
        }
    }
    Ok(())
}

/// Restore a single backup's manifest into `pgdata` (§4.11). Every
/// restored path is added to `known_paths`, the running set the final
/// prune pass uses to tell "belongs to this restore" from "stale".
fn restore_one_backup(
    catalog: &Catalog,
    backup: &Backup,
    pgdata: &Path,
    known_paths: &mut HashSet<String>,
) -> Result<()> {
    let data_dir = catalog.data_dir(backup.id);
    let entries = manifest::read_manifest(&catalog.manifest_path(backup.id))?;

    for entry in &entries {
        if interrupt::is_requested() {
            return Err(RmanError::Interrupted);
        }
        if entry.rel_path == "backup_label" || entry.rel_path == "tablespace_map" {
            continue; // consumed by the orchestrator, not laid down into pgdata
        }
        known_paths.insert(entry.rel_path.clone());
        restore_one_entry(&data_dir, pgdata, entry, backup.compressed)?;
    }
    Ok(())
}

fn restore_one_entry(data_dir: &Path, pgdata: &Path, entry: &FileManifestEntry, compressed: bool) -> Result<()> {
    let dest_path = pgdata.join(&entry.rel_path);

    match entry.file_type {
        FileType::Dir => {
            fs::create_dir_all(&dest_path)?;
            set_mode(&dest_path, 0o700);
        }
        FileType::Symlink => {
            let target = entry
                .symlink_target
                .as_deref()
                .ok_or_else(|| RmanError::Corrupted(format!("symlink {} has no target", entry.rel_path)))?;
            if dest_path.symlink_metadata().is_ok() {
                fs::remove_file(&dest_path)?;
            }
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(target, &dest_path)?;
        }
        FileType::Socket => {
            // not recreated; a live postmaster will listen again here.
        }
        FileType::File => {
            if entry.written_bytes < 0 {
                return Ok(()); // unchanged since parent: already in place from an earlier backup
            }
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let source_path = data_dir.join(&entry.rel_path);
            let mut source = FileSource::new(fs::File::open(&source_path)?, compressed);
            let mut dest = fs::File::create(&dest_path)?;
            copy_with_interrupt(&mut source, &mut dest)?;
        }
        FileType::DataFile => {
            if entry.written_bytes < 0 {
                return Ok(()); // no new pages since parent: leave the base's copy untouched
            }
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            restore_data_file(&data_dir.join(&entry.rel_path), &dest_path, compressed)?;
        }
    }
    Ok(())
}

/// Decode one relation segment's `BackupPageRecord` stream into `dest`,
/// writing each page at its random-access offset so an incremental
/// restore only overwrites the pages it actually captured.
fn restore_data_file(source_path: &Path, dest_path: &Path, compressed: bool) -> Result<()> {
    let mut source = FileSource::new(fs::File::open(source_path)?, compressed);
    let dest = fs::OpenOptions::new().write(true).create(true).open(dest_path)?;

    let mut min_block = 0u32;
    loop {
        if interrupt::is_requested() {
            return Err(RmanError::Interrupted);
        }
        match page::read_record(&mut source, min_block)? {
            None => break,
            Some(BackupPageRecord::Endpoint { block }) => {
                let len = block as u64 * BLCKSZ as u64;
                dest.set_len(len)?;
                break;
            }
            Some(BackupPageRecord::Page {
                block,
                hole_offset,
                hole_length,
                body,
            }) => {
                let page = page::reassemble_page(block, hole_offset, hole_length, &body);
                dest.write_all_at(&page, block as u64 * BLCKSZ as u64)?;
                min_block = block + 1;
            }
        }
    }
    Ok(())
}

/// Delete anything under `pgdata` that isn't part of the union of every
/// restored backup's manifest. Always walks the destination fresh rather
/// than reusing a list collected before the restore began.
fn prune_stale_files(pgdata: &Path, known_paths: &HashSet<String>) -> Result<()> {
    let entries = dirwalker::walk(pgdata, &[], false).map_err(RmanError::from)?;
    for entry in &entries {
        if matches!(entry.file_type, WalkFileType::Dir) {
            continue;
        }
        if !known_paths.contains(&entry.rel_path) {
            let _ = fs::remove_file(&entry.abs_path);
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}
