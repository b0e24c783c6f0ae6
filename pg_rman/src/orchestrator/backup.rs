//! Backup orchestrator (C9): drives one full/incremental/archive backup
//! end to end.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use tracing::{info, warn};

use postgres_ffi::constants::REL_SEGSZ;

use crate::backup_record::{Backup, BackupMode, BackupStatus};
use crate::catalog::Catalog;
use crate::cio::{copy_with_interrupt, FileSink};
use crate::config::Config;
use crate::dbclient::DbClient;
use crate::dirwalker::{self, WalkEntry, WalkFileType};
use crate::error::{RmanError, Result};
use crate::filediffer;
use crate::manifest::{self, FileManifestEntry, FileType};
use utils::id::{BackupId, TimelineId};
use utils::interrupt;
use utils::lsn::Lsn;

pub struct BackupOutcome {
    pub id: BackupId,
    pub mode: BackupMode,
}

/// Run one backup against `config`, using `db` as the live-database seam.
/// On any failure the in-progress `Backup` record is best-effort flipped
/// to `ERROR` before the error is propagated (§7 propagation rule).
pub fn run_backup(config: &Config, db: &mut dyn DbClient) -> Result<BackupOutcome> {
    Catalog::init(&config.backup_path).map_err(RmanError::from)?;
    let mut catalog = Catalog::new(&config.backup_path);
    catalog.lock()?;
    let result = run_backup_locked(config, db, &catalog);
    catalog.unlock();
    result
}

fn run_backup_locked(config: &Config, db: &mut dyn DbClient, catalog: &Catalog) -> Result<BackupOutcome> {
    let id = BackupId::now();

    let control = db.read_control_file(&config.pgdata)?;
    catalog.verify_system_identifier(control.system_identifier)?;
    catalog.verify_identity(control.block_size, control.wal_block_size)?;

    let label = format!("pg_rman backup {id}");
    let start = db.start_backup(&label, config.smooth_checkpoint)?;

    let mode = select_mode(config, catalog, start.timeline_id)?;

    let mut backup = Backup::new_running(id, mode, start.timeline_id);
    backup.with_serverlog = config.with_serverlog;
    backup.compressed = config.compress_data;
    backup.full_backup_on_error = config.full_backup_on_error;
    backup.start_lsn = start.start_lsn;
    backup.block_size = control.block_size;
    backup.wal_block_size = control.wal_block_size;
    catalog.write_record(&backup)?;

    match copy_files_and_finish(config, db, catalog, &mut backup, &start) {
        Ok(()) => {
            backup.status = BackupStatus::Done;
            catalog.write_record(&backup)?;
            info!(backup = %id, "backup completed");
            Ok(BackupOutcome { id, mode })
        }
        Err(e) => {
            backup.status = BackupStatus::Error;
            let _ = catalog.write_record(&backup);
            Err(e)
        }
    }
}

fn select_mode(config: &Config, catalog: &Catalog, timeline_id: TimelineId) -> Result<BackupMode> {
    match config.mode {
        BackupMode::Full => Ok(BackupMode::Full),
        BackupMode::Incremental | BackupMode::Archive => {
            let parent = latest_full_ok(catalog, timeline_id)?;
            if parent.is_some() {
                Ok(config.mode)
            } else if config.full_backup_on_error {
                warn!("no FULL backup to base an INCREMENTAL/ARCHIVE backup on; upgrading to FULL");
                Ok(BackupMode::Full)
            } else {
                Err(RmanError::NoBackup)
            }
        }
    }
}

/// `Catalog::list` returns newest-first, so the first match here is the
/// most recent qualifying backup.
fn latest_full_ok(catalog: &Catalog, timeline_id: TimelineId) -> Result<Option<Backup>> {
    Ok(catalog
        .list()?
        .into_iter()
        .find(|b| b.mode == BackupMode::Full && b.status == BackupStatus::Ok && b.timeline_id == timeline_id))
}

fn copy_files_and_finish(
    config: &Config,
    db: &mut dyn DbClient,
    catalog: &Catalog,
    backup: &mut Backup,
    start: &crate::dbclient::StartBackupResponse,
) -> Result<()> {
    let data_dir = catalog.data_dir(backup.id);
    fs::create_dir_all(&data_dir)?;

    let parent = if backup.mode == BackupMode::Incremental {
        latest_full_ok(catalog, backup.timeline_id)?
    } else {
        None
    };
    let parent_lsn = parent.as_ref().map(|p| p.stop_lsn);
    let incremental = backup.mode == BackupMode::Incremental;

    let blacklist = load_blacklist(config)?;
    let entries = dirwalker::walk(&config.pgdata, &blacklist, false).map_err(RmanError::from)?;
    let recompute_checksum = control_recompute_checksum(db, &config.pgdata)?;

    let mut manifest_entries = Vec::with_capacity(entries.len());
    let mut total_data_bytes = 0i64;
    let mut read_data_bytes = 0i64;
    let mut write_bytes = 0i64;

    let skip_file_copy = backup.mode == BackupMode::Archive;

    for entry in &entries {
        if interrupt::is_requested() {
            return Err(RmanError::Interrupted);
        }
        let source_len = stat_len(&entry.abs_path);
        let manifest_entry = copy_one_entry(
            &data_dir,
            entry,
            parent_lsn,
            parent.is_none() && incremental,
            config.compress_data,
            recompute_checksum,
            skip_file_copy,
        )?;
        if let Some(me) = manifest_entry {
            if me.written_bytes >= 0 {
                total_data_bytes += source_len;
                write_bytes += me.written_bytes;
                read_data_bytes += me.written_bytes;
            }
            manifest_entries.push(me);
        }
    }

    write_bytes += write_blob(&data_dir, "backup_label", &start.backup_label, config.compress_data, &mut manifest_entries)?;
    if let Some(map) = &start.tablespace_map {
        write_bytes += write_blob(&data_dir, "tablespace_map", map, config.compress_data, &mut manifest_entries)?;
    }

    let manifest_path = catalog.manifest_path(backup.id);
    manifest::write_manifest(&manifest_path, &manifest_entries).map_err(RmanError::from)?;
    write_mkdirs_script(&catalog.dir(backup.id).join("mkdirs.sh"), &manifest_entries)?;

    let stop = db.stop_backup()?;
    backup.stop_lsn = stop.stop_lsn;
    backup.end_time = Some(stop.end_time);
    backup.recovery_time = Some(Local::now());
    backup.recovery_xid = stop.recovery_xid;
    backup.total_data_bytes = total_data_bytes;
    backup.read_data_bytes = read_data_bytes;
    backup.write_bytes = write_bytes;

    backup.read_arclog_bytes = copy_archived_wal(config, catalog, backup)?;

    Ok(())
}

/// Emit the `mkdirs.sh` artifact (§3.1 catalog layout): a standalone shell
/// script that reconstitutes every directory and symlink this backup
/// recorded, in manifest order, independent of `pg_rman` itself. Restore
/// doesn't shell out to it — it replays the same manifest directly — but
/// the script is kept alongside the manifest for an operator who needs to
/// lay down the skeleton of a backup without the tool that made it.
fn write_mkdirs_script(path: &Path, entries: &[FileManifestEntry]) -> Result<()> {
    let mut script = String::from("#!/bin/sh\n# generated by pg_rman; reconstitutes this backup's directories and symlinks\nset -e\n");
    for entry in entries {
        match entry.file_type {
            FileType::Dir => {
                script.push_str(&format!("mkdir -p -- \"$PGDATA/{}\"\n", entry.rel_path));
            }
            FileType::Symlink => {
                if let Some(target) = &entry.symlink_target {
                    script.push_str(&format!(
                        "ln -sf -- \"{}\" \"$PGDATA/{}\"\n",
                        target, entry.rel_path
                    ));
                }
            }
            _ => {}
        }
    }
    fs::write(path, script)?;
    set_executable(path)?;
    Ok(())
}

fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mut perms = meta.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Load the user blacklist (§4.4) from `config.blacklist_path`, if set.
/// A configured-but-missing file is a plain system error; no file
/// configured at all means no patterns to skip.
fn load_blacklist(config: &Config) -> Result<Vec<String>> {
    match &config.blacklist_path {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            Ok(dirwalker::parse_blacklist(&text))
        }
        None => Ok(Vec::new()),
    }
}

fn control_recompute_checksum(db: &dyn DbClient, pgdata: &Path) -> Result<bool> {
    Ok(db.read_control_file(pgdata)?.checksums_enabled())
}

fn stat_len(path: &Path) -> i64 {
    fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0)
}

fn copy_one_entry(
    data_dir: &Path,
    entry: &WalkEntry,
    parent_lsn: Option<Lsn>,
    parent_missing: bool,
    compress: bool,
    recompute_checksum: bool,
    skip_file_copy: bool,
) -> Result<Option<FileManifestEntry>> {
    let dest_path = data_dir.join(&entry.rel_path);
    let meta = fs::symlink_metadata(&entry.abs_path)?;
    let mtime = chrono::DateTime::<Local>::from(meta.modified()?);

    match entry.file_type {
        WalkFileType::Dir => {
            fs::create_dir_all(&dest_path)?;
            Ok(Some(FileManifestEntry {
                rel_path: entry.rel_path.clone(),
                file_type: FileType::Dir,
                written_bytes: 0,
                crc32c: 0,
                mode: mode_bits(&meta),
                mtime,
                symlink_target: None,
            }))
        }
        WalkFileType::Symlink => Ok(Some(FileManifestEntry {
            rel_path: entry.rel_path.clone(),
            file_type: FileType::Symlink,
            written_bytes: 0,
            crc32c: 0,
            mode: mode_bits(&meta),
            mtime,
            symlink_target: entry.symlink_target.clone(),
        })),
        WalkFileType::Regular => {
            if skip_file_copy {
                // ARCHIVE mode: §4.9 step 3, "no data-file copy is
                // performed" — only directories/symlinks are recorded,
                // the backup's bytes come entirely from its WAL slice.
                return Ok(None);
            }
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            if is_relation_segment(&entry.rel_path) {
                let abs_block_base = segment_base_block(&entry.rel_path);
                let incremental = parent_lsn.is_some() || parent_missing;
                let result = filediffer::diff_file(
                    &entry.abs_path,
                    &dest_path,
                    parent_lsn,
                    parent_missing,
                    compress,
                    recompute_checksum,
                    incremental,
                    abs_block_base,
                )?;
                Ok(Some(FileManifestEntry {
                    rel_path: entry.rel_path.clone(),
                    file_type: FileType::DataFile,
                    written_bytes: result.written_bytes,
                    crc32c: result.crc32c,
                    mode: mode_bits(&meta),
                    mtime,
                    symlink_target: None,
                }))
            } else {
                let mut source = fs::File::open(&entry.abs_path)?;
                let dest = fs::File::create(&dest_path)?;
                let mut sink = FileSink::new(dest, compress);
                copy_with_interrupt(&mut source, &mut sink)?;
                let (_, crc, len) = sink.finish().map_err(|e| RmanError::System(e.into()))?;
                Ok(Some(FileManifestEntry {
                    rel_path: entry.rel_path.clone(),
                    file_type: FileType::File,
                    written_bytes: len as i64,
                    crc32c: crc,
                    mode: mode_bits(&meta),
                    mtime,
                    symlink_target: None,
                }))
            }
        }
    }
}

fn write_blob(
    data_dir: &Path,
    name: &str,
    bytes: &[u8],
    compress: bool,
    manifest_entries: &mut Vec<FileManifestEntry>,
) -> Result<i64> {
    let path = data_dir.join(name);
    let dest = fs::File::create(&path)?;
    let mut sink = FileSink::new(dest, compress);
    sink.write_all(bytes).map_err(|e| RmanError::System(e.into()))?;
    let (_, crc, len) = sink.finish().map_err(|e| RmanError::System(e.into()))?;

    manifest_entries.push(FileManifestEntry {
        rel_path: name.to_string(),
        file_type: FileType::File,
        written_bytes: len as i64,
        crc32c: crc,
        mode: 0o600,
        mtime: Local::now(),
        symlink_target: None,
    });
    Ok(len as i64)
}

/// Copy archived WAL segments covering `[backup.start_lsn, backup.stop_lsn]`
/// from the catalog's WAL staging area into the backup's own `arclog/`
/// directory. Best-effort: segments not yet staged are skipped with a
/// warning rather than failing the whole backup.
fn copy_archived_wal(config: &Config, catalog: &Catalog, backup: &Backup) -> Result<i64> {
    let arclog_dir = catalog.backup_path().join(backup.id.dir_name()).join("arclog");
    fs::create_dir_all(&arclog_dir)?;

    let wal_seg_size = postgres_ffi::constants::WAL_SEGMENT_SIZE;
    let start_seg = postgres_ffi::xlog::lsn_segment_number(backup.start_lsn, wal_seg_size);
    let stop_seg = postgres_ffi::xlog::lsn_segment_number(backup.stop_lsn, wal_seg_size);

    let mut copied = 0i64;
    for segno in start_seg..=stop_seg {
        let name = postgres_ffi::xlog::xlog_file_name(backup.timeline_id, segno, wal_seg_size);
        let source = config.arclog_path.join(&name);
        if !source.exists() {
            warn!(segment = %name, "archived WAL segment not yet staged, skipping");
            continue;
        }
        let bytes = fs::read(&source)?;
        fs::write(arclog_dir.join(&name), &bytes)?;
        copied += bytes.len() as i64;
    }
    Ok(copied)
}

fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

/// A relation segment lives under `base/<db>/`, `global/`, or
/// `pg_tblspc/<oid>/.../<db>/`, and its basename is all-digits optionally
/// followed by `.<segno>`.
fn is_relation_segment(rel_path: &str) -> bool {
    let top = rel_path.split('/').next().unwrap_or("");
    if top != "base" && top != "global" && top != "pg_tblspc" {
        return false;
    }
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let mut parts = basename.split('.');
    let first = parts.next().unwrap_or("");
    if first.is_empty() || !first.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn segment_base_block(rel_path: &str) -> u32 {
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let segno: u32 = basename
        .split('.')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    segno * REL_SEGSZ
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbclient::{ControlFile, StartBackupResponse, StopBackupResponse};
    use byteorder::{ByteOrder, LittleEndian};
    use postgres_ffi::constants::{BLCKSZ, PG_PAGE_LAYOUT_VERSION, SIZE_OF_PAGE_HEADER};

    #[test]
    fn recognizes_relation_segments_under_base_and_global() {
        assert!(is_relation_segment("base/16384/16385"));
        assert!(is_relation_segment("base/16384/16385.1"));
        assert!(is_relation_segment("global/1262"));
        assert!(!is_relation_segment("base/16384/PG_VERSION"));
        assert!(!is_relation_segment("pg_wal/000000010000000000000001"));
        assert!(!is_relation_segment("postgresql.conf"));
    }

    #[test]
    fn segment_base_block_reads_trailing_ordinal() {
        assert_eq!(segment_base_block("base/16384/16385"), 0);
        assert_eq!(segment_base_block("base/16384/16385.2"), 2 * REL_SEGSZ);
    }

    struct FakeDbClient;

    impl DbClient for FakeDbClient {
        fn start_backup(&mut self, _label: &str, _smooth_checkpoint: bool) -> Result<StartBackupResponse> {
            Ok(StartBackupResponse {
                start_lsn: Lsn(0x1000),
                timeline_id: TimelineId(1),
                block_size: BLCKSZ,
                wal_block_size: BLCKSZ,
                backup_label: b"START WAL LOCATION: 0/1000\n".to_vec(),
                tablespace_map: None,
            })
        }

        fn stop_backup(&mut self) -> Result<StopBackupResponse> {
            Ok(StopBackupResponse {
                stop_lsn: Lsn(0x2000),
                end_time: Local::now(),
                recovery_xid: Some(42),
            })
        }

        fn read_control_file(&self, _pgdata: &Path) -> Result<ControlFile> {
            Ok(ControlFile {
                system_identifier: 0x5EED,
                block_size: BLCKSZ,
                wal_block_size: BLCKSZ,
                checksum_version: 0,
            })
        }

        fn read_tablespace_map(&self, _pgdata: &Path) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn write_sample_relation(path: &Path) {
        let mut page = [0x11u8; BLCKSZ as usize];
        LittleEndian::write_u64(&mut page[0..8], 0x1800); // lsn above start, below stop
        LittleEndian::write_u16(&mut page[12..14], SIZE_OF_PAGE_HEADER); // lower
        LittleEndian::write_u16(&mut page[14..16], 8000); // upper
        LittleEndian::write_u16(&mut page[16..18], 8192); // special
        let pagesize_version = (BLCKSZ as u16 & 0xFF00) | (PG_PAGE_LAYOUT_VERSION as u16 & 0x00FF);
        LittleEndian::write_u16(&mut page[18..20], pagesize_version);
        for b in &mut page[SIZE_OF_PAGE_HEADER as usize..8000] {
            *b = 0;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, page).unwrap();
    }

    #[test]
    fn full_backup_produces_done_record_and_manifest() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let pgdata = root.join("pgdata");
        let backup_path = root.join("backups");
        let arclog_path = root.join("arclog");
        fs::create_dir_all(&pgdata).unwrap();
        fs::create_dir_all(&arclog_path).unwrap();
        fs::write(pgdata.join("PG_VERSION"), b"16\n").unwrap();
        write_sample_relation(&pgdata.join("base/1/16385"));

        let config = Config {
            pgdata,
            arclog_path,
            backup_path,
            mode: BackupMode::Full,
            ..Config::default()
        };

        let mut db = FakeDbClient;
        let outcome = run_backup(&config, &mut db).unwrap();
        assert_eq!(outcome.mode, BackupMode::Full);

        let catalog = Catalog::new(&config.backup_path);
        let backup = catalog.get(outcome.id).unwrap();
        assert_eq!(backup.status, BackupStatus::Done);
        assert_eq!(backup.stop_lsn, Lsn(0x2000));

        let manifest_entries = manifest::read_manifest(&catalog.manifest_path(outcome.id)).unwrap();
        let data_file = manifest_entries
            .iter()
            .find(|e| e.rel_path == "base/1/16385")
            .expect("relation file should be in the manifest");
        assert_eq!(data_file.file_type, FileType::DataFile);
        assert!(data_file.written_bytes > 0);
    }
}
