//! Scenario-level tests that drive the backup and restore orchestrators
//! together against a fake database connection, the way
//! `libs/postgres_backend/tests` and `libs/remote_storage/tests` exercise
//! their own crates' public surface end to end rather than unit-testing
//! individual functions.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use chrono::Local;

use pg_rman::backup_record::{BackupMode, BackupStatus};
use pg_rman::catalog::Catalog;
use pg_rman::config::Config;
use pg_rman::dbclient::{ControlFile, DbClient, StartBackupResponse, StopBackupResponse};
use pg_rman::error::{RmanError, Result};
use pg_rman::orchestrator::backup::run_backup;
use pg_rman::orchestrator::restore::{run_restore, RestoreRequest};
use postgres_ffi::constants::{BLCKSZ, PG_PAGE_LAYOUT_VERSION, SIZE_OF_PAGE_HEADER};
use utils::id::TimelineId;
use utils::lsn::Lsn;

/// A fake cluster connection whose LSN advances by one page-worth on every
/// `stop_backup`, so successive incremental backups each see new work.
struct FakeDbClient {
    lsn: Cell<u64>,
    system_identifier: u64,
    recovery_xid: Cell<u64>,
}

impl FakeDbClient {
    fn new(system_identifier: u64) -> Self {
        FakeDbClient {
            lsn: Cell::new(0x1000),
            system_identifier,
            recovery_xid: Cell::new(100),
        }
    }
}

impl DbClient for FakeDbClient {
    fn start_backup(&mut self, _label: &str, _smooth_checkpoint: bool) -> Result<StartBackupResponse> {
        Ok(StartBackupResponse {
            start_lsn: Lsn(self.lsn.get()),
            timeline_id: TimelineId(1),
            block_size: BLCKSZ,
            wal_block_size: BLCKSZ,
            backup_label: b"fake label\n".to_vec(),
            tablespace_map: None,
        })
    }

    fn stop_backup(&mut self) -> Result<StopBackupResponse> {
        let xid = self.recovery_xid.get();
        self.recovery_xid.set(xid + 1);
        self.lsn.set(self.lsn.get() + 0x1000);
        Ok(StopBackupResponse {
            stop_lsn: Lsn(self.lsn.get()),
            end_time: Local::now(),
            recovery_xid: Some(xid),
        })
    }

    fn read_control_file(&self, _pgdata: &Path) -> Result<ControlFile> {
        Ok(ControlFile {
            system_identifier: self.system_identifier,
            block_size: BLCKSZ,
            wal_block_size: BLCKSZ,
            checksum_version: 0,
        })
    }

    fn read_tablespace_map(&self, _pgdata: &Path) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

fn write_page(path: &Path, lsn: u64, fill: u8) {
    let mut page = [fill; BLCKSZ as usize];
    LittleEndian::write_u64(&mut page[0..8], lsn);
    LittleEndian::write_u16(&mut page[12..14], SIZE_OF_PAGE_HEADER);
    LittleEndian::write_u16(&mut page[14..16], 8000);
    LittleEndian::write_u16(&mut page[16..18], 8192);
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

fn write_relation_of(path: &Path, lsn: u64, fill: u8, blocks: usize) {
    let mut buf = vec![0u8; BLCKSZ as usize * blocks];
    let pagesize_version = (BLCKSZ as u16 & 0xFF00) | (PG_PAGE_LAYOUT_VERSION as u16 & 0x00FF);
    for b in 0..blocks {
        let start = b * BLCKSZ as usize;
        LittleEndian::write_u64(&mut buf[start..start + 8], lsn);
        LittleEndian::write_u16(&mut buf[start + 12..start + 14], SIZE_OF_PAGE_HEADER);
        LittleEndian::write_u16(&mut buf[start + 14..start + 16], 8000);
        LittleEndian::write_u16(&mut buf[start + 16..start + 18], 8192);
        LittleEndian::write_u16(&mut buf[start + 18..start + 20], pagesize_version);
        for i in start + SIZE_OF_PAGE_HEADER as usize..start + 8000 {
            buf[i] = fill;
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, buf).unwrap();
}

struct Env {
    _root: camino_tempfile::Utf8TempDir,
    pgdata: PathBuf,
    config: Config,
}

fn setup() -> Env {
    let root = camino_tempfile::tempdir().unwrap();
    let pgdata = root.path().join("pgdata").as_std_path().to_path_buf();
    let backup_path = root.path().join("backups").as_std_path().to_path_buf();
    let arclog_path = root.path().join("arclog").as_std_path().to_path_buf();
    fs::create_dir_all(&pgdata).unwrap();
    fs::create_dir_all(&arclog_path).unwrap();
    fs::write(pgdata.join("PG_VERSION"), b"16\n").unwrap();
    fs::write(pgdata.join("postgresql.conf"), b"shared_buffers = 128MB\n").unwrap();

    let config = Config {
        pgdata: pgdata.clone(),
        arclog_path,
        backup_path,
        mode: BackupMode::Full,
        ..Config::default()
    };
    Env {
        _root: root,
        pgdata,
        config,
    }
}

fn mark_ok(config: &Config, id: utils::id::BackupId) {
    let catalog = Catalog::new(&config.backup_path);
    let mut backup = catalog.get(id).unwrap();
    backup.status = BackupStatus::Ok;
    catalog.write_record(&backup).unwrap();
}

/// S1 — full backup then restore to latest, with a prior full backup's
/// data visibly restored over simulated data loss.
#[test]
fn full_backup_then_restore_recovers_lost_data() {
    let env = setup();
    write_page(&env.pgdata.join("base/1/16385"), 0x1800, 0x11);

    let mut db = FakeDbClient::new(0xFEED_FACE);
    let outcome = run_backup(&env.config, &mut db).unwrap();
    assert_eq!(outcome.mode, BackupMode::Full);
    mark_ok(&env.config, outcome.id);

    fs::remove_file(env.pgdata.join("base/1/16385")).unwrap();

    let req = RestoreRequest {
        target_tli: TimelineId(1),
        server_running: false,
        ..RestoreRequest::default()
    };
    run_restore(&env.config, &req).unwrap();

    let restored = fs::read(env.pgdata.join("base/1/16385")).unwrap();
    assert_eq!(restored.len(), BLCKSZ as usize);
    assert!(env.pgdata.join("recovery.signal").exists());
}

/// S4 — an incremental attempted against an empty catalog fails with
/// NoBackup; with full_backup_on_error it silently upgrades to FULL.
#[test]
fn incremental_without_parent_upgrades_to_full_when_configured() {
    let env = setup();
    write_page(&env.pgdata.join("base/1/16385"), 0x1000, 0x22);

    let mut config = env.config.clone();
    config.mode = BackupMode::Incremental;

    let mut db = FakeDbClient::new(0xAAAA);
    assert!(matches!(run_backup(&config, &mut db), Err(RmanError::NoBackup)));

    config.full_backup_on_error = true;
    let outcome = run_backup(&config, &mut db).unwrap();
    assert_eq!(outcome.mode, BackupMode::Full);

    let catalog = Catalog::new(&config.backup_path);
    let persisted = catalog.get(outcome.id).unwrap();
    assert_eq!(persisted.mode, BackupMode::Full);
}

/// S3-flavored — a relation that shrinks between FULL and INCREMENTAL
/// (the incremental records fewer blocks than the full) must truncate
/// the restored file to the incremental's block count, not leave stale
/// pages from the full's longer file lying around.
#[test]
fn incremental_truncates_restored_file_to_its_own_length() {
    let env = setup();
    let rel = env.pgdata.join("base/1/16385");
    write_relation_of(&rel, 0x1000, 0x33, 4);

    let mut db = FakeDbClient::new(0xC0DE);
    let full = run_backup(&env.config, &mut db).unwrap();
    mark_ok(&env.config, full.id);

    // simulate a vacuum that shrank the relation to one page, with a
    // fresher LSN than what the full backup saw.
    write_relation_of(&rel, 0x3000, 0x44, 1);

    // BackupId has one-second resolution; give the incremental a distinct id.
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let mut config_inc = env.config.clone();
    config_inc.mode = BackupMode::Incremental;
    let inc = run_backup(&config_inc, &mut db).unwrap();
    assert_eq!(inc.mode, BackupMode::Incremental);
    mark_ok(&env.config, inc.id);

    fs::remove_file(&rel).unwrap();
    let req = RestoreRequest {
        target_tli: TimelineId(1),
        server_running: false,
        ..RestoreRequest::default()
    };
    run_restore(&env.config, &req).unwrap();

    let restored = fs::read(&rel).unwrap();
    assert_eq!(restored.len(), BLCKSZ as usize, "stale trailing pages from the full must be truncated away");
}

/// S7 — deleting by a cutoff timestamp keeps the latest FULL at or before
/// the cutoff and everything depending on it; only strictly older backups
/// are removed.
#[test]
fn delete_before_prunes_only_what_nothing_newer_needs() {
    let env = setup();
    write_page(&env.pgdata.join("base/1/16385"), 0x1000, 0x55);

    let mut db = FakeDbClient::new(0xF00D);
    let f1 = run_backup(&env.config, &mut db).unwrap();
    mark_ok(&env.config, f1.id);

    std::thread::sleep(std::time::Duration::from_millis(1100));
    let mut config_inc = env.config.clone();
    config_inc.mode = BackupMode::Incremental;
    let i1 = run_backup(&config_inc, &mut db).unwrap();
    mark_ok(&env.config, i1.id);

    let cutoff = Local::now() + chrono::Duration::seconds(2);
    std::thread::sleep(std::time::Duration::from_secs(2));

    let f2 = run_backup(&env.config, &mut db).unwrap();
    mark_ok(&env.config, f2.id);

    let catalog = Catalog::new(&env.config.backup_path);
    let deleted = catalog.delete_before(cutoff).unwrap();

    // F1 is the newest FULL at/before the cutoff: it and I1 (its
    // dependent) survive; F2 is newer than the cutoff and survives too.
    assert!(deleted.is_empty());
    let remaining: Vec<_> = catalog.list().unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.contains(&f1.id));
    assert!(remaining.contains(&i1.id));
    assert!(remaining.contains(&f2.id));
}
