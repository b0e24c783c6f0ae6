//! The live-database RPC surface (C9 steps 2 and 7): starting/stopping an
//! online physical backup, and reading the two small artifacts the backup
//! orchestrator needs straight from the data directory (the control file
//! and, if present, the tablespace map). Modeled as a trait so the
//! orchestrator can be driven against a fake in tests without a live
//! server.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Local};
use postgres::{Client, NoTls};

use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::error::{RmanError, Result};

#[derive(Debug, Clone)]
pub struct StartBackupResponse {
    pub start_lsn: Lsn,
    pub timeline_id: TimelineId,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub backup_label: Vec<u8>,
    pub tablespace_map: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct StopBackupResponse {
    pub stop_lsn: Lsn,
    pub end_time: DateTime<Local>,
    pub recovery_xid: Option<u64>,
}

/// Fields of `pg_control` this tool actually consults. Laid out as a
/// simple fixed-offset record of our own devising, not the real
/// PostgreSQL control-file binary format (which is version-specific and
/// CRC-guarded); only `data_page_checksum_version` drives behavior here
/// (Open Question 2). `system_identifier` is the cluster-lifetime value
/// the catalog pins at `init` and re-checks on every later operation
/// (§3.2 invariant 5, §4.7 `verifyIdentity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFile {
    pub system_identifier: u64,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub checksum_version: u32,
}

impl ControlFile {
    pub fn checksums_enabled(&self) -> bool {
        self.checksum_version != 0
    }

    const LEN: usize = 20;

    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(RmanError::Corrupted("control file truncated".into()));
        }
        Ok(ControlFile {
            system_identifier: LittleEndian::read_u64(&buf[0..8]),
            block_size: LittleEndian::read_u32(&buf[8..12]),
            wal_block_size: LittleEndian::read_u32(&buf[12..16]),
            checksum_version: LittleEndian::read_u32(&buf[16..20]),
        })
    }

    fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.system_identifier);
        LittleEndian::write_u32(&mut buf[8..12], self.block_size);
        LittleEndian::write_u32(&mut buf[12..16], self.wal_block_size);
        LittleEndian::write_u32(&mut buf[16..20], self.checksum_version);
        buf
    }
}

pub trait DbClient {
    /// `pg_backup_start`: enters non-exclusive backup mode, returns the
    /// start LSN plus the `backup_label`/`tablespace_map` blobs that must
    /// be written verbatim into the backup's `database/` directory.
    fn start_backup(&mut self, label: &str, smooth_checkpoint: bool) -> Result<StartBackupResponse>;

    /// `pg_backup_stop`: exits backup mode, returns the stop LSN.
    fn stop_backup(&mut self) -> Result<StopBackupResponse>;

    fn read_control_file(&self, pgdata: &Path) -> Result<ControlFile>;

    /// `None` when the cluster has no tablespaces beyond the default ones.
    fn read_tablespace_map(&self, pgdata: &Path) -> Result<Option<Vec<u8>>>;
}

pub struct PostgresDbClient {
    client: Client,
}

impl PostgresDbClient {
    pub fn connect(connstr: &str) -> Result<Self> {
        let client = Client::connect(connstr, NoTls).map_err(|e| RmanError::System(e.into()))?;
        Ok(PostgresDbClient { client })
    }
}

impl DbClient for PostgresDbClient {
    fn start_backup(&mut self, label: &str, smooth_checkpoint: bool) -> Result<StartBackupResponse> {
        let fast = !smooth_checkpoint;
        let row = self
            .client
            .query_one("SELECT pg_backup_start($1, $2)", &[&label, &fast])
            .map_err(|e| RmanError::System(e.into()))?;
        let lsn_text: String = row.get(0);
        let start_lsn: Lsn = lsn_text
            .parse()
            .map_err(|_| RmanError::System(anyhow::anyhow!("unparseable start lsn {lsn_text:?}")))?;

        let tli_row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .map_err(|e| RmanError::System(e.into()))?;
        let timeline_id = TimelineId(tli_row.get::<_, i32>(0) as u32);

        let block_size: String = self
            .client
            .query_one("SHOW block_size", &[])
            .map_err(|e| RmanError::System(e.into()))?
            .get(0);
        let wal_block_size: String = self
            .client
            .query_one("SHOW wal_block_size", &[])
            .map_err(|e| RmanError::System(e.into()))?
            .get(0);

        Ok(StartBackupResponse {
            start_lsn,
            timeline_id,
            block_size: block_size.parse().unwrap_or(8192),
            wal_block_size: wal_block_size.parse().unwrap_or(8192),
            // populated by read_control_file/read_tablespace_map once the
            // orchestrator has a pgdata path to read them from.
            backup_label: Vec::new(),
            tablespace_map: None,
        })
    }

    fn stop_backup(&mut self) -> Result<StopBackupResponse> {
        let row = self
            .client
            .query_one("SELECT lsn, labelfile, spcmapfile FROM pg_backup_stop(wait_for_archive => true)", &[])
            .map_err(|e| RmanError::System(e.into()))?;
        let lsn_text: String = row.get(0);
        let stop_lsn: Lsn = lsn_text
            .parse()
            .map_err(|_| RmanError::System(anyhow::anyhow!("unparseable stop lsn {lsn_text:?}")))?;

        let xid_row = self
            .client
            .query_one("SELECT txid_snapshot_xmin(txid_current_snapshot())", &[])
            .map_err(|e| RmanError::System(e.into()))?;
        let recovery_xid = xid_row.try_get::<_, i64>(0).ok().map(|x| x as u64);

        Ok(StopBackupResponse {
            stop_lsn,
            end_time: Local::now(),
            recovery_xid,
        })
    }

    fn read_control_file(&self, pgdata: &Path) -> Result<ControlFile> {
        read_control_file_from_disk(pgdata)
    }

    fn read_tablespace_map(&self, pgdata: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(pgdata.join("tablespace_map")) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RmanError::System(e.into())),
        }
    }
}

/// Read `global/pg_control` straight off disk. Doesn't need a live
/// connection, which is why the restore orchestrator (where the upstream
/// server must not be running, §4.10 step 1) calls this directly instead
/// of going through a `DbClient`.
pub fn read_control_file_from_disk(pgdata: &Path) -> Result<ControlFile> {
    let bytes = std::fs::read(pgdata.join("global/pg_control"))
        .map_err(|e| RmanError::Corrupted(format!("reading pg_control: {e}")))?;
    ControlFile::parse(&bytes)
}
