//! Cluster geometry constants. These mirror the compiled-in constants of a
//! PostgreSQL-compatible server; a real deployment could make some of them
//! runtime-configurable (different `--with-blocksize` builds exist), but
//! this catalog targets the common default layout.

/// Page size, in bytes. PostgreSQL's default `BLCKSZ`.
pub const BLCKSZ: u32 = 8192;

/// Default WAL page size.
pub const XLOG_BLCKSZ: u32 = 8192;

/// Number of blocks per relation segment file (`N.M` naming), derived from
/// the default 1 GiB segment size.
pub const REL_SEGSZ: u32 = (1024 * 1024 * 1024) / BLCKSZ;

/// Default WAL segment size.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// The page layout version this catalog understands. A page whose header
/// reports a different version is not a parseable data page.
pub const PG_PAGE_LAYOUT_VERSION: u8 = 4;

/// Size of `PageHeaderData`, before the line pointer array.
pub const SIZE_OF_PAGE_HEADER: u16 = 24;

/// Any bit outside this mask is an "unknown flag" and fails page validity.
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;

/// Alignment PostgreSQL builds its struct layouts to; `special` must be a
/// multiple of this.
pub const MAXIMUM_ALIGNOF: u32 = 8;

pub const fn maxalign(len: u32) -> u32 {
    (len + (MAXIMUM_ALIGNOF - 1)) & !(MAXIMUM_ALIGNOF - 1)
}

/// Size on disk of one on-disk `BackupPageRecord` header (block, holeOffset,
/// holeLength, endpoint), before the page body bytes that may follow.
pub const SIZE_OF_BACKUP_PAGE_RECORD_HEADER: usize = 4 + 2 + 2 + 1;
