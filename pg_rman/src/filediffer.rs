//! File differ (C2): stream one relation-segment file page by page,
//! deciding inclusion per page against an optional parent LSN, and falling
//! back to an opaque byte-for-byte copy whenever the page codec can't make
//! sense of what it's looking at.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use postgres_ffi::constants::BLCKSZ;
use postgres_ffi::page::{self, PageError};
use utils::lsn::Lsn;

use crate::cio::{copy_with_interrupt, FileSink};
use crate::error::{RmanError, Result};

/// Outcome of diffing a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffResult {
    /// Bytes actually written to `dest_path`, or `-1` if the file turned
    /// out to have no new pages relative to the parent and was deleted.
    pub written_bytes: i64,
    pub crc32c: u32,
    pub deleted: bool,
}

/// Distinguishes "this isn't (or no longer looks like) a parseable data
/// file, retry the whole thing as an opaque copy" from a genuine I/O
/// failure that should abort the backup outright.
enum DiffOutcome {
    Done(DiffResult),
    FallBackToOpaque,
}

/// Diff `source_path` into `dest_path`.
///
/// `abs_block_base` is the segment-relative absolute block number of block
/// 0 in this file (`segno * RELSEG_SIZE`), used only when recomputing page
/// checksums. `incremental` selects whether a trailing endpoint marker is
/// appended and whether zero-new-pages triggers deletion; a full backup
/// never skips pages and never deletes.
pub fn diff_file(
    source_path: &Path,
    dest_path: &Path,
    parent_lsn: Option<Lsn>,
    parent_missing: bool,
    compress: bool,
    recompute_checksum: bool,
    incremental: bool,
    abs_block_base: u32,
) -> Result<DiffResult> {
    match diff_as_data_file(
        source_path,
        dest_path,
        parent_lsn,
        parent_missing,
        compress,
        recompute_checksum,
        incremental,
        abs_block_base,
    )? {
        DiffOutcome::Done(result) => Ok(result),
        DiffOutcome::FallBackToOpaque => {
            let _ = std::fs::remove_file(dest_path);
            copy_opaque(source_path, dest_path, compress)
        }
    }
}

fn diff_as_data_file(
    source_path: &Path,
    dest_path: &Path,
    parent_lsn: Option<Lsn>,
    parent_missing: bool,
    compress: bool,
    recompute_checksum: bool,
    incremental: bool,
    abs_block_base: u32,
) -> Result<DiffOutcome> {
    let mut source = File::open(source_path)?;
    let dest = File::create(dest_path)?;
    let mut sink = FileSink::new(dest, compress);

    let skip_allowed = incremental && !parent_missing && parent_lsn.is_some();
    let parent_lsn = parent_lsn.unwrap_or(Lsn::INVALID);

    let mut block: u32 = 0;
    let mut emitted: u32 = 0;
    let mut buf = [0u8; BLCKSZ as usize];

    loop {
        let n = read_fully(&mut source, &mut buf)?;
        if n == 0 {
            break;
        }
        if n != buf.len() {
            // Partial tail read (§4.1 edge policy): at block 0 this means
            // the file isn't page-structured at all, so the whole thing
            // falls back to an opaque copy. At block > 0 it's just the
            // relation's last, still-growing segment — emit it as a
            // zero-hole page preserving its size instead of discarding
            // every earlier page already captured in `sink`.
            if block == 0 {
                return Ok(DiffOutcome::FallBackToOpaque);
            }
            let record = page::encode_raw_page(block, &buf[..n]);
            sink.write_all(&record).map_err(|e| RmanError::System(e.into()))?;
            emitted += 1;
            block += 1;
            break;
        }

        let header = match page::validate_page(&buf, block) {
            Ok(h) => h,
            Err(PageError::NotADataPage) | Err(PageError::IndexMetapage) => {
                return Ok(DiffOutcome::FallBackToOpaque)
            }
            Err(PageError::Io(e)) => return Err(RmanError::System(e.into())),
            Err(e @ PageError::Corrupted(_)) => return Err(e.into()),
        };

        if skip_allowed && header.lsn <= parent_lsn.0 {
            block += 1;
            continue;
        }

        let abs_block = abs_block_base + block;
        let record = page::encode_page(buf, block, abs_block, recompute_checksum)?;
        sink.write_all(&record).map_err(|e| RmanError::System(e.into()))?;
        emitted += 1;
        block += 1;
    }

    if incremental {
        if emitted == 0 && skip_allowed {
            drop(sink); // close before unlinking
            std::fs::remove_file(dest_path)?;
            return Ok(DiffOutcome::Done(DiffResult {
                written_bytes: -1,
                crc32c: 0,
                deleted: true,
            }));
        }
        let endpoint = page::encode_endpoint(block);
        sink.write_all(&endpoint).map_err(|e| RmanError::System(e.into()))?;
    }

    let (_, crc, len) = sink.finish().map_err(|e| RmanError::System(e.into()))?;
    Ok(DiffOutcome::Done(DiffResult {
        written_bytes: len as i64,
        crc32c: crc,
        deleted: false,
    }))
}

/// Copy `source_path` to `dest_path` byte-for-byte through the same
/// CRC/compression stream, for files the page codec can't interpret.
fn copy_opaque(source_path: &Path, dest_path: &Path, compress: bool) -> Result<DiffResult> {
    let mut source = File::open(source_path)?;
    let dest = File::create(dest_path)?;
    let mut sink = FileSink::new(dest, compress);

    copy_with_interrupt(&mut source, &mut sink)?;

    let (_, crc, len) = sink.finish().map_err(|e| RmanError::System(e.into()))?;
    Ok(DiffResult {
        written_bytes: len as i64,
        crc32c: crc,
        deleted: false,
    })
}

/// Like `Read::read_exact` but tolerant of a short final read at EOF:
/// returns the number of bytes actually filled, which is `0` at a clean
/// EOF, `buf.len()` on a full read, or something in between for a
/// truncated trailing page.
fn read_fully(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};
    use postgres_ffi::constants::{PG_PAGE_LAYOUT_VERSION, SIZE_OF_PAGE_HEADER};

    fn write_header(buf: &mut [u8], lsn: u64, lower: u16, upper: u16, special: u16) {
        LittleEndian::write_u64(&mut buf[0..8], lsn);
        LittleEndian::write_u16(&mut buf[8..10], 0); // checksum
        LittleEndian::write_u16(&mut buf[10..12], 0); // flags
        LittleEndian::write_u16(&mut buf[12..14], lower);
        LittleEndian::write_u16(&mut buf[14..16], upper);
        LittleEndian::write_u16(&mut buf[16..18], special);
        let pagesize_version = (BLCKSZ as u16 & 0xFF00) | (PG_PAGE_LAYOUT_VERSION as u16 & 0x00FF);
        LittleEndian::write_u16(&mut buf[18..20], pagesize_version);
        LittleEndian::write_u32(&mut buf[20..24], 0); // prune_xid
    }

    fn sample_page(lsn: u64) -> [u8; BLCKSZ as usize] {
        let mut page = [0x42u8; BLCKSZ as usize];
        write_header(&mut page, lsn, SIZE_OF_PAGE_HEADER, 8000, 8192);
        for b in &mut page[SIZE_OF_PAGE_HEADER as usize..8000] {
            *b = 0;
        }
        page
    }

    fn relation_file(dir: &Path, name: &str, pages: &[[u8; BLCKSZ as usize]]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        for page in pages {
            f.write_all(page).unwrap();
        }
        path
    }

    #[test]
    fn full_diff_with_no_parent_emits_every_page() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let src = relation_file(root, "16384", &[sample_page(10), sample_page(20), sample_page(30)]);
        let dest = root.join("16384.out");

        let result = diff_file(&src, &dest, None, true, false, false, false, 0).unwrap();
        assert!(!result.deleted);
        assert!(result.written_bytes > 0);

        let mut cursor = std::fs::read(&dest).unwrap();
        let mut cursor = &cursor[..];
        let mut seen = Vec::new();
        while let Some(rec) = page::read_record(&mut cursor, 0).unwrap() {
            seen.push(rec.block());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn incremental_diff_skips_pages_at_or_below_parent_lsn() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let src = relation_file(root, "16384", &[sample_page(10), sample_page(20), sample_page(30)]);
        let dest = root.join("16384.out");

        let result = diff_file(&src, &dest, Some(Lsn(20)), false, false, false, true, 0).unwrap();
        assert!(!result.deleted);

        let bytes = std::fs::read(&dest).unwrap();
        let mut cursor = &bytes[..];
        let mut blocks = Vec::new();
        let mut endpoints = Vec::new();
        while let Some(rec) = page::read_record(&mut cursor, 0).unwrap() {
            match rec {
                page::BackupPageRecord::Page { block, .. } => blocks.push(block),
                page::BackupPageRecord::Endpoint { block } => endpoints.push(block),
            }
        }
        // only block 2 (lsn 30) is strictly above the parent lsn 20.
        assert_eq!(blocks, vec![2]);
        assert_eq!(endpoints, vec![3]);
    }

    #[test]
    fn zero_new_pages_deletes_destination_and_reports_minus_one() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let src = relation_file(root, "16384", &[sample_page(10), sample_page(20)]);
        let dest = root.join("16384.out");

        let result = diff_file(&src, &dest, Some(Lsn(100)), false, false, false, true, 0).unwrap();
        assert!(result.deleted);
        assert_eq!(result.written_bytes, -1);
        assert!(!dest.exists());
    }

    #[test]
    fn partial_tail_at_block_gt_zero_preserves_size_as_raw_page() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let path = root.join("16386");
        let mut f = File::create(&path).unwrap();
        f.write_all(&sample_page(10)).unwrap();
        f.write_all(&[0x55u8; 100]).unwrap(); // short tail: block 1, only 100 bytes
        drop(f);
        let dest = root.join("16386.out");

        let result = diff_file(&path, &dest, None, true, false, false, false, 0).unwrap();
        assert!(!result.deleted);

        let bytes = std::fs::read(&dest).unwrap();
        let mut cursor = &bytes[..];
        let mut blocks = Vec::new();
        while let Some(rec) = page::read_record(&mut cursor, 0).unwrap() {
            blocks.push(rec.block());
        }
        assert_eq!(blocks, vec![0, 1]);
    }

    #[test]
    fn unparseable_page_falls_back_to_opaque_copy() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        // PG_VERSION-style tiny file: not a data page at all.
        let src = root.join("PG_VERSION");
        std::fs::write(&src, b"16\n").unwrap();
        let dest = root.join("PG_VERSION.out");

        let result = diff_file(&src, &dest, None, true, false, false, false, 0).unwrap();
        assert!(!result.deleted);
        assert_eq!(std::fs::read(&dest).unwrap(), b"16\n");
    }

    #[test]
    fn gin_metapage_falls_back_to_opaque_copy_of_whole_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path().as_std_path();
        let mut meta = sample_page(10);
        LittleEndian::write_u32(&mut meta[SIZE_OF_PAGE_HEADER as usize..SIZE_OF_PAGE_HEADER as usize + 4], 0x1717_1717);
        let src = relation_file(root, "16385", &[meta, sample_page(20)]);
        let dest = root.join("16385.out");

        let result = diff_file(&src, &dest, None, true, false, false, false, 0).unwrap();
        assert!(!result.deleted);
        assert_eq!(result.written_bytes as u64, 2 * BLCKSZ as u64);
    }
}
