//! Page codec (component C1): parse and validate a fixed-size page buffer,
//! locate its "hole", recompute its checksum, and encode/decode the compact
//! on-disk `BackupPageRecord` the differ/restorer actually move around.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read, Write};

use crate::constants::{
    maxalign, BLCKSZ, PD_VALID_FLAG_BITS, PG_PAGE_LAYOUT_VERSION, SIZE_OF_PAGE_HEADER,
};

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("not a parseable data page")]
    NotADataPage,
    #[error("page is an index metapage (GIN/BRIN/GiST) that hides data after the header")]
    IndexMetapage,
    #[error("corrupted backup page record: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The parsed fixed fields of `PageHeaderData`. `lsn` and `checksum` double
/// as the page's own identity; `lower`/`upper`/`special` delimit the hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: u64,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub page_size: u32,
    pub layout_version: u8,
    pub prune_xid: u32,
}

impl PageHeader {
    pub fn hole_offset(&self) -> u16 {
        self.lower
    }

    pub fn hole_length(&self) -> u16 {
        self.upper.saturating_sub(self.lower)
    }
}

/// Parse the fixed header out of a page buffer without validating it.
/// The pagesize/version are packed together in a single 16-bit field, the
/// high byte holding the size and the low byte the layout version.
pub fn parse_header(buf: &[u8]) -> Option<PageHeader> {
    if buf.len() < SIZE_OF_PAGE_HEADER as usize {
        return None;
    }
    let lsn = LittleEndian::read_u64(&buf[0..8]);
    let checksum = LittleEndian::read_u16(&buf[8..10]);
    let flags = LittleEndian::read_u16(&buf[10..12]);
    let lower = LittleEndian::read_u16(&buf[12..14]);
    let upper = LittleEndian::read_u16(&buf[14..16]);
    let special = LittleEndian::read_u16(&buf[16..18]);
    let pagesize_version = LittleEndian::read_u16(&buf[18..20]);
    let prune_xid = LittleEndian::read_u32(&buf[20..24]);
    Some(PageHeader {
        lsn,
        checksum,
        flags,
        lower,
        upper,
        special,
        page_size: (pagesize_version & 0xFF00) as u32,
        layout_version: (pagesize_version & 0x00FF) as u8,
        prune_xid,
    })
}

fn write_header(buf: &mut [u8], h: &PageHeader) {
    LittleEndian::write_u64(&mut buf[0..8], h.lsn);
    LittleEndian::write_u16(&mut buf[8..10], h.checksum);
    LittleEndian::write_u16(&mut buf[10..12], h.flags);
    LittleEndian::write_u16(&mut buf[12..14], h.lower);
    LittleEndian::write_u16(&mut buf[14..16], h.upper);
    LittleEndian::write_u16(&mut buf[16..18], h.special);
    let pagesize_version = (h.page_size as u16 & 0xFF00) | (h.layout_version as u16 & 0x00FF);
    LittleEndian::write_u16(&mut buf[18..20], pagesize_version);
    LittleEndian::write_u32(&mut buf[20..24], h.prune_xid);
}

/// Magic numbers/markers the three known index-AM metapage layouts stash
/// right after the standard header, without ever updating `lower` to cover
/// them. Offsets are relative to the start of the page. Only meaningful at
/// block 0.
const METAPAGE_MARKER_OFFSET: usize = SIZE_OF_PAGE_HEADER as usize;
const GIN_META_MAGIC: u32 = 0x1717_1717;
const BRIN_META_MAGIC: u32 = 0xA810_9CFA;
const GIST_PAGE_ID: u16 = 0xFF81;

fn is_known_index_metapage(block: u32, buf: &[u8]) -> bool {
    if block != 0 || buf.len() < METAPAGE_MARKER_OFFSET + 4 {
        return false;
    }
    let marker_u32 = LittleEndian::read_u32(&buf[METAPAGE_MARKER_OFFSET..METAPAGE_MARKER_OFFSET + 4]);
    if marker_u32 == GIN_META_MAGIC || marker_u32 == BRIN_META_MAGIC {
        return true;
    }
    let marker_u16 = LittleEndian::read_u16(&buf[METAPAGE_MARKER_OFFSET..METAPAGE_MARKER_OFFSET + 2]);
    marker_u16 == GIST_PAGE_ID
}

/// The validity test of §4.1: is `buf` (exactly `BLCKSZ` bytes) a page this
/// codec can parse and re-emit losslessly? Returns the parsed header on
/// success; any failure (including a detected index metapage) means the
/// caller should fall back to an opaque byte-for-byte copy of the file.
pub fn validate_page(buf: &[u8], block: u32) -> Result<PageHeader, PageError> {
    if buf.len() != BLCKSZ as usize {
        return Err(PageError::NotADataPage);
    }
    let h = parse_header(buf).ok_or(PageError::NotADataPage)?;

    if h.page_size != BLCKSZ
        || h.layout_version != PG_PAGE_LAYOUT_VERSION
        || h.flags & !PD_VALID_FLAG_BITS != 0
        || !(SIZE_OF_PAGE_HEADER <= h.lower && h.lower <= h.upper && h.upper <= h.special)
        || h.special as u32 > BLCKSZ
        || h.special as u32 != maxalign(h.special as u32)
        || h.lsn == 0
    {
        return Err(PageError::NotADataPage);
    }

    if is_known_index_metapage(block, buf) {
        return Err(PageError::IndexMetapage);
    }

    Ok(h)
}

/// One captured page, on the wire: `BackupPageRecord` header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupPageRecord {
    /// A captured page. `body` is `BLCKSZ - holeLength` bytes: the page
    /// minus its zeroed hole.
    Page {
        block: u32,
        hole_offset: u16,
        hole_length: u16,
        body: Vec<u8>,
    },
    /// Marks the end of a relation in an incremental record; `block` is the
    /// relation's total page count, so restore must truncate the
    /// destination to `block * BLCKSZ` bytes.
    Endpoint { block: u32 },
}

impl BackupPageRecord {
    pub fn block(&self) -> u32 {
        match self {
            BackupPageRecord::Page { block, .. } => *block,
            BackupPageRecord::Endpoint { block } => *block,
        }
    }
}

/// Encode a validated page into its `BackupPageRecord` form, optionally
/// recomputing its checksum first (when cluster-wide data checksums are
/// enabled). `abs_block` is the segment-aware absolute block number
/// (`block + segno * REL_SEGSZ`) the checksum is computed over.
pub fn encode_page(
    mut page: [u8; BLCKSZ as usize],
    block: u32,
    abs_block: u32,
    recompute_checksum: bool,
) -> Result<Vec<u8>, PageError> {
    let mut header = validate_page(&page, block)?;

    let hole_offset = header.lower;
    let hole_length = header.upper - header.lower;

    // zero the hole in our working copy before emitting.
    for b in &mut page[hole_offset as usize..header.upper as usize] {
        *b = 0;
    }

    if recompute_checksum {
        header.checksum = crate::checksum::page_checksum(&page, abs_block);
        write_header(&mut page, &header);
    }

    let mut out = Vec::with_capacity(9 + BLCKSZ as usize - hole_length as usize);
    out.write_all(&block.to_le_bytes())?;
    out.write_all(&hole_offset.to_le_bytes())?;
    out.write_all(&hole_length.to_le_bytes())?;
    out.write_all(&[0u8])?; // endpoint = false
    out.write_all(&page[0..hole_offset as usize])?;
    out.write_all(&page[header.upper as usize..])?;
    Ok(out)
}

/// Encode a short (truncated) final read at `block > 0` (§4.1 edge policy
/// b): the bytes actually read, zero-padded out to `BLCKSZ`, emitted with
/// no hole at all so the destination file keeps exactly the same page
/// count it would have gotten from an opaque copy, without losing the
/// partial tail to a metapage-style fallback.
pub fn encode_raw_page(block: u32, partial: &[u8]) -> Vec<u8> {
    let mut page = [0u8; BLCKSZ as usize];
    page[..partial.len()].copy_from_slice(partial);

    let mut out = Vec::with_capacity(9 + BLCKSZ as usize);
    out.extend_from_slice(&block.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // hole_offset
    out.extend_from_slice(&0u16.to_le_bytes()); // hole_length
    out.push(0); // endpoint = false
    out.extend_from_slice(&page);
    out
}

pub fn encode_endpoint(block: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(&block.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.push(1); // endpoint = true
    out
}

/// Read and decode one `BackupPageRecord` from `r`. `min_block` is the
/// smallest block number acceptable here (the restore-time "expected
/// minimum block" check of §4.1c); violations are reported as corruption,
/// never silently accepted. Returns `Ok(None)` at a clean end of stream
/// (no bytes read at all).
pub fn read_record<R: Read>(r: &mut R, min_block: u32) -> Result<Option<BackupPageRecord>, PageError> {
    let mut head = [0u8; 9];
    match read_exact_or_eof(r, &mut head)? {
        false => return Ok(None),
        true => {}
    }
    let block = LittleEndian::read_u32(&head[0..4]);
    let hole_offset = LittleEndian::read_u16(&head[4..6]);
    let hole_length = LittleEndian::read_u16(&head[6..8]);
    let endpoint = head[8] != 0;

    if block < min_block {
        return Err(PageError::Corrupted(format!(
            "block {block} precedes expected minimum {min_block}"
        )));
    }
    if hole_offset as u32 > BLCKSZ {
        return Err(PageError::Corrupted(format!(
            "hole offset {hole_offset} exceeds page size"
        )));
    }
    if hole_offset as u32 + hole_length as u32 > BLCKSZ {
        return Err(PageError::Corrupted(format!(
            "hole offset {hole_offset} + length {hole_length} exceeds page size"
        )));
    }

    if endpoint {
        return Ok(Some(BackupPageRecord::Endpoint { block }));
    }

    let body_len = BLCKSZ as usize - hole_length as usize;
    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body)?;

    Ok(Some(BackupPageRecord::Page {
        block,
        hole_offset,
        hole_length,
        body,
    }))
}

/// Reassemble the full `BLCKSZ`-byte page a `BackupPageRecord::Page`
/// represents: the hole (zeroed) spliced back between the two body
/// halves.
pub fn reassemble_page(block: u32, hole_offset: u16, hole_length: u16, body: &[u8]) -> [u8; BLCKSZ as usize] {
    let _ = block;
    let mut page = [0u8; BLCKSZ as usize];
    let upper = hole_offset as usize + hole_length as usize;
    page[0..hole_offset as usize].copy_from_slice(&body[0..hole_offset as usize]);
    page[upper..].copy_from_slice(&body[hole_offset as usize..]);
    page
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        Ok(false)
    } else if filled == buf.len() {
        Ok(true)
    } else {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read of backup page record header",
        ))
    }
}
