//! WAL segment and timeline-history file naming.

use utils::id::TimelineId;
use utils::lsn::Lsn;

/// The 24-hex-digit filename PostgreSQL gives one WAL segment:
/// `<8-digit tli><8-digit log><8-digit seg>`.
pub fn xlog_file_name(tli: TimelineId, segno: u64, wal_seg_size: u64) -> String {
    let segs_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    let log = segno / segs_per_xlogid;
    let seg = segno % segs_per_xlogid;
    format!("{:08X}{:08X}{:08X}", tli.0, log, seg)
}

/// The filename of a timeline's history file: `<8-digit tli>.history`.
pub fn history_file_name(tli: TimelineId) -> String {
    format!("{:08X}.history", tli.0)
}

/// The WAL segment number an LSN falls into.
pub fn lsn_segment_number(lsn: Lsn, wal_seg_size: u64) -> u64 {
    u64::from(lsn) / wal_seg_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlog_file_name_is_24_hex_digits() {
        let name = xlog_file_name(TimelineId(1), 5, 16 * 1024 * 1024);
        assert_eq!(name.len(), 24);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn history_file_name_matches_tli() {
        assert_eq!(history_file_name(TimelineId(0xAB)), "000000AB.history");
    }
}
