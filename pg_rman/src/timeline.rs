//! Timeline history (C8): parse `<tli>.history` files and answer whether a
//! backup's timeline is reachable from a recovery target timeline.

use std::path::Path;

use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::error::{RmanError, Result};

/// One run of history: timeline `tli` was current until `end`, at which
/// point (per the terminating synthetic segment) its successor begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSegment {
    pub tli: TimelineId,
    pub end: Lsn,
}

/// Read `<tli>.history` out of the archive directory (falling back to the
/// catalog's WAL staging copy), returning the chain of segments that ends
/// at `tli` itself with `end = Lsn::MAX`.
///
/// Timeline 1 has no ancestor and thus no history file; its chain is the
/// single synthetic segment `{tli: 1, end: MAX}`.
pub fn read_history(
    archive_dir: &Path,
    staging_dir: Option<&Path>,
    tli: TimelineId,
) -> Result<Vec<TimelineSegment>> {
    if tli.0 <= 1 {
        return Ok(vec![TimelineSegment { tli, end: Lsn::MAX }]);
    }

    let file_name = postgres_ffi::xlog::history_file_name(tli);
    let path = [Some(archive_dir), staging_dir]
        .into_iter()
        .flatten()
        .map(|dir| dir.join(&file_name))
        .find(|p| p.exists());

    let Some(path) = path else {
        return Err(RmanError::Corrupted(format!(
            "missing timeline history file {file_name}"
        )));
    };

    let text = std::fs::read_to_string(&path).map_err(|e| RmanError::System(e.into()))?;
    let mut segments = parse_history(&text)?;
    segments.push(TimelineSegment { tli, end: Lsn::MAX });
    Ok(segments)
}

/// Parse the body of a history file: non-comment lines of
/// `"<tli> <lsn> [comment...]"`, strictly monotonically increasing in tli.
fn parse_history(text: &str) -> Result<Vec<TimelineSegment>> {
    let mut segments = Vec::new();
    let mut last_tli = 0u32;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, char::is_whitespace);
        let tli_str = fields
            .next()
            .ok_or_else(|| RmanError::Corrupted(format!("bad history line {line:?}")))?;
        let lsn_str = fields
            .next()
            .ok_or_else(|| RmanError::Corrupted(format!("bad history line {line:?}")))?;

        let tli: u32 = tli_str
            .parse()
            .map_err(|_| RmanError::Corrupted(format!("bad tli in {line:?}")))?;
        let lsn: Lsn = lsn_str
            .parse()
            .map_err(|_| RmanError::Corrupted(format!("bad lsn in {line:?}")))?;

        if tli <= last_tli {
            return Err(RmanError::Corrupted(format!(
                "timeline history is not monotonically increasing at {line:?}"
            )));
        }
        last_tli = tli;
        segments.push(TimelineSegment { tli: TimelineId(tli), end: lsn });
    }

    Ok(segments)
}

/// Is `backup_tli`/`backup_stop_lsn` reachable from this chain of
/// segments, i.e. does some segment in the chain match the backup's
/// timeline with the backup's stop LSN strictly below that segment's end?
pub fn reachable(segments: &[TimelineSegment], backup_tli: TimelineId, backup_stop_lsn: Lsn) -> bool {
    segments
        .iter()
        .any(|seg| seg.tli == backup_tli && backup_stop_lsn < seg.end)
}

/// Probe `start+1, start+2, ...` for history files on disk until a gap,
/// returning the last present timeline (or `start` if none exist yet).
pub fn newest_on_disk(archive_dir: &Path, start: TimelineId) -> TimelineId {
    let mut newest = start;
    let mut probe = start.0 + 1;
    loop {
        let path = archive_dir.join(postgres_ffi::xlog::history_file_name(TimelineId(probe)));
        if path.exists() {
            newest = TimelineId(probe);
            probe += 1;
        } else {
            break;
        }
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_one_has_no_history_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let segs = read_history(dir.path().as_std_path(), None, TimelineId(1)).unwrap();
        assert_eq!(segs, vec![TimelineSegment { tli: TimelineId(1), end: Lsn::MAX }]);
    }

    #[test]
    fn parses_and_appends_target_tli() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("00000003.history"),
            "1\t0/3000000\tbranch\n2\t0/5000000\tbranch\n",
        )
        .unwrap();
        let segs = read_history(dir.path().as_std_path(), None, TimelineId(3)).unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].tli, TimelineId(1));
        assert_eq!(segs[2], TimelineSegment { tli: TimelineId(3), end: Lsn::MAX });
    }

    #[test]
    fn non_monotonic_tli_is_corrupted() {
        let text = "2 0/1000000\n1 0/2000000\n";
        assert!(matches!(parse_history(text), Err(RmanError::Corrupted(_))));
    }

    #[test]
    fn reachable_checks_tli_and_stop_lsn() {
        let segs = vec![
            TimelineSegment { tli: TimelineId(1), end: Lsn(100) },
            TimelineSegment { tli: TimelineId(2), end: Lsn::MAX },
        ];
        assert!(reachable(&segs, TimelineId(1), Lsn(50)));
        assert!(!reachable(&segs, TimelineId(1), Lsn(150)));
        assert!(reachable(&segs, TimelineId(2), Lsn(999)));
    }

    #[test]
    fn newest_on_disk_stops_at_first_gap() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("00000002.history"), "1 0/100\n").unwrap();
        std::fs::write(dir.path().join("00000003.history"), "2 0/200\n").unwrap();
        // no 00000004.history
        let newest = newest_on_disk(dir.path().as_std_path(), TimelineId(1));
        assert_eq!(newest, TimelineId(3));
    }
}
