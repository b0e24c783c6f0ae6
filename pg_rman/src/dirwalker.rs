//! Directory walker (C4): enumerate a cluster directory into a
//! deterministic, lexicographically sorted list, honoring the built-in
//! exclude list and an optional user blacklist, and handling tablespace
//! symlinks per §4.4.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Well-known transient subdirectories skipped recursively regardless of
/// user configuration: temporary statistics, and the separately-staged
/// archive/server-log locations when they happen to live under the data
/// directory.
const EXCLUDED_DIRS: &[&str] = &[
    "pg_stat_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
    "pgsql_tmp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFileType {
    Dir,
    Symlink,
    Regular,
}

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub file_type: WalkFileType,
    /// Populated when `omit_symlinks` is true: the target's own type, so
    /// the caller can treat the entry as if it were that kind of file.
    pub symlink_target_type: Option<WalkFileType>,
    /// Populated when `omit_symlinks` is false: the raw link text.
    pub symlink_target: Option<String>,
}

/// One blacklist pattern: an exact relative path (from the data directory
/// root) to skip. Parsed from one line per pattern, `#`-comments allowed.
pub fn parse_blacklist(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn walk(root: &Path, blacklist: &[String], omit_symlinks: bool) -> anyhow::Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    let mut tablespace_links = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = entry?;
        if entry.depth() == 0 {
            continue; // the root itself is implicit, not a manifest entry
        }
        let abs_path = entry.path().to_path_buf();
        let rel_path = abs_path
            .strip_prefix(root)
            .expect("walkdir yields paths under root")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        if is_excluded(&rel_path) || blacklist.iter().any(|p| p == &rel_path) {
            if entry.file_type().is_dir() {
                // walkdir has no "skip subtree" from here without a
                // filter closure; post-filter children instead.
            }
            continue;
        }

        let ft = entry.file_type();
        if ft.is_symlink() {
            if is_direct_tablespace_symlink(&rel_path) {
                tablespace_links.push((rel_path.clone(), abs_path.clone()));
            }
            if omit_symlinks {
                let target_meta = fs::metadata(&abs_path); // follows the link
                let target_type = match target_meta {
                    Ok(m) if m.is_dir() => WalkFileType::Dir,
                    Ok(_) => WalkFileType::Regular,
                    Err(_) => continue, // dangling symlink: nothing to include
                };
                out.push(WalkEntry {
                    rel_path,
                    abs_path,
                    file_type: WalkFileType::Symlink,
                    symlink_target_type: Some(target_type),
                    symlink_target: None,
                });
            } else {
                let target = fs::read_link(&abs_path)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                out.push(WalkEntry {
                    rel_path,
                    abs_path,
                    file_type: WalkFileType::Symlink,
                    symlink_target_type: None,
                    symlink_target: Some(target),
                });
            }
        } else if ft.is_dir() {
            out.push(WalkEntry {
                rel_path,
                abs_path,
                file_type: WalkFileType::Dir,
                symlink_target_type: None,
                symlink_target: None,
            });
        } else {
            out.push(WalkEntry {
                rel_path,
                abs_path,
                file_type: WalkFileType::Regular,
                symlink_target_type: None,
                symlink_target: None,
            });
        }
    }

    // `WalkDir::follow_links(false)` never descends into a symlinked
    // directory, so a tablespace link (`pg_tblspc/<oid>` -> some other
    // filesystem location) would otherwise contribute only its own
    // symlink entry and none of the relation files it points at. Re-walk
    // each tablespace link's target and fold its entries in under the
    // link's own relative path.
    for (link_rel_path, link_abs_path) in &tablespace_links {
        let Ok(target) = fs::canonicalize(link_abs_path) else {
            continue; // dangling tablespace symlink: nothing to include
        };
        if !target.is_dir() {
            continue;
        }
        let sub_entries = walk(&target, blacklist, omit_symlinks)?;
        for mut sub in sub_entries {
            sub.rel_path = format!("{link_rel_path}/{}", sub.rel_path);
            if is_excluded(&sub.rel_path) || blacklist.iter().any(|p| p == &sub.rel_path) {
                continue;
            }
            out.push(sub);
        }
    }

    out.retain(|e| !is_under_excluded_dir(&e.rel_path));
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

/// A direct child of `pg_tblspc` (exactly `pg_tblspc/<oid>`, no further
/// path segments) — the only symlinks this component follows through.
fn is_direct_tablespace_symlink(rel_path: &str) -> bool {
    match rel_path.split_once('/') {
        Some(("pg_tblspc", rest)) => !rest.is_empty() && !rest.contains('/'),
        _ => false,
    }
}

fn is_excluded(rel_path: &str) -> bool {
    EXCLUDED_DIRS
        .iter()
        .any(|d| rel_path == *d || rel_path.starts_with(&format!("{d}/")))
}

fn is_under_excluded_dir(rel_path: &str) -> bool {
    EXCLUDED_DIRS.iter().any(|d| {
        rel_path
            .split('/')
            .next()
            .map(|first| first == *d)
            .unwrap_or(false)
    })
}
