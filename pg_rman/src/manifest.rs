//! File-list manifest (C5): one line per captured path, read and written
//! in the grammar of §4.5/§6.4.

use std::fmt;
use std::io::{BufRead, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local};

use crate::error::{RmanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    DataFile,
    Dir,
    Symlink,
    Socket,
}

impl FileType {
    fn to_char(self) -> char {
        match self {
            FileType::File => 'f',
            FileType::DataFile => 'd',
            FileType::Dir => 'D',
            FileType::Symlink => 'l',
            FileType::Socket => 's',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'f' => Some(FileType::File),
            'd' => Some(FileType::DataFile),
            'D' => Some(FileType::Dir),
            'l' => Some(FileType::Symlink),
            's' => Some(FileType::Socket),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileManifestEntry {
    pub rel_path: String,
    pub file_type: FileType,
    /// `-1` denotes "file existed but no pages were new since the parent
    /// LSN" (§3.2 invariant 6); still a manifest entry, still counted.
    pub written_bytes: i64,
    pub crc32c: u32,
    pub mode: u32,
    pub mtime: DateTime<Local>,
    pub symlink_target: Option<String>,
}

impl fmt::Display for FileManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {:08x} {:o} {}",
            self.rel_path,
            self.file_type.to_char(),
            self.written_bytes,
            self.crc32c,
            self.mode,
            self.mtime.to_rfc3339(),
        )?;
        if let Some(target) = &self.symlink_target {
            write!(f, " {target}")?;
        }
        Ok(())
    }
}

impl FromStr for FileManifestEntry {
    type Err = RmanError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let mut parts = line.splitn(7, ' ');
        let corrupted = |msg: &str| RmanError::Corrupted(format!("bad manifest line {line:?}: {msg}"));

        let rel_path = parts.next().ok_or_else(|| corrupted("missing path"))?.to_string();
        let type_char = parts
            .next()
            .ok_or_else(|| corrupted("missing type"))?
            .chars()
            .next()
            .ok_or_else(|| corrupted("empty type"))?;
        let file_type = FileType::from_char(type_char)
            .ok_or_else(|| corrupted(&format!("unknown type char {type_char:?}")))?;
        let written_bytes: i64 = parts
            .next()
            .ok_or_else(|| corrupted("missing size"))?
            .parse()
            .map_err(|_| corrupted("bad size"))?;
        let crc32c = u32::from_str_radix(parts.next().ok_or_else(|| corrupted("missing crc"))?, 16)
            .map_err(|_| corrupted("bad crc"))?;
        let mode = u32::from_str_radix(parts.next().ok_or_else(|| corrupted("missing mode"))?, 8)
            .map_err(|_| corrupted("bad mode"))?;
        let mtime_str = parts.next().ok_or_else(|| corrupted("missing mtime"))?;
        let mtime = DateTime::parse_from_rfc3339(mtime_str)
            .map_err(|_| corrupted("bad mtime"))?
            .with_timezone(&Local);
        let symlink_target = parts.next().map(|s| s.to_string());

        Ok(FileManifestEntry {
            rel_path,
            file_type,
            written_bytes,
            crc32c,
            mode,
            mtime,
            symlink_target,
        })
    }
}

pub fn write_manifest(path: &Path, entries: &[FileManifestEntry]) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for entry in entries {
        writeln!(file, "{entry}")?;
    }
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<Vec<FileManifestEntry>> {
    let file = std::fs::File::open(path)
        .map_err(|e| RmanError::Corrupted(format!("{}: {e}", path.display())))?;
    let mut out = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line.map_err(|e| RmanError::System(e.into()))?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(line.parse()?);
    }
    Ok(out)
}
