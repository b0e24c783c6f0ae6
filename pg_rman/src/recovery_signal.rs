//! Recovery-signal artifact generation (§6.3), bit-exact in content.

use std::io::Write;
use std::path::Path;

use crate::error::{RmanError, Result};

const SIDECAR_NAME: &str = "recovery.pg_rman.conf";
const INCLUDE_MARKER: &str = "# added by pg_rman";

#[derive(Debug, Clone, Default)]
pub struct RecoveryTarget {
    pub time: Option<String>,
    pub xid: Option<String>,
    pub inclusive: Option<bool>,
    pub timeline: String,
    pub action: Option<String>,
}

/// Write the sidecar config, wire it into the main config via an
/// `include` directive, drop `recovery.signal`, and remove any
/// `standby.signal` so the restored cluster comes up as primary.
pub fn write_recovery_artifacts(
    pgdata: &Path,
    main_conf_path: &Path,
    arclog_path: &Path,
    target: &RecoveryTarget,
    pg_rman_version: &str,
) -> Result<()> {
    write_sidecar(pgdata, arclog_path, target, pg_rman_version)?;
    append_include_directive(main_conf_path)?;

    std::fs::write(pgdata.join("recovery.signal"), b"")?;

    let standby_signal = pgdata.join("standby.signal");
    if standby_signal.exists() {
        std::fs::remove_file(standby_signal)?;
    }

    Ok(())
}

fn write_sidecar(
    pgdata: &Path,
    arclog_path: &Path,
    target: &RecoveryTarget,
    pg_rman_version: &str,
) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("# added by pg_rman {pg_rman_version}\n"));
    out.push_str(&format!(
        "restore_command = 'cp {}/%f %p'\n",
        arclog_path.display()
    ));
    if let Some(t) = &target.time {
        out.push_str(&format!("recovery_target_time = '{t}'\n"));
    }
    if let Some(x) = &target.xid {
        out.push_str(&format!("recovery_target_xid = '{x}'\n"));
    }
    if let Some(inclusive) = target.inclusive {
        out.push_str(&format!("recovery_target_inclusive = '{inclusive}'\n"));
    }
    out.push_str(&format!("recovery_target_timeline = '{}'\n", target.timeline));
    if let Some(action) = &target.action {
        out.push_str(&format!("recovery_target_action = '{action}'\n"));
    }

    std::fs::write(pgdata.join(SIDECAR_NAME), out)?;
    Ok(())
}

/// Append `include = '<sidecar>' # added by pg_rman` to the main config
/// file, first stripping any prior line carrying that same marker so
/// repeated restores don't accumulate directives.
fn append_include_directive(main_conf_path: &Path) -> Result<()> {
    let existing = std::fs::read_to_string(main_conf_path)
        .map_err(|e| RmanError::Corrupted(format!("{}: {e}", main_conf_path.display())))?;

    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| !line.contains(INCLUDE_MARKER))
        .collect();

    let directive = format!("include = '{SIDECAR_NAME}' {INCLUDE_MARKER}");
    let owned_directive = directive.clone();
    lines.push(&owned_directive);

    let mut file = std::fs::File::create(main_conf_path)?;
    for line in &lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}
