//! `pg_rman` binary entry point: parses arguments, loads the config file
//! (if any), merges CLI overrides on top, installs the interrupt handler
//! and structured logging, dispatches to the right orchestrator/catalog
//! operation, and turns the result into a process exit code (§6.6).

use std::path::PathBuf;

use clap::Parser;
use comfy_table::{Cell, Table};

use pg_rman::catalog::Catalog;
use pg_rman::cli::{self, Cli, Command};
use pg_rman::config::Config;
use pg_rman::dbclient::PostgresDbClient;
use pg_rman::error::{RmanError, Result};
use pg_rman::orchestrator::backup::run_backup;
use pg_rman::orchestrator::restore::{run_restore, RestoreRequest};

fn main() {
    if let Err(e) = utils::logging::init("info") {
        eprintln!("failed to initialize logging: {e:#}");
        std::process::exit(1);
    }
    utils::interrupt::install_handler();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;

    match cli.command {
        Command::Init => {
            Catalog::init(&config.backup_path).map_err(RmanError::from)?;
            println!("initialized catalog at {}", config.backup_path.display());
            Ok(())
        }
        Command::Backup {
            mode,
            compress,
            smooth_checkpoint,
            with_serverlog,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            config.compress_data = config.compress_data || compress;
            config.smooth_checkpoint = config.smooth_checkpoint || smooth_checkpoint;
            config.with_serverlog = config.with_serverlog || with_serverlog;

            let connstr = config
                .connstr
                .clone()
                .ok_or_else(|| RmanError::Args("CONNSTR (or --connstr) is required for backup".into()))?;
            let mut db = PostgresDbClient::connect(&connstr)?;
            let outcome = run_backup(&config, &mut db)?;
            println!("backup {} ({}) completed", outcome.id, outcome.mode.as_str());
            Ok(())
        }
        Command::Restore {
            timeline,
            target_time,
            target_xid,
            target_inclusive,
            target_action,
            hard_copy,
        } => {
            let req = RestoreRequest {
                target_tli: timeline
                    .map(utils::id::TimelineId)
                    .unwrap_or_else(|| cli::default_timeline(&config.arclog_path)),
                target_time: target_time.as_deref().map(cli::parse_target_time).transpose().map_err(RmanError::from)?,
                target_xid,
                target_inclusive,
                target_action,
                hard_copy: hard_copy || config.hard_copy,
                server_running: server_is_running(&config.pgdata)?,
            };
            run_restore(&config, &req)
        }
        Command::Show => {
            let catalog = Catalog::new(&config.backup_path);
            let backups = catalog.show()?;
            print_backup_table(&backups);
            Ok(())
        }
        Command::Validate { backup_id } => {
            let id = cli::parse_backup_id(&backup_id).map_err(RmanError::from)?;
            let catalog = Catalog::new(&config.backup_path);
            catalog.validate(id)?;
            println!("backup {id} is OK");
            Ok(())
        }
        Command::Delete { backup_id, before } => {
            let catalog = Catalog::new(&config.backup_path);
            match (backup_id, before) {
                (Some(id), None) => {
                    let id = cli::parse_backup_id(&id).map_err(RmanError::from)?;
                    catalog.delete(id)?;
                    println!("deleted backup {id}");
                    Ok(())
                }
                (None, Some(before)) => {
                    let threshold = cli::parse_target_time(&before).map_err(RmanError::from)?;
                    let deleted = catalog.delete_before(threshold)?;
                    println!("deleted {} backup(s)", deleted.len());
                    for id in deleted {
                        println!("  {id}");
                    }
                    Ok(())
                }
                _ => Err(RmanError::Args("delete requires exactly one of BACKUP_ID or --before".into())),
            }
        }
    }
}

/// Merge the config file (if any) with CLI-flag overrides: flags win.
fn build_config(cli: &Cli) -> Result<Config> {
    let mut warnings = Vec::new();
    let mut config = match &cli.config {
        Some(path) => Config::load(path, &mut warnings).map_err(RmanError::from)?,
        None => Config::default(),
    };
    for w in warnings {
        tracing::warn!("{w}");
    }

    if let Some(p) = &cli.pgdata {
        config.pgdata = p.clone();
    }
    if let Some(p) = &cli.backup_path {
        config.backup_path = p.clone();
    }
    if let Some(p) = &cli.arclog_path {
        config.arclog_path = p.clone();
    }

    if config.pgdata == PathBuf::default() {
        return Err(RmanError::Args("PGDATA (or --pgdata) is required".into()));
    }
    if config.backup_path == PathBuf::default() {
        return Err(RmanError::Args("BACKUP_PATH (or --backup-path) is required".into()));
    }

    Ok(config)
}

/// Whether the upstream server is currently running against `pgdata`.
/// Process/PID inspection is external to the restore orchestrator itself;
/// this reads the same `postmaster.pid` lock PostgreSQL itself uses. A
/// pidfile that exists but can't be parsed (missing second line, non-numeric
/// pid) is a distinct FATAL (§6.6 exit code 26) from "no pidfile at all" —
/// it must not be silently treated as "server is down".
fn server_is_running(pgdata: &std::path::Path) -> Result<bool> {
    let contents = match std::fs::read_to_string(pgdata.join("postmaster.pid")) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(RmanError::System(e.into())),
    };
    let pid = contents
        .lines()
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RmanError::PidFileBroken("postmaster.pid has no pid line".into()))?;
    if pid.parse::<u32>().is_err() {
        return Err(RmanError::PidFileBroken(format!("postmaster.pid has a non-numeric pid {pid:?}")));
    }
    Ok(std::path::Path::new("/proc").join(pid).exists())
}

fn print_backup_table(backups: &[pg_rman::backup_record::Backup]) {
    let mut table = Table::new();
    table.set_header(vec!["ID", "Mode", "Status", "Start", "Stop", "Timeline"]);
    for b in backups {
        table.add_row(vec![
            Cell::new(b.id.to_string()),
            Cell::new(b.mode.as_str()),
            Cell::new(b.status.as_str()),
            Cell::new(b.start_lsn.to_string()),
            Cell::new(b.stop_lsn.to_string()),
            Cell::new(b.timeline_id.to_string()),
        ]);
    }
    println!("{table}");
}
