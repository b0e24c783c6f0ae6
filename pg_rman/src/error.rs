//! The error kinds surfaced to the user (§7) and their process exit codes
//! (§6.6). Every component-level error eventually gets mapped into one of
//! these at its boundary with the orchestrator; internal plumbing is free
//! to use `anyhow` until then.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RmanError {
    #[error("argument error: {0}")]
    Args(String),

    #[error("system error: {0}")]
    System(#[source] anyhow::Error),

    #[error("catalog corrupted: {0}")]
    Corrupted(String),

    #[error("another pg_rman process is already running against this catalog")]
    AlreadyRunning,

    #[error("no backup satisfies the request")]
    NoBackup,

    #[error("cluster block size is incompatible with this catalog: {0}")]
    PgIncompatible(String),

    #[error("the upstream server must not be running for this operation")]
    PgRunning,

    #[error("interrupted")]
    Interrupted,

    #[error("archive failure: {0}")]
    ArchiveFailure(String),

    #[error("postmaster.pid is present but broken: {0}")]
    PidFileBroken(String),
}

impl RmanError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RmanError::ArchiveFailure(_) => 20,
            RmanError::NoBackup => 21,
            RmanError::Corrupted(_) => 22,
            RmanError::AlreadyRunning => 23,
            RmanError::PgIncompatible(_) => 24,
            RmanError::PgRunning => 25,
            RmanError::PidFileBroken(_) => 26,
            RmanError::Args(_) => 12,
            RmanError::Interrupted => 1,
            RmanError::System(_) => 1,
        }
    }
}

impl From<anyhow::Error> for RmanError {
    fn from(e: anyhow::Error) -> Self {
        RmanError::System(e)
    }
}

impl From<std::io::Error> for RmanError {
    fn from(e: std::io::Error) -> Self {
        RmanError::System(e.into())
    }
}

impl From<postgres_ffi::page::PageError> for RmanError {
    fn from(e: postgres_ffi::page::PageError) -> Self {
        match e {
            postgres_ffi::page::PageError::Io(io) => RmanError::System(io.into()),
            other => RmanError::Corrupted(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RmanError>;
