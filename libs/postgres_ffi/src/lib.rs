//! Binary on-disk formats this catalog must parse or produce, kept
//! separate from the catalog crate the way the original PostgreSQL-facing
//! constants and struct layouts are kept separate from the code that
//! drives them: page headers and the backup page record (`page`), the
//! cluster-geometry constants they're built from (`constants`), and WAL
//! segment/timeline naming helpers (`xlog`).

pub mod checksum;
pub mod constants;
pub mod page;
pub mod xlog;

pub use constants::{BLCKSZ, REL_SEGSZ, WAL_SEGMENT_SIZE};
