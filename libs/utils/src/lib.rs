//! Small cross-cutting primitives shared by the catalog and its component
//! crates: the LSN/timeline value types, the process-global interrupt flag,
//! and logging setup.

pub mod id;
pub mod interrupt;
pub mod logging;
pub mod lsn;
