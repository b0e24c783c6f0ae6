//! `tracing`-based logging setup shared by the binary and its integration
//! tests. Honors `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
