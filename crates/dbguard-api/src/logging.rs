use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber filtered by `RUST_LOG`, INFO by default.
/// Stdout stays reserved for command output.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_env_filter(
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing default failed")
}
