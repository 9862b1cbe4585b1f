//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::info;
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Snapshot of per-mount activity, emitted once at teardown so a run's
/// working set size is visible in logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountSummary {
    pub lookups: u64,
    pub opens: u64,
    pub creates: u64,
    pub closes: u64,
    pub uncorrelated_closes: u64,
    pub handles_open: usize,
    pub cache_copies: u64,
    pub cache_hits: u64,
    pub cache_files: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

/// Emit the teardown summary for a mount.
pub fn log_mount_summary(mount_id: &uuid::Uuid, summary: MountSummary) {
    info!(
        target = "compatfs::mount",
        mount_id = %mount_id,
        lookups = summary.lookups,
        opens = summary.opens,
        creates = summary.creates,
        closes = summary.closes,
        uncorrelated_closes = summary.uncorrelated_closes,
        handles_open = summary.handles_open,
        cache_copies = summary.cache_copies,
        cache_hits = summary.cache_hits,
        cache_files = summary.cache_files,
        "mount_summary"
    );
}
