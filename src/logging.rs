//! Log subscriber for the station binary.
//!
//! Library crates log through the `log` facade; the `tracing-log` bridge
//! forwards those records into the `tracing-subscriber` formatter installed
//! here.  `RUST_LOG` overrides the default level.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Raise the default level from `info` to `debug`.
    pub verbose: bool,
    /// One JSON object per line instead of the human-readable format.
    pub json: bool,
}

pub fn init(options: LogOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = if options.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}
