use crate::config::{LogFormat, LoggingConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Wires up `tracing` the way a long-running mcoda process would, just with
/// a CLI-sized feature set: one format choice, env-filter override, no
/// rolling file appender.
pub fn init_telemetry(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format {
        LogFormat::Pretty => {
            let layer = fmt::layer().pretty().with_target(true).with_thread_ids(false);
            Registry::default().with(filter).with(layer).try_init()?;
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true);
            Registry::default().with(filter).with(layer).try_init()?;
        }
        LogFormat::Compact => {
            let layer = fmt::layer().compact().with_target(false);
            Registry::default().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

pub fn log_startup_info(workspace_root: &std::path::Path) {
    tracing::info!(workspace = %workspace_root.display(), version = mcoda_core::VERSION, "mcoda starting");
}
