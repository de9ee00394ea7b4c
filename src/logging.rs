use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{PipelineError, Result};

/// Sets up the tracing subscriber for the process.
///
/// `RUST_LOG` overrides the default filter. Setting `PIPELINE_LOG_FORMAT=json`
/// switches to one JSON object per line.
///
/// # Arguments
/// * `role` - Process role (query/collect), attached to the startup event
pub fn init_logger(role: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},tower_http={}",
            env!("CARGO_CRATE_NAME"),
            Level::INFO,
            Level::INFO
        ))
    });

    let json = std::env::var("PIPELINE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .compact(),
            )
            .try_init()
    };

    installed.map_err(|e| PipelineError::Configuration(format!("Failed to initialize logger: {}", e)))?;

    tracing::info!(
        role = %role,
        version = env!("CARGO_PKG_VERSION"),
        "logger initialized"
    );
    Ok(())
}
