use crate::config::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILTER_ENV: &str = "AGENTFLOW_LOG";

fn default_filter_expression(level: &str) -> String {
    format!("warn,agentflow={level}")
}

/// Install the process-wide subscriber writing to stderr. Calling this twice
/// is harmless; the second install is rejected by `tracing` and ignored here.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(level)));

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging subscriber already installed");
    }
}
