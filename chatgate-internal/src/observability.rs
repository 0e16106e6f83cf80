use std::fmt;

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

/// Directives used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "chatgate_internal=info,gateway=info,tower_http=warn";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Build the filter from `RUST_LOG`, falling back to `DEFAULT_LOG_FILTER`
pub fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global `tracing` subscriber. Can only succeed once per process.
pub fn setup_logs(format: LogFormat) -> Result<(), Error> {
    let fmt_layer = match format {
        LogFormat::Pretty => subscriber_fmt::layer().boxed(),
        LogFormat::Json => subscriber_fmt::layer()
            .json()
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to initialize logging: {e}"),
            })
        })
}
