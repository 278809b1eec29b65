/*!
 * Tracing setup for the warden binary
 *
 * Console output is compact text on stderr, so stdout stays reserved for
 * admin responses. With `logging.file` set, events go to that file as JSON
 * lines instead. `RUST_LOG` overrides the configured level.
 */

use std::fs::File;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{ConfigError, LoggingConfig};
use crate::error::Result;

/// `verbose` wins over the configured level
pub fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Filter directive used when `RUST_LOG` is unset
fn default_directive(config: &LoggingConfig) -> String {
    format!("warden={}", effective_level(config))
}

pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive(config))
            .map_err(|e| ConfigError::Invalid(format!("bad log filter: {}", e)))?,
    };

    let (console, json) = match &config.file {
        Some(path) => {
            let file = File::create(path).map_err(|source| ConfigError::Write {
                path: path.clone(),
                source,
            })?;
            let layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .json();
            (None, Some(layer))
        }
        None => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact();
            (Some(layer), None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .try_init()
        .map_err(|e| ConfigError::Invalid(format!("logging already initialized: {}", e)))?;
    Ok(())
}

#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer().compact())
            .try_init();
    });
}
