//! `tracing` initialization, reading its filter from `OCTOPLOY_LOG` and
//! optionally mirroring log output to a rotated file under
//! `OCTOPLOY_LOG_DIRECTORY`.

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "OCTOPLOY_LOG";
const LOG_DIRECTORY_ENV: &str = "OCTOPLOY_LOG_DIRECTORY";

/// Guard returned by [`initialize`]; dropping it flushes the file
/// appender's background writer thread. Must be held for the process
/// lifetime when file logging is enabled.
pub struct LoggingGuard(Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initializes the global `tracing` subscriber. `debug` forces at least
/// `debug` level regardless of `OCTOPLOY_LOG`'s contents (used by the
/// CLI's `--debug` flag).
pub fn initialize(debug: bool) -> LoggingGuard {
    let filter = if debug {
        EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new("debug"))
            .add_directive("debug".parse().expect("valid directive"))
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match std::env::var(LOG_DIRECTORY_ENV) {
        Ok(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "octoploy.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .json()
                .init();
            LoggingGuard(Some(guard))
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            LoggingGuard(None)
        }
    }
}
