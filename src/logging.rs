//! Tracing setup.
//!
//! Log records go to stderr (stdout may be the protocol stream) and, when a
//! log directory is available, to a daily rolling file.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the file writer flushing until dropped.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// `RUST_LOG` directives are honoured; `level` is added on top. If the log
/// file cannot be created, logging continues on stderr only.
pub fn init_tracing(level: Level, log_dir: Option<&Path>, file_prefix: &str) -> LoggingGuard {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let mut file_error = None;
    let (file_layer, guard) = match log_dir.map(|dir| open_log_file(dir, file_prefix)) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            file_error = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Logging already initialised: {e}");
    }

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "File logging disabled");
    }

    LoggingGuard { _file: guard }
}

fn open_log_file(
    dir: &Path,
    prefix: &str,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
}
