//! `tracing` subscriber setup for the scanner
//!
//! Terminal logs go to stderr; stdout is reserved for scan reports so it can
//! be piped straight into another program.

use crate::config::{LogRotation, LoggingOptions};
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Keeps the log file writer thread alive; flushes pending lines on drop
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Returns `Ok(None)` when a subscriber is already installed (tests, or an
/// embedding application that configured its own).
pub fn init(options: &LoggingOptions) -> Result<Option<LogGuard>> {
    if tracing::dispatcher::has_been_set() {
        return Ok(None);
    }

    let directive = filter_directive(options);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Config(format!("Invalid log level '{directive}': {e}")))?;

    let (file, guard) = match options.file.as_deref() {
        Some(path) => {
            let (writer, guard) = open_writer(path, options.rotation)?;
            (Some(file_layer::<Filtered>(writer)), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(file)
        .with(terminal_layer::<WithFile>(options.color))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;

    Ok(Some(LogGuard { _file: guard }))
}

/// Filter directive: `QSCAN_LOG_LEVEL` wins over the configured level.
///
/// A bare level (`debug`) also quiets the image codecs, which log every
/// decoded JPEG at debug.
fn filter_directive(options: &LoggingOptions) -> String {
    let level = std::env::var("QSCAN_LOG_LEVEL").unwrap_or_else(|_| options.level.clone());
    if level.contains('=') || level.contains(',') {
        level
    } else {
        format!("{level},zune_jpeg=warn,png=warn")
    }
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;
type Filtered = Layered<EnvFilter, Registry>;
type WithFile = Layered<Option<BoxedLayer<Filtered>>, Filtered>;

fn open_writer(path: &Path, rotation: Option<LogRotation>) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::Config(format!(
            "Failed to create log directory {}: {e}",
            dir.display()
        ))
    })?;

    let builder = NonBlockingBuilder::default().lossy(false);
    let Some(rotation) = rotation else {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::Config(format!("Failed to open log file {}: {e}", path.display())))?;
        return Ok(builder.finish(file));
    };

    let file_name = path.file_name().ok_or_else(|| {
        Error::Config(format!(
            "Log file path '{}' must include a filename when rotation is enabled",
            path.display()
        ))
    })?;
    let appender = match rotation {
        LogRotation::Hourly => rolling::hourly(dir, file_name),
        LogRotation::Daily => rolling::daily(dir, file_name),
    };
    Ok(builder.finish(appender))
}

fn file_layer<S>(writer: NonBlocking) -> BoxedLayer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync + 'static,
{
    fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_ansi(false)
        .with_writer(writer)
        .with_target(true)
        .boxed()
}

fn terminal_layer<S>(color: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync + 'static,
{
    fmt::layer()
        .compact()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr)
        .with_ansi(color)
        .with_target(false)
        .boxed()
}
