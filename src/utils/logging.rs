//! Process-wide `tracing` setup: stderr output, an optional rotating log file,
//! and an optional prefix on every line.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::{Format, Writer};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, LoggingConfig};

/// Number of dated log files kept.
const KEPT_LOG_FILES: usize = 2;

/// Targets that are chatty at info level and only interesting when they fail.
const NOISY_TARGETS: &[&str] = &["aws_config", "aws_smithy_runtime", "aws_sdk_s3", "hyper", "sqlx"];

/// Default event format with a fixed prefix in front of each line.
pub struct PrefixedFormat {
    prefix: Option<String>,
    inner: Format,
}

impl PrefixedFormat {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            inner: Format::default(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for PrefixedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(writer, "{} ", prefix)?;
        }
        self.inner.format_event(ctx, writer, event)
    }
}

/// Noisy targets never log below warn, even when the app runs at debug.
fn noisy_target_level(level: LogLevel) -> LogLevel {
    level.max(LogLevel::Warning)
}

pub fn filter_directives(level: LogLevel) -> String {
    let noisy = noisy_target_level(level).as_directive();
    let mut directives = vec![level.as_directive().to_string()];
    directives.extend(NOISY_TARGETS.iter().map(|t| format!("{}={}", t, noisy)));
    directives.join(",")
}

pub fn env_filter(level: LogLevel) -> Result<EnvFilter> {
    EnvFilter::try_new(filter_directives(level)).context("Failed to build log filter")
}

/// Opens a daily-rotated, non-blocking writer for `path`. Files are named
/// `<file name>.<date>` in the parent directory. Lines are flushed until the
/// returned guard is dropped.
pub fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(KEPT_LOG_FILES)
        .build(directory)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber. Must be called once, before any run starts.
/// The returned guard must be held for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(PrefixedFormat::new(config.prefix.clone()));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .event_format(PrefixedFormat::new(config.prefix.clone()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(config.level)?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    Ok(guard)
}
