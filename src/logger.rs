use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

use crate::config::Config;

/// Severity of a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Unset or unrecognized levels fall back to debug.
    pub fn parse(level: &str) -> Self {
        match level {
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Debug,
        }
    }

    fn filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// One structured key/value attached to a record.
#[derive(Clone, Debug)]
pub struct Field {
    key: &'static str,
    value: String,
}

impl Field {
    pub fn new(key: &'static str, value: impl fmt::Display) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

fn render_fields(fields: &[Field]) -> String {
    let mut out = String::new();
    for field in fields {
        out.push(' ');
        out.push_str(field.key);
        out.push('=');
        out.push_str(&field.value);
    }
    out
}

/// Leveled, structured logging capability.
///
/// The leveled wrappers capture the caller's location, so the recorded site
/// is the line that logged, not the logger internals.
pub trait Logger: Send + Sync {
    /// Emit one record. Implementations serialize concurrent writes at the
    /// sink.
    fn emit(&self, level: LogLevel, caller: &'static Location<'static>, msg: &str, fields: &[Field]);

    /// Emit at fatal severity, flush buffered output, and terminate the
    /// process with a non-zero exit code.
    fn fatal(&self, msg: &str, fields: &[Field]) -> !;

    #[track_caller]
    fn debug(&self, msg: &str, fields: &[Field]) {
        self.emit(LogLevel::Debug, Location::caller(), msg, fields)
    }

    #[track_caller]
    fn info(&self, msg: &str, fields: &[Field]) {
        self.emit(LogLevel::Info, Location::caller(), msg, fields)
    }

    #[track_caller]
    fn warn(&self, msg: &str, fields: &[Field]) {
        self.emit(LogLevel::Warn, Location::caller(), msg, fields)
    }

    #[track_caller]
    fn error(&self, msg: &str, fields: &[Field]) {
        self.emit(LogLevel::Error, Location::caller(), msg, fields)
    }
}

/// Logger over the tracing ecosystem, fanned out to two sinks: an always-on
/// JSON stream on stdout and a human-readable stream in a rotated file.
///
/// Rotation and the minimum level come from configuration:
/// `logger.level` (default `debug`), `logger.filename` (default
/// `./app.log`), `logger.maxSize` (default 200), `logger.maxBackups`
/// (default 10), `logger.maxAge` (default 30). The file rolls daily and
/// retains `maxBackups` files; old files are never compressed.
pub struct TracingLogger {
    guard: Mutex<Option<WorkerGuard>>,
}

impl TracingLogger {
    /// Build both sinks and install the process-wide subscriber.
    pub fn init(config: &dyn Config) -> anyhow::Result<Arc<Self>> {
        let level = LogLevel::parse(&config.get_string("logger.level"));
        let filename = fallback_if_empty(config.get_string("logger.filename"), "./app.log");
        let max_size = fallback_if_zero(config.get_int("logger.maxSize"), 200);
        let max_backups = fallback_if_zero(config.get_int("logger.maxBackups"), 10);
        let max_age = fallback_if_zero(config.get_int("logger.maxAge"), 30);

        let path = Path::new(&filename);
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("app.log");
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(max_backups as usize)
            .build(directory)?;
        let (file_writer, guard) = tracing_appender::non_blocking(appender);

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.filter_str()));
        Registry::default()
            .with(filter)
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(tracing_fmt::layer().with_writer(file_writer).with_ansi(false))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install global subscriber: {e}"))?;

        tracing::info!(
            level = level.filter_str(),
            file = %filename,
            max_size_mb = max_size,
            max_backups,
            max_age_days = max_age,
            "logger initialized"
        );
        Ok(Arc::new(Self {
            guard: Mutex::new(Some(guard)),
        }))
    }

    /// Flush buffered records by releasing the background writer. Safe to
    /// call more than once; registered as the provider's only stop hook.
    pub fn flush(&self) {
        self.guard.lock().take();
    }
}

impl Logger for TracingLogger {
    fn emit(
        &self,
        level: LogLevel,
        caller: &'static Location<'static>,
        msg: &str,
        fields: &[Field],
    ) {
        let fields = render_fields(fields);
        match level {
            LogLevel::Debug => tracing::debug!(caller = %caller, "{msg}{fields}"),
            LogLevel::Info => tracing::info!(caller = %caller, "{msg}{fields}"),
            LogLevel::Warn => tracing::warn!(caller = %caller, "{msg}{fields}"),
            LogLevel::Error => tracing::error!(caller = %caller, "{msg}{fields}"),
            LogLevel::Fatal => tracing::error!(caller = %caller, fatal = true, "{msg}{fields}"),
        }
    }

    #[track_caller]
    fn fatal(&self, msg: &str, fields: &[Field]) -> ! {
        self.emit(LogLevel::Fatal, Location::caller(), msg, fields);
        self.flush();
        std::process::exit(1);
    }
}

fn fallback_if_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn fallback_if_zero(value: i64, fallback: i64) -> i64 {
    if value == 0 {
        fallback
    } else {
        value
    }
}

/// Logger that swallows records, for wiring code under test.
#[cfg(test)]
pub(crate) struct NullLogger;

#[cfg(test)]
impl Logger for NullLogger {
    fn emit(&self, _: LogLevel, _: &'static Location<'static>, _: &str, _: &[Field]) {}

    fn fatal(&self, msg: &str, _: &[Field]) -> ! {
        panic!("fatal log in test: {msg}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn unrecognized_levels_fall_back_to_debug() {
        assert_eq!(LogLevel::parse(""), LogLevel::Debug);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("info"), LogLevel::Info);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
    }

    #[test]
    fn fields_render_as_key_value_pairs() {
        let rendered = render_fields(&[
            Field::new("statement", "SELECT 1"),
            Field::new("rows", 3),
        ]);
        assert_eq!(rendered, " statement=SELECT 1 rows=3");
        assert_eq!(render_fields(&[]), "");
    }

    #[test]
    fn init_builds_both_sinks_and_flush_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("configs.json");
        let log_path = dir.path().join("svc.log");
        fs::write(
            &config_path,
            format!(
                r#"{{"logger": {{"level": "info", "filename": {:?}}}}}"#,
                log_path.to_str().unwrap()
            ),
        )
        .unwrap();
        let config = FileConfig::load(&config_path).unwrap();
        let logger = TracingLogger::init(&config).unwrap();
        logger.info("pool ready", &[Field::new("conns", 5)]);
        logger.flush();
        logger.flush();
    }
}
