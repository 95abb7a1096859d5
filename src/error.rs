use std::path::PathBuf;

use thiserror::Error;

type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Faults that can occur while assembling and booting the process.
///
/// Everything here is fatal at boot except where a caller explicitly chooses
/// to continue (stop hooks). Per-operation database errors are not part of
/// this taxonomy: they surface as `sqlx::Error` to the immediate caller.
#[derive(Error, Debug)]
pub enum BootError {
    /// The same capability contract was registered twice.
    #[error("contract '{0}' is already registered")]
    DuplicateRegistration(String),

    /// A contract was requested that was never registered, or that a
    /// constructor did not declare as a dependency.
    #[error("unresolved dependency: contract '{contract}' is not available{}", required_by.as_ref().map(|r| format!(" (required by '{r}')")).unwrap_or_default())]
    UnresolvedDependency {
        contract: String,
        required_by: Option<String>,
    },

    /// The dependency graph contains a cycle involving the listed contracts.
    #[error("cyclic dependency among contracts: {0}")]
    CyclicDependency(String),

    /// A constructor failed, or was consumed by an earlier failed attempt.
    #[error("construction of '{contract}' failed: {source}")]
    Construction {
        contract: String,
        #[source]
        source: DynError,
    },

    /// Start hooks run exactly once per process.
    #[error("container was already started")]
    AlreadyStarted,

    /// A start hook failed, aborting the boot sequence.
    #[error("start hook of '{contract}' failed: {source}")]
    StartHook {
        contract: String,
        #[source]
        source: DynError,
    },

    /// The configuration file is missing, unreadable, or malformed.
    #[error("failed to load configuration from {}: {source}", path.display())]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: DynError,
    },

    /// A configuration subtree did not decode into the requested shape.
    #[error("failed to decode configuration key '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The connection string is invalid or the database is unreachable.
    #[error("failed to initialize connection pool for '{target}': {source}")]
    PoolInit {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    /// The migration source is bad or a migration failed to apply.
    #[error("migration from {} failed: {source}", source_dir.display())]
    Migration {
        source_dir: PathBuf,
        #[source]
        source: DynError,
    },
}

/// Enables logging of errors, to move forward without returning the error.
pub trait LogError<T>: Sized {
    /// Logs if there was an error and converts the result into an option
    fn log(self) -> Option<T> {
        self.log_as(tracing::log::Level::Error)
    }
    /// Logs if there was an error with a message and converts the result into an option
    fn log_context(self, ctx: &str) -> Option<T> {
        self.log_with_context(|| ctx.into())
    }
    /// Lazily logs if there was an error with a message and converts the result into an option
    fn log_with_context<Ctx: Fn() -> String>(self, ctx: Ctx) -> Option<T> {
        self.log_with_context_as(tracing::log::Level::Error, ctx)
    }

    /// Logs if there was an error at the provided log level and converts the result into an option
    fn log_as(self, level: tracing::log::Level) -> Option<T>;
    /// Lazily logs if there was an error with a message at the provided log level, and converts the result into an option
    fn log_with_context_as<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Option<T>;
}

impl<T, E: std::fmt::Display + 'static> LogError<T> for Result<T, E> {
    fn log_as(self, level: tracing::log::Level) -> Option<T> {
        self.map_err(|e| {
            let es = display_error(&e);
            log!(level, "{es}");
            e
        })
        .ok()
    }

    fn log_with_context_as<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Option<T> {
        self.map_err(|e| {
            let ctx = ctx();
            let es = display_error(&e);
            log!(level, "error: `{ctx}` - {es}");
            e
        })
        .ok()
    }
}

macro_rules! log {
    ($level:expr, $($args:tt),*) => {
        match $level {
            tracing::log::Level::Error => tracing::error!($($args),*),
            tracing::log::Level::Warn => tracing::warn!($($args),*),
            tracing::log::Level::Info => tracing::info!($($args),*),
            tracing::log::Level::Debug => tracing::debug!($($args),*),
            tracing::log::Level::Trace => tracing::trace!($($args),*),
        };
    };
}
pub(crate) use log;

/// use this to make sure you have a descriptive message including a stack trace
/// for anyhow errors, and otherwise just display the normal string for other
/// errors.
pub fn display_error<E: std::fmt::Display + 'static>(e: &E) -> String {
    match (e as &dyn std::any::Any).downcast_ref::<anyhow::Error>() {
        Some(err) => {
            let mut s = String::new();
            format_anyhow(err, &mut s).unwrap();
            s
        }
        None => format!("{e}"),
    }
}

fn format_anyhow<W: std::fmt::Write>(e: &anyhow::Error, f: &mut W) -> std::fmt::Result {
    write!(f, "{}", e)?;
    for i in e.chain().skip(1) {
        write!(f, ", caused by: {}", i)?;
    }
    write!(f, "\nstack backtrace:\n{}", e.backtrace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_dependency_names_both_sides() {
        let err = BootError::UnresolvedDependency {
            contract: "Arc<dyn Querier>".into(),
            required_by: Some("Arc<MigrationRunner>".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Arc<dyn Querier>"));
        assert!(msg.contains("required by 'Arc<MigrationRunner>'"));
    }

    #[test]
    fn log_with_context_recovers_the_ok_value() {
        let ok: Result<u8, String> = Ok(7);
        assert_eq!(ok.log_context("never printed"), Some(7));
        let err: Result<u8, String> = Err("boom".into());
        assert_eq!(err.log_context("stop hook failed"), None);
    }
}
