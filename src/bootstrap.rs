use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, FileConfig, DEFAULT_CONFIG_PATH};
use crate::container::{Container, ServiceDescriptor};
use crate::db::{PooledDb, Querier};
use crate::error::{display_error, BootError};
use crate::logger::{Field, Logger, TracingLogger};
use crate::migration::MigrationRunner;

/// Locations the stock providers read from. The defaults match the
/// conventional layout: `configs/configs.json` and `migrations/` relative
/// to the working directory.
pub struct Settings {
    pub config_path: PathBuf,
    pub migration_dir: PathBuf,
    /// Disable to load the configuration file once without a watcher.
    pub watch_config: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: DEFAULT_CONFIG_PATH.into(),
            migration_dir: "migrations".into(),
            watch_config: true,
        }
    }
}

/// The assembled process: a [`Container`] wired with the stock providers.
///
/// Construction order is resolved from the declared dependencies:
/// configuration first (no dependencies), then the logger (configuration),
/// then the connection pool (configuration and logger). Schema migrations
/// run as a start hook once the logger and pool exist, gating everything
/// registered afterwards.
pub struct Application {
    container: Container,
}

impl Application {
    pub fn assemble() -> Result<Self, BootError> {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Result<Self, BootError> {
        let Settings {
            config_path,
            migration_dir,
            watch_config,
        } = settings;
        let container = Container::new();

        container.register(ServiceDescriptor::provide::<Arc<dyn Config>>().build(
            move |_, _| async move {
                let provider = if watch_config {
                    FileConfig::load_and_watch(&config_path)?
                } else {
                    FileConfig::load(&config_path)?
                };
                Ok(Arc::new(provider) as Arc<dyn Config>)
            },
        ))?;

        container.register(
            ServiceDescriptor::provide::<Arc<dyn Logger>>()
                .depends_on::<Arc<dyn Config>>()
                .build(|deps, lifecycle| async move {
                    let config = deps.get::<Arc<dyn Config>>()?;
                    let logger = TracingLogger::init(config.as_ref())?;
                    let flusher = logger.clone();
                    lifecycle.on_stop(move || async move {
                        flusher.flush();
                        Ok(())
                    });
                    Ok(logger as Arc<dyn Logger>)
                }),
        )?;

        container.register(
            ServiceDescriptor::provide::<Arc<dyn Querier>>()
                .depends_on::<Arc<dyn Config>>()
                .depends_on::<Arc<dyn Logger>>()
                .build(|deps, _| async move {
                    let config = deps.get::<Arc<dyn Config>>()?;
                    let logger = deps.get::<Arc<dyn Logger>>()?;
                    let pool = PooledDb::connect(config.as_ref(), logger).await?;
                    Ok(Arc::new(pool) as Arc<dyn Querier>)
                }),
        )?;

        container.register(
            ServiceDescriptor::provide::<Arc<MigrationRunner>>()
                .depends_on::<Arc<dyn Config>>()
                .depends_on::<Arc<dyn Logger>>()
                .build(move |deps, lifecycle| async move {
                    let config = deps.get::<Arc<dyn Config>>()?;
                    let logger = deps.get::<Arc<dyn Logger>>()?;
                    let runner = Arc::new(MigrationRunner::new(
                        migration_dir,
                        config.get_string("database.migration"),
                        logger,
                    ));
                    let gate = runner.clone();
                    lifecycle.on_start(move || async move { Ok(gate.run_pending().await?) });
                    Ok(runner)
                }),
        )?;

        Ok(Self { container })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Construct every service and run the ordered start sequence,
    /// migrations included. Blocks until every start hook has finished or
    /// one has failed.
    pub async fn start(&self) -> Result<(), BootError> {
        self.container.start().await
    }

    /// Tear down in reverse start order.
    pub async fn stop(&self) {
        self.container.stop().await
    }

    /// Boot and park until a shutdown signal, then tear down. A startup
    /// failure is logged with its cause and terminates the process with a
    /// non-zero exit code; there is no supervised-restart mode here, an
    /// external process manager owns restarts.
    pub async fn run(&self) -> ! {
        if let Err(e) = self.start().await {
            let cause = display_error(&e);
            match self.container.get_if_constructed::<Arc<dyn Logger>>() {
                Some(logger) => logger.fatal("startup failed", &[Field::new("cause", &cause)]),
                None => {
                    eprintln!("startup failed: {cause}");
                    std::process::exit(1);
                }
            }
        }
        tracing::info!("startup complete");
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for the shutdown signal: {e}");
        }
        self.stop().await;
        std::process::exit(0);
    }
}
