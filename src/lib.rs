//! Svc-bootstrap is the startup and composition layer of a backend service:
//! a dependency-resolving lifecycle container that assembles the
//! process-wide singletons (configuration, structured logger, database
//! connection pool, schema migrator) in dependency order and owns the
//! ordered start/stop sequence.
//!
//! Each service is described by the capability contract it provides, the
//! contracts it depends on, and an async constructor. The container
//! topologically sorts the declared graph with ties broken by registration
//! order, constructs each contract lazily and at most once, injects
//! dependencies into their dependents, and runs start hooks in dependency
//! order and stop hooks in exact reverse. Boot failures are fatal by
//! design: a process manager outside this crate owns restarts.
//!
//! The stock assembly boots the conventional stack straight from
//! `configs/configs.json`, applies pending schema migrations, and parks
//! until shutdown:
//!
//! ```no_run
//! use svc_bootstrap::bootstrap::Application;
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Application::assemble().expect("service wiring is static");
//!     app.run().await
//! }
//! ```
//!
//! Custom services register the same way the stock providers do: name the
//! handle type the service provides, declare what it needs, and construct
//! it from the injected dependencies.
//!
//! ```
//! use std::sync::Arc;
//!
//! use svc_bootstrap::container::{Container, ServiceDescriptor};
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct EnglishGreeter;
//!
//! impl Greeter for EnglishGreeter {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), svc_bootstrap::error::BootError> {
//! let container = Container::new();
//! container.register(
//!     ServiceDescriptor::provide::<Arc<dyn Greeter>>().build(|_, lifecycle| async move {
//!         lifecycle.on_stop(|| async { Ok(()) });
//!         Ok(Arc::new(EnglishGreeter) as Arc<dyn Greeter>)
//!     }),
//! )?;
//! container.register(
//!     ServiceDescriptor::provide::<Arc<String>>()
//!         .depends_on::<Arc<dyn Greeter>>()
//!         .build(|deps, _| async move {
//!             let greeter = deps.get::<Arc<dyn Greeter>>()?;
//!             Ok(Arc::new(greeter.greet()))
//!         }),
//! )?;
//! assert_eq!(*container.resolve::<Arc<String>>().await?, "hello");
//! container.start().await?;
//! container.stop().await;
//! # Ok(())
//! # }
//! ```

/// Assembles the stock providers into a runnable application.
pub mod bootstrap;
/// Hierarchical configuration snapshots with environment overrides and live reload.
pub mod config;
/// The dependency-resolution and lifecycle container at the composition root.
pub mod container;
/// Database access through a bounded, logged connection pool.
pub mod db;
/// Boot-time error taxonomy and error-logging helpers.
pub mod error;
/// Leveled structured logging to a json stream and a rotated file.
pub mod logger;
/// One-shot schema migration gate applied at boot.
pub mod migration;

/// misc items that are too small to get their own files,
/// kept out of this file to reduce clutter.
mod util;
pub use util::*;
