use std::path::PathBuf;
use std::sync::Arc;

use sqlx::migrate::Migrator;
use sqlx::postgres::PgConnection;
use sqlx::Connection;

use crate::error::BootError;
use crate::logger::{Field, Logger};

/// One-shot schema migration gate, run at boot before anything serves
/// requests.
///
/// Opens a directory of versioned migration scripts, connects to the
/// migration target, and applies every pending migration in ascending
/// version order. A database that is already current is a success, and a
/// repeated run is a no-op: the applied-version marker lives in the target
/// database itself, so no state is held here between runs.
///
/// Any failure is a fatal boot condition; there is no partial-apply
/// recovery.
pub struct MigrationRunner {
    source_dir: PathBuf,
    target: String,
    logger: Arc<dyn Logger>,
}

impl MigrationRunner {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        target: impl Into<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            target: target.into(),
            logger,
        }
    }

    /// Apply all pending migrations, in ascending version order.
    pub async fn run_pending(&self) -> Result<(), BootError> {
        let migrator = Migrator::new(self.source_dir.as_path())
            .await
            .map_err(|e| self.fail("failed to open migration source", e.into()))?;
        self.logger.info(
            "applying pending migrations",
            &[
                Field::new("source", self.source_dir.display()),
                Field::new("known", migrator.iter().count()),
            ],
        );
        let mut conn = PgConnection::connect(&self.target)
            .await
            .map_err(|e| self.fail("failed to reach migration target", e.into()))?;
        migrator
            .run_direct(&mut conn)
            .await
            .map_err(|e| self.fail("failed to apply migrations", e.into()))?;
        conn.close().await.ok();
        self.logger.info("schema is up to date", &[]);
        Ok(())
    }

    fn fail(
        &self,
        context: &str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> BootError {
        self.logger.error(
            context,
            &[
                Field::new("source", self.source_dir.display()),
                Field::new("cause", &source),
            ],
        );
        BootError::Migration {
            source_dir: self.source_dir.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NullLogger;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migration_source_is_ordered_by_ascending_version() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("0003_backfill_totals.sql"),
            "UPDATE accounts SET total = 0;",
        )
        .unwrap();
        fs::write(
            dir.path().join("0001_create_accounts.sql"),
            "CREATE TABLE accounts (id BIGINT PRIMARY KEY);",
        )
        .unwrap();
        fs::write(
            dir.path().join("0002_add_total.sql"),
            "ALTER TABLE accounts ADD COLUMN total BIGINT;",
        )
        .unwrap();

        let migrator = Migrator::new(dir.path()).await.unwrap();
        let versions: Vec<i64> = migrator.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn a_bad_migration_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let runner = MigrationRunner::new(
            dir.path().join("does-not-exist"),
            "postgres://localhost/app",
            Arc::new(NullLogger),
        );
        let err = runner.run_pending().await.unwrap_err();
        assert!(matches!(err, BootError::Migration { .. }));
    }
}
