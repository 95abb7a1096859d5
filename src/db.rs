use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Transaction};

use crate::config::Config;
use crate::error::BootError;
use crate::logger::{Field, Logger};
use crate::util::normalize_statement;

/// One positional statement argument, tagged so it can be both bound and
/// logged.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Null => f.write_str("NULL"),
            Param::Bool(v) => write!(f, "{v}"),
            Param::Int(v) => write!(f, "{v}"),
            Param::Float(v) => write!(f, "{v}"),
            Param::Text(v) => write!(f, "'{v}'"),
            Param::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v.into())
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

fn render_params(params: &[Param]) -> String {
    let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

fn bind_params<'q>(
    sql: &'q str,
    params: &'q [Param],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Param::Null => query.bind(Option::<String>::None),
            Param::Bool(v) => query.bind(*v),
            Param::Int(v) => query.bind(*v),
            Param::Float(v) => query.bind(*v),
            Param::Text(v) => query.bind(v.as_str()),
            Param::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}

/// A round of related statements executed on one connection, inside one
/// transaction.
#[derive(Default)]
pub struct Batch {
    statements: Vec<(String, Vec<Param>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<Param>) {
        self.statements.push((sql.into(), params));
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Database access capability over the shared connection pool.
///
/// Each operation checks a connection out for its own duration and logs the
/// statement and arguments at info level before dispatch. Transient errors
/// surface to the caller unmodified; cancelling (dropping) an operation's
/// future aborts it without affecting other callers.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Execute a statement, returning the number of affected rows.
    async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64, sqlx::Error>;

    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<PgRow>, sqlx::Error>;

    /// Execute a query expected to return exactly one row.
    async fn query_row(&self, sql: &str, params: &[Param]) -> Result<PgRow, sqlx::Error>;

    /// Open an explicit transaction on a checked-out connection.
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error>;

    /// Execute every queued statement transactionally, returning affected
    /// row counts per statement.
    async fn send_batch(&self, batch: Batch) -> Result<Vec<u64>, sqlx::Error>;
}

/// The stock [`Querier`] over a bounded `sqlx` postgres pool.
pub struct PooledDb {
    pool: PgPool,
    logger: Arc<dyn Logger>,
}

impl PooledDb {
    /// Connect eagerly using `database.dns` and `database.maxConns`
    /// (default 5). An invalid connection string or unreachable target is a
    /// fatal startup condition; there is no retry loop here.
    pub async fn connect(config: &dyn Config, logger: Arc<dyn Logger>) -> Result<Self, BootError> {
        let dns = config.get_string("database.dns");
        let max_conns = match config.get_int("database.maxConns") {
            0 => 5,
            n => n as u32,
        };
        let pool = PgPoolOptions::new()
            .max_connections(max_conns)
            .connect(&dns)
            .await
            .map_err(|source| {
                logger.error(
                    "failed to initialize connection pool",
                    &[Field::new("target", &dns)],
                );
                BootError::PoolInit {
                    target: dns.clone(),
                    source,
                }
            })?;
        logger.info(
            "connection pool ready",
            &[Field::new("max_conns", max_conns)],
        );
        Ok(Self { pool, logger })
    }

    fn log_statement(&self, op: &str, sql: &str, params: &[Param]) {
        self.logger.info(
            op,
            &[
                Field::new("statement", normalize_statement(sql)),
                Field::new("args", render_params(params)),
            ],
        );
    }
}

#[async_trait]
impl Querier for PooledDb {
    async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64, sqlx::Error> {
        self.log_statement("db exec", sql, params);
        let done = bind_params(sql, params).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<PgRow>, sqlx::Error> {
        self.log_statement("db query", sql, params);
        bind_params(sql, params).fetch_all(&self.pool).await
    }

    async fn query_row(&self, sql: &str, params: &[Param]) -> Result<PgRow, sqlx::Error> {
        self.log_statement("db query row", sql, params);
        bind_params(sql, params).fetch_one(&self.pool).await
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.logger.info("db begin", &[]);
        self.pool.begin().await
    }

    async fn send_batch(&self, batch: Batch) -> Result<Vec<u64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut affected = Vec::with_capacity(batch.statements.len());
        for (sql, params) in &batch.statements {
            self.log_statement("db batch", sql, params);
            let done = bind_params(sql, params).execute(&mut *tx).await?;
            affected.push(done.rows_affected());
        }
        tx.commit().await?;
        Ok(affected)
    }
}
