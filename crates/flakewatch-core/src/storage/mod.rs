//! Store abstraction: one capability contract, multiple backends.
//!
//! The embedded backend (sqlite, single writer) suits local report
//! generation; the client/server backend (postgres) is the shared
//! historical store. Backends are free to answer analytics reads with
//! [`QueryOutcome::Unsupported`]; callers must distinguish that from
//! "no data".

pub mod postgres;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{
    DurationBucketRow, EnvSummaryRow, EnvironmentRun, FlakeBucketRow, FlakeRow, TestCaseRow,
};

/// Tri-state result of a read capability: data, no data, or a backend that
/// does not implement the capability at all.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome<T> {
    Rows(T),
    Empty,
    Unsupported,
}

impl<T> QueryOutcome<T> {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// Both base tables, newest runs first.
#[derive(Debug, Clone, Serialize)]
pub struct RecentRows {
    pub runs: Vec<EnvironmentRun>,
    pub test_cases: Vec<TestCaseRow>,
}

/// Chart payload for one test within one (environment, group).
#[derive(Debug, Clone, Serialize)]
pub struct TestChart {
    pub env_name: String,
    pub env_group: String,
    pub test_name: String,
    pub flake_by_day: Vec<FlakeBucketRow>,
    pub flake_by_week: Vec<FlakeBucketRow>,
    pub flake_by_month: Vec<FlakeBucketRow>,
    pub duration_by_day: Vec<DurationBucketRow>,
}

/// Chart payload for one (environment, group): the flake standings plus
/// day/week series for the top-N flakiest tests.
#[derive(Debug, Clone, Serialize)]
pub struct EnvChart {
    pub env_name: String,
    pub env_group: String,
    pub flake_rates: Vec<FlakeRow>,
    pub top_flake_by_day: BTreeMap<String, Vec<FlakeBucketRow>>,
    pub top_flake_by_week: BTreeMap<String, Vec<FlakeBucketRow>>,
}

/// Persistence contract implemented by every backend.
///
/// `set` is transactionally self-contained: one run's environment row plus
/// all its test rows commit or roll back as a unit. Concurrent `set` calls
/// for the same key race benignly; last committed wins under upsert
/// semantics.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent schema creation and migration. A failed initialize means
    /// the backend must not be used.
    async fn initialize(&self) -> Result<()>;

    /// Atomic upsert of one run and all its test rows.
    async fn set(&self, run: &EnvironmentRun, rows: &[TestCaseRow]) -> Result<()>;

    /// Most recent rows from both tables.
    async fn recent(&self, limit: i64) -> Result<QueryOutcome<RecentRows>>;

    /// Per-test flake chart for (environment, group, test).
    async fn test_chart(
        &self,
        env: &str,
        group: Option<&str>,
        test: &str,
    ) -> Result<QueryOutcome<TestChart>>;

    /// Per-environment flake chart for (environment, group, top-N tests).
    async fn env_chart(
        &self,
        env: &str,
        group: Option<&str>,
        top_n: usize,
    ) -> Result<QueryOutcome<EnvChart>>;

    /// Cross-environment overview over the trailing window.
    async fn overview(&self, window: usize) -> Result<QueryOutcome<Vec<EnvSummaryRow>>>;
}

/// Which backend a [`StoreConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

/// Backend selection plus its connection parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// File path (sqlite) or DSN (postgres).
    pub path: String,
    /// Optional host override prepended to the postgres DSN.
    pub host: String,
}

impl StoreConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: path.into(),
            host: String::new(),
        }
    }

    pub fn postgres(dsn: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Postgres,
            path: dsn.into(),
            host: String::new(),
        }
    }

    /// Read backend selection from the environment:
    /// `FLAKEWATCH_DB_BACKEND` (sqlite|postgres), `FLAKEWATCH_DB_PATH`,
    /// `FLAKEWATCH_DB_HOST`.
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("FLAKEWATCH_DB_BACKEND").unwrap_or_else(|_| "sqlite".into());
        let path = std::env::var("FLAKEWATCH_DB_PATH")
            .map_err(|_| Error::config("FLAKEWATCH_DB_PATH is not set"))?;
        let host = std::env::var("FLAKEWATCH_DB_HOST").unwrap_or_default();
        let backend = match backend.as_str() {
            "sqlite" => BackendKind::Sqlite,
            "postgres" => BackendKind::Postgres,
            other => {
                return Err(Error::config(format!("unknown db backend {other:?}")));
            }
        };
        Ok(Self {
            backend,
            path,
            host,
        })
    }
}

/// Open (but do not initialize) the configured backend.
pub async fn open(cfg: &StoreConfig) -> Result<Box<dyn Store>> {
    match cfg.backend {
        BackendKind::Sqlite => Ok(Box::new(sqlite::SqliteStore::open(&cfg.path)?)),
        BackendKind::Postgres => {
            let dsn = if cfg.host.is_empty() {
                cfg.path.clone()
            } else {
                format!("host={} {}", cfg.host, cfg.path)
            };
            Ok(Box::new(postgres::PostgresStore::connect(&dsn).await?))
        }
    }
}
