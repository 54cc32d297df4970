//! Embedded single-writer backend, suited to local/offline report
//! generation. Analytics reads are not implemented here; callers get
//! [`QueryOutcome::Unsupported`] rather than an error.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use super::{schema, EnvChart, QueryOutcome, RecentRows, Store, TestChart};
use crate::error::{Error, Result};
use crate::model::{EnvSummaryRow, EnvironmentRun, TestCaseRow};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::store(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.display().to_string(),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: ":memory:".into(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::store("sqlite connection mutex poisoned"))
    }
}

fn parse_time(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::store(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        let mut conn = self.lock()?;
        schema::migrate(&mut conn)?;
        debug!(path = %self.path, "sqlite store initialized");
        Ok(())
    }

    async fn set(&self, run: &EnvironmentRun, rows: &[TestCaseRow]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO test_cases
                     (pr, commit_id, env_name, env_group, test_name, result,
                      test_time, duration, test_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.pr,
                    r.commit_id,
                    r.env_name,
                    r.env_group,
                    r.test_name,
                    r.result,
                    r.test_time.to_rfc3339(),
                    r.duration,
                    r.test_order,
                ])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO environment_runs
                 (commit_id, env_name, env_group, ingest_time, test_time,
                  number_of_fail, number_of_pass, number_of_skip,
                  total_duration, tool_version, artifact_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.commit_id,
                run.env_name,
                run.env_group,
                run.ingest_time.to_rfc3339(),
                run.test_time.to_rfc3339(),
                run.number_of_fail,
                run.number_of_pass,
                run.number_of_skip,
                run.total_duration,
                run.tool_version,
                run.artifact_path,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<QueryOutcome<RecentRows>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT commit_id, env_name, env_group, ingest_time, test_time,
                    number_of_fail, number_of_pass, number_of_skip,
                    total_duration, tool_version, artifact_path
             FROM environment_runs ORDER BY test_time DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let runs = runs
            .into_iter()
            .map(|r| {
                Ok(EnvironmentRun {
                    commit_id: r.0,
                    env_name: r.1,
                    env_group: r.2,
                    ingest_time: parse_time(r.3)?,
                    test_time: parse_time(r.4)?,
                    number_of_fail: r.5,
                    number_of_pass: r.6,
                    number_of_skip: r.7,
                    total_duration: r.8,
                    tool_version: r.9,
                    artifact_path: r.10,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT pr, commit_id, env_name, env_group, test_name, result,
                    test_time, duration, test_order
             FROM test_cases ORDER BY test_time DESC LIMIT ?1",
        )?;
        let cases = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let test_cases = cases
            .into_iter()
            .map(|r| {
                Ok(TestCaseRow {
                    pr: r.0,
                    commit_id: r.1,
                    env_name: r.2,
                    env_group: r.3,
                    test_name: r.4,
                    result: r.5,
                    test_time: parse_time(r.6)?,
                    duration: r.7,
                    test_order: r.8,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if runs.is_empty() && test_cases.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        Ok(QueryOutcome::Rows(RecentRows { runs, test_cases }))
    }

    async fn test_chart(
        &self,
        _env: &str,
        _group: Option<&str>,
        _test: &str,
    ) -> Result<QueryOutcome<TestChart>> {
        Ok(QueryOutcome::Unsupported)
    }

    async fn env_chart(
        &self,
        _env: &str,
        _group: Option<&str>,
        _top_n: usize,
    ) -> Result<QueryOutcome<EnvChart>> {
        Ok(QueryOutcome::Unsupported)
    }

    async fn overview(&self, _window: usize) -> Result<QueryOutcome<Vec<EnvSummaryRow>>> {
        Ok(QueryOutcome::Unsupported)
    }
}
