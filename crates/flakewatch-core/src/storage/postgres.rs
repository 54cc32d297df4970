//! Client/server backend: the shared historical store across CI runs and
//! the reference backend for the flake analytics reads.
//!
//! Flake queries are served from a per-(environment, group) materialized
//! view covering the trailing 90 days. The view is created on first access;
//! refreshing it is external scheduling's job, this store only guarantees
//! it exists.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::{EnvChart, QueryOutcome, RecentRows, Store, TestChart};
use crate::analytics::{self, Bucket, OVERVIEW_WINDOW_DAYS};
use crate::error::{Error, Result};
use crate::model::{EnvSummaryRow, EnvironmentRun, TestCaseRow, LEGACY_ENV_GROUP};

const CREATE_ENVIRONMENT_RUNS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS environment_runs (
        commit_id TEXT,
        env_name TEXT,
        env_group TEXT NOT NULL DEFAULT 'Legacy',
        ingest_time TIMESTAMPTZ,
        test_time TIMESTAMPTZ,
        number_of_fail BIGINT,
        number_of_pass BIGINT,
        number_of_skip BIGINT,
        total_duration DOUBLE PRECISION,
        tool_version TEXT NOT NULL DEFAULT '',
        artifact_path TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (commit_id, env_name, env_group)
    );
";

const CREATE_TEST_CASES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS test_cases (
        pr TEXT,
        commit_id TEXT,
        env_name TEXT,
        env_group TEXT NOT NULL DEFAULT 'Legacy',
        test_name TEXT,
        result TEXT,
        test_time TIMESTAMPTZ,
        duration DOUBLE PRECISION,
        test_order BIGINT,
        PRIMARY KEY (commit_id, env_name, env_group, test_name)
    );
";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the server. The DSN is any libpq-style connection string.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(dsn)
            .await
            .map_err(|e| Error::store(format!("postgres connect: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All (env_name, env_group) combinations present in the store.
    async fn env_group_pairs(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT DISTINCT env_name, env_group FROM environment_runs")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("env_name")?, r.try_get("env_group")?)))
            .collect()
    }

    /// Create the 90-day materialized view for (env, group) if absent and
    /// return its name.
    async fn ensure_flake_view(&self, env: &str, group: &str) -> Result<String> {
        let name = flake_view_name(env, group);
        let sql = format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {name} AS
                 SELECT pr, commit_id, env_name, env_group, test_name, result,
                        test_time, duration, test_order
                 FROM test_cases
                 WHERE env_name = '{}' AND env_group = '{}'
                   AND test_time >= now() - interval '{OVERVIEW_WINDOW_DAYS} days'",
            sql_literal(env),
            sql_literal(group),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(view = %name, "flake view ensured");
        Ok(name)
    }

    async fn view_rows(&self, view: &str, test: Option<&str>) -> Result<Vec<TestCaseRow>> {
        let base = format!(
            "SELECT pr, commit_id, env_name, env_group, test_name, result,
                    test_time, duration, test_order
             FROM {view}"
        );
        let rows = match test {
            Some(test) => {
                sqlx::query(&format!("{base} WHERE test_name = $1"))
                    .bind(test)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query(&base).fetch_all(&self.pool).await?,
        };
        rows.iter().map(test_case_from_row).collect()
    }

    /// commit -> artifact path for one (env, group), for chart drill-down.
    async fn artifact_map(&self, env: &str, group: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT commit_id, artifact_path FROM environment_runs
             WHERE env_name = $1 AND env_group = $2 AND artifact_path != ''",
        )
        .bind(env)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("commit_id")?, r.try_get("artifact_path")?)))
            .collect()
    }

    async fn resolve_group(&self, env: &str, group: Option<&str>) -> Result<String> {
        let pairs = self.env_group_pairs().await?;
        analytics::resolve_env_group(&pairs, env, group)
    }

    /// Staged, transactional schema migration backing `initialize`.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::migration(format!("begin migration: {e}")))?;

        let step = |step: &'static str| move |e: sqlx::Error| {
            Error::migration(format!("{step}: {e}"))
        };

        // Tables at the current schema for a fresh store.
        sqlx::query(CREATE_ENVIRONMENT_RUNS_SQL)
            .execute(&mut *tx)
            .await
            .map_err(step("create environment_runs"))?;
        sqlx::query(CREATE_TEST_CASES_SQL)
            .execute(&mut *tx)
            .await
            .map_err(step("create test_cases"))?;

        // Add-if-missing columns; "already exists" is success.
        for sql in [
            "ALTER TABLE environment_runs ADD COLUMN IF NOT EXISTS env_group TEXT NOT NULL DEFAULT 'Legacy'",
            "ALTER TABLE environment_runs ADD COLUMN IF NOT EXISTS tool_version TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE environment_runs ADD COLUMN IF NOT EXISTS artifact_path TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE test_cases ADD COLUMN IF NOT EXISTS env_group TEXT NOT NULL DEFAULT 'Legacy'",
        ] {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(step("add columns"))?;
        }

        // Backfill defaults.
        for sql in [
            "UPDATE environment_runs SET env_group = 'Legacy' WHERE env_group IS NULL OR env_group = ''",
            "UPDATE environment_runs SET artifact_path = '' WHERE artifact_path IS NULL",
            "UPDATE environment_runs SET tool_version = '' WHERE tool_version IS NULL",
            "UPDATE test_cases SET env_group = 'Legacy' WHERE env_group IS NULL OR env_group = ''",
        ] {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(step("backfill defaults"))?;
        }

        // Group inference for rows predating the group dimension.
        sqlx::query(
            "UPDATE test_cases SET env_group = (
                 SELECT MIN(e.env_group) FROM environment_runs e
                 WHERE e.commit_id = test_cases.commit_id
                   AND e.env_name = test_cases.env_name
                   AND e.env_group != $1)
             WHERE env_group = $1
               AND (SELECT COUNT(DISTINCT e.env_group) FROM environment_runs e
                    WHERE e.commit_id = test_cases.commit_id
                      AND e.env_name = test_cases.env_name
                      AND e.env_group != $1) = 1",
        )
        .bind(LEGACY_ENV_GROUP)
        .execute(&mut *tx)
        .await
        .map_err(step("infer env groups"))?;

        // Dedup ahead of key widening.
        for table in ["environment_runs", "test_cases"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE env_group = $1 AND EXISTS (
                     SELECT 1 FROM {table} o
                     WHERE o.commit_id = {table}.commit_id
                       AND o.env_name = {table}.env_name
                       AND o.env_group != $1)"
            ))
            .bind(LEGACY_ENV_GROUP)
            .execute(&mut *tx)
            .await
            .map_err(step("dedup shadowed sentinel rows"))?;
        }
        sqlx::query(
            "DELETE FROM environment_runs a USING environment_runs b
             WHERE a.ctid < b.ctid AND a.commit_id = b.commit_id
               AND a.env_name = b.env_name AND a.env_group = b.env_group",
        )
        .execute(&mut *tx)
        .await
        .map_err(step("dedup colliding environment_runs"))?;
        sqlx::query(
            "DELETE FROM test_cases a USING test_cases b
             WHERE a.ctid < b.ctid AND a.commit_id = b.commit_id
               AND a.env_name = b.env_name AND a.env_group = b.env_group
               AND a.test_name = b.test_name",
        )
        .execute(&mut *tx)
        .await
        .map_err(step("dedup colliding test_cases"))?;

        // Widen the primary keys to include env_group. Constraint
        // replacement happens inside this transaction, so a crash leaves
        // the old key shape intact.
        if !pk_has_env_group(&mut tx, "environment_runs").await? {
            sqlx::query("ALTER TABLE environment_runs DROP CONSTRAINT IF EXISTS environment_runs_pkey")
                .execute(&mut *tx)
                .await
                .map_err(step("drop environment_runs key"))?;
            sqlx::query(
                "ALTER TABLE environment_runs ADD PRIMARY KEY (commit_id, env_name, env_group)",
            )
            .execute(&mut *tx)
            .await
            .map_err(step("widen environment_runs key"))?;
        }
        if !pk_has_env_group(&mut tx, "test_cases").await? {
            sqlx::query("ALTER TABLE test_cases DROP CONSTRAINT IF EXISTS test_cases_pkey")
                .execute(&mut *tx)
                .await
                .map_err(step("drop test_cases key"))?;
            sqlx::query(
                "ALTER TABLE test_cases ADD PRIMARY KEY (commit_id, env_name, env_group, test_name)",
            )
            .execute(&mut *tx)
            .await
            .map_err(step("widen test_cases key"))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::migration(format!("commit migration: {e}")))?;
        info!("postgres schema migrated");
        Ok(())
    }
}

async fn pk_has_env_group(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        "SELECT a.attname AS col
         FROM pg_index i
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
         WHERE i.indrelid = $1::regclass AND i.indisprimary",
    )
    .bind(table)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| Error::migration(format!("inspect {table} key: {e}")))?;
    Ok(rows
        .iter()
        .any(|r| r.try_get::<String, _>("col").is_ok_and(|c| c == "env_group")))
}

fn test_case_from_row(row: &sqlx::postgres::PgRow) -> Result<TestCaseRow> {
    Ok(TestCaseRow {
        pr: row.try_get("pr")?,
        commit_id: row.try_get("commit_id")?,
        env_name: row.try_get("env_name")?,
        env_group: row.try_get("env_group")?,
        test_name: row.try_get("test_name")?,
        result: row.try_get("result")?,
        test_time: row.try_get::<DateTime<Utc>, _>("test_time")?,
        duration: row.try_get("duration")?,
        test_order: row.try_get("test_order")?,
    })
}

fn environment_run_from_row(row: &sqlx::postgres::PgRow) -> Result<EnvironmentRun> {
    Ok(EnvironmentRun {
        commit_id: row.try_get("commit_id")?,
        env_name: row.try_get("env_name")?,
        env_group: row.try_get("env_group")?,
        ingest_time: row.try_get::<DateTime<Utc>, _>("ingest_time")?,
        test_time: row.try_get::<DateTime<Utc>, _>("test_time")?,
        number_of_fail: row.try_get("number_of_fail")?,
        number_of_pass: row.try_get("number_of_pass")?,
        number_of_skip: row.try_get("number_of_skip")?,
        total_duration: row.try_get("total_duration")?,
        tool_version: row.try_get("tool_version")?,
        artifact_path: row.try_get("artifact_path")?,
    })
}

/// Deterministic identifier for the per-(env, group) materialized view.
/// A readable slug plus a stable hash so distinct pairs never collide
/// after sanitization.
fn flake_view_name(env: &str, group: &str) -> String {
    let slug: String = format!("{env}_{group}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    format!("mv_test_cases_90d_{slug}_{:08x}", fnv1a(env, group))
}

fn fnv1a(env: &str, group: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in env.bytes().chain([0u8]).chain(group.bytes()) {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[async_trait]
impl Store for PostgresStore {
    async fn initialize(&self) -> Result<()> {
        self.migrate().await
    }

    async fn set(&self, run: &EnvironmentRun, rows: &[TestCaseRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in rows {
            sqlx::query(
                "INSERT INTO test_cases
                     (pr, commit_id, env_name, env_group, test_name, result,
                      test_time, duration, test_order)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (commit_id, env_name, env_group, test_name)
                 DO UPDATE SET (pr, result, test_time, duration, test_order) =
                     (EXCLUDED.pr, EXCLUDED.result, EXCLUDED.test_time,
                      EXCLUDED.duration, EXCLUDED.test_order)",
            )
            .bind(&r.pr)
            .bind(&r.commit_id)
            .bind(&r.env_name)
            .bind(&r.env_group)
            .bind(&r.test_name)
            .bind(&r.result)
            .bind(r.test_time)
            .bind(r.duration)
            .bind(r.test_order)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO environment_runs
                 (commit_id, env_name, env_group, ingest_time, test_time,
                  number_of_fail, number_of_pass, number_of_skip,
                  total_duration, tool_version, artifact_path)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (commit_id, env_name, env_group)
             DO UPDATE SET (ingest_time, test_time, number_of_fail,
                            number_of_pass, number_of_skip, total_duration,
                            tool_version, artifact_path) =
                 (EXCLUDED.ingest_time, EXCLUDED.test_time,
                  EXCLUDED.number_of_fail, EXCLUDED.number_of_pass,
                  EXCLUDED.number_of_skip, EXCLUDED.total_duration,
                  EXCLUDED.tool_version, EXCLUDED.artifact_path)",
        )
        .bind(&run.commit_id)
        .bind(&run.env_name)
        .bind(&run.env_group)
        .bind(run.ingest_time)
        .bind(run.test_time)
        .bind(run.number_of_fail)
        .bind(run.number_of_pass)
        .bind(run.number_of_skip)
        .bind(run.total_duration)
        .bind(&run.tool_version)
        .bind(&run.artifact_path)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<QueryOutcome<RecentRows>> {
        let runs = sqlx::query(
            "SELECT commit_id, env_name, env_group, ingest_time, test_time,
                    number_of_fail, number_of_pass, number_of_skip,
                    total_duration, tool_version, artifact_path
             FROM environment_runs ORDER BY test_time DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(environment_run_from_row)
        .collect::<Result<Vec<_>>>()?;

        let test_cases = sqlx::query(
            "SELECT pr, commit_id, env_name, env_group, test_name, result,
                    test_time, duration, test_order
             FROM test_cases ORDER BY test_time DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(test_case_from_row)
        .collect::<Result<Vec<_>>>()?;

        if runs.is_empty() && test_cases.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        Ok(QueryOutcome::Rows(RecentRows { runs, test_cases }))
    }

    async fn test_chart(
        &self,
        env: &str,
        group: Option<&str>,
        test: &str,
    ) -> Result<QueryOutcome<TestChart>> {
        let group = self.resolve_group(env, group).await?;
        let view = self.ensure_flake_view(env, &group).await?;
        let rows = self.view_rows(&view, Some(test)).await?;
        if rows.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        let artifacts = self.artifact_map(env, &group).await?;
        Ok(QueryOutcome::Rows(TestChart {
            env_name: env.to_string(),
            env_group: group,
            test_name: test.to_string(),
            flake_by_day: analytics::flake_buckets(&rows, &artifacts, Bucket::Day),
            flake_by_week: analytics::flake_buckets(&rows, &artifacts, Bucket::Week),
            flake_by_month: analytics::flake_buckets(&rows, &artifacts, Bucket::Month),
            duration_by_day: analytics::duration_buckets(&rows, Bucket::Day),
        }))
    }

    async fn env_chart(
        &self,
        env: &str,
        group: Option<&str>,
        top_n: usize,
    ) -> Result<QueryOutcome<EnvChart>> {
        let group = self.resolve_group(env, group).await?;
        let view = self.ensure_flake_view(env, &group).await?;
        let rows = self.view_rows(&view, None).await?;
        if rows.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        let artifacts = self.artifact_map(env, &group).await?;
        let flake_rates = analytics::flake_rates(&rows, analytics::DEFAULT_WINDOW);

        let mut chart = EnvChart {
            env_name: env.to_string(),
            env_group: group,
            top_flake_by_day: Default::default(),
            top_flake_by_week: Default::default(),
            flake_rates,
        };
        for rate in chart.flake_rates.iter().take(top_n) {
            let test_rows: Vec<TestCaseRow> = rows
                .iter()
                .filter(|r| r.test_name == rate.test_name)
                .cloned()
                .collect();
            chart.top_flake_by_day.insert(
                rate.test_name.clone(),
                analytics::flake_buckets(&test_rows, &artifacts, Bucket::Day),
            );
            chart.top_flake_by_week.insert(
                rate.test_name.clone(),
                analytics::flake_buckets(&test_rows, &artifacts, Bucket::Week),
            );
        }
        Ok(QueryOutcome::Rows(chart))
    }

    async fn overview(&self, window: usize) -> Result<QueryOutcome<Vec<EnvSummaryRow>>> {
        let runs = sqlx::query(
            "SELECT commit_id, env_name, env_group, ingest_time, test_time,
                    number_of_fail, number_of_pass, number_of_skip,
                    total_duration, tool_version, artifact_path
             FROM environment_runs
             WHERE test_time >= now() - make_interval(days => $1)",
        )
        .bind(OVERVIEW_WINDOW_DAYS as i32)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(environment_run_from_row)
        .collect::<Result<Vec<_>>>()?;
        if runs.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        Ok(QueryOutcome::Rows(analytics::env_overview(&runs, window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_names_are_stable_and_distinct() {
        let a = flake_view_name("KVM Linux", "VM drivers");
        let b = flake_view_name("KVM Linux", "VM drivers");
        let c = flake_view_name("KVM_Linux", "VM drivers");
        assert_eq!(a, b);
        assert_ne!(a, c, "sanitized collisions must differ by hash");
        assert!(a.starts_with("mv_test_cases_90d_kvm_linux_vm_drivers_"));
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(sql_literal("o'brien"), "o''brien");
    }
}
