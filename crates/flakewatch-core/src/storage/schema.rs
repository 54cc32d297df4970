//! Schema creation and staged migration for the embedded backend.
//!
//! `migrate` runs on every `initialize()` and must be safe against a store
//! at any historical schema version: every stage is idempotent, and the
//! whole sequence runs inside one transaction so a crash leaves either the
//! fully-old or fully-new layout.

use std::collections::HashSet;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::model::LEGACY_ENV_GROUP;

pub(crate) const CREATE_ENVIRONMENT_RUNS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS environment_runs (
        commit_id TEXT,
        env_name TEXT,
        env_group TEXT NOT NULL DEFAULT 'Legacy',
        ingest_time TEXT,
        test_time TEXT,
        number_of_fail INTEGER,
        number_of_pass INTEGER,
        number_of_skip INTEGER,
        total_duration REAL,
        tool_version TEXT NOT NULL DEFAULT '',
        artifact_path TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (commit_id, env_name, env_group)
    );
";

pub(crate) const CREATE_TEST_CASES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS test_cases (
        pr TEXT,
        commit_id TEXT,
        env_name TEXT,
        env_group TEXT NOT NULL DEFAULT 'Legacy',
        test_name TEXT,
        result TEXT,
        test_time TEXT,
        duration REAL,
        test_order INTEGER,
        PRIMARY KEY (commit_id, env_name, env_group, test_name)
    );
";

const ENVIRONMENT_RUN_COLUMNS: &str = "commit_id, env_name, env_group, ingest_time, test_time, \
     number_of_fail, number_of_pass, number_of_skip, total_duration, tool_version, artifact_path";

const TEST_CASE_COLUMNS: &str =
    "pr, commit_id, env_name, env_group, test_name, result, test_time, duration, test_order";

fn mig(step: &str, err: impl std::fmt::Display) -> Error {
    Error::migration(format!("{step}: {err}"))
}

pub(crate) fn get_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| mig("prepare pragma table_info", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| mig("query table_info", e))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r.map_err(|e| mig("read table_info", e))?);
    }
    Ok(out)
}

/// Names of the primary-key columns, in key order.
pub(crate) fn pk_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| mig("prepare pragma table_info", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
        })
        .map_err(|e| mig("query table_info", e))?;
    let mut keyed: Vec<(String, i64)> = Vec::new();
    for r in rows {
        let (name, pk) = r.map_err(|e| mig("read table_info", e))?;
        if pk > 0 {
            keyed.push((name, pk));
        }
    }
    keyed.sort_by_key(|(_, pk)| *pk);
    Ok(keyed.into_iter().map(|(name, _)| name).collect())
}

/// Add a column with a default; a column that already exists is success.
pub(crate) fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let cols = get_columns(conn, table)?;
    if cols.contains(column) {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
        [],
    )
    .map_err(|e| mig(&format!("add column {table}.{column}"), e))?;
    Ok(())
}

/// Bring a live store's physical layout to the current logical schema.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| mig("begin migration transaction", e))?;

    // Stage 1: tables at the current schema for a fresh store.
    tx.execute_batch(CREATE_ENVIRONMENT_RUNS_SQL)
        .map_err(|e| mig("create environment_runs", e))?;
    tx.execute_batch(CREATE_TEST_CASES_SQL)
        .map_err(|e| mig("create test_cases", e))?;

    // Stage 2: add-if-missing columns for stores at older versions.
    add_column_if_missing(
        &tx,
        "environment_runs",
        "env_group",
        "TEXT NOT NULL DEFAULT 'Legacy'",
    )?;
    add_column_if_missing(
        &tx,
        "environment_runs",
        "tool_version",
        "TEXT NOT NULL DEFAULT ''",
    )?;
    add_column_if_missing(
        &tx,
        "environment_runs",
        "artifact_path",
        "TEXT NOT NULL DEFAULT ''",
    )?;
    add_column_if_missing(
        &tx,
        "test_cases",
        "env_group",
        "TEXT NOT NULL DEFAULT 'Legacy'",
    )?;

    // Stage 3: backfill defaults onto rows predating those columns.
    for sql in [
        "UPDATE environment_runs SET env_group = 'Legacy' WHERE env_group IS NULL OR env_group = ''",
        "UPDATE environment_runs SET artifact_path = '' WHERE artifact_path IS NULL",
        "UPDATE environment_runs SET tool_version = '' WHERE tool_version IS NULL",
        "UPDATE test_cases SET env_group = 'Legacy' WHERE env_group IS NULL OR env_group = ''",
    ] {
        tx.execute(sql, []).map_err(|e| mig("backfill defaults", e))?;
    }

    // Stage 4: best-effort group inference. A (commit, environment) pair
    // that maps to exactly one resolved group elsewhere propagates it onto
    // its ungrouped test rows; ambiguous pairs keep the sentinel.
    tx.execute(
        "UPDATE test_cases SET env_group = (
             SELECT MIN(e.env_group) FROM environment_runs e
             WHERE e.commit_id = test_cases.commit_id
               AND e.env_name = test_cases.env_name
               AND e.env_group != ?1)
         WHERE env_group = ?1
           AND (SELECT COUNT(DISTINCT e.env_group) FROM environment_runs e
                WHERE e.commit_id = test_cases.commit_id
                  AND e.env_name = test_cases.env_name
                  AND e.env_group != ?1) = 1",
        [LEGACY_ENV_GROUP],
    )
    .map_err(|e| mig("infer env groups", e))?;

    // Stage 5: dedup ahead of key widening. A sentinel row shadowed by a
    // resolved row for the same old-shape key is dropped, then exact
    // duplicates under the new key collapse to the newest row.
    dedup(&tx, "environment_runs", "commit_id, env_name, env_group")?;
    dedup(
        &tx,
        "test_cases",
        "commit_id, env_name, env_group, test_name",
    )?;

    // Stage 6: widen the primary key to include env_group. SQLite cannot
    // alter constraints in place, so rebuild within this transaction.
    if !pk_columns(&tx, "environment_runs")?
        .iter()
        .any(|c| c == "env_group")
    {
        rebuild(
            &tx,
            "environment_runs",
            CREATE_ENVIRONMENT_RUNS_SQL,
            ENVIRONMENT_RUN_COLUMNS,
        )?;
    }
    if !pk_columns(&tx, "test_cases")?.iter().any(|c| c == "env_group") {
        rebuild(&tx, "test_cases", CREATE_TEST_CASES_SQL, TEST_CASE_COLUMNS)?;
    }

    tx.commit()
        .map_err(|e| mig("commit migration transaction", e))
}

fn dedup(conn: &Connection, table: &str, new_key: &str) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM {table} WHERE env_group = ?1 AND EXISTS (
                 SELECT 1 FROM {table} o
                 WHERE o.commit_id = {table}.commit_id
                   AND o.env_name = {table}.env_name
                   AND o.env_group != ?1)"
        ),
        [LEGACY_ENV_GROUP],
    )
    .map_err(|e| mig(&format!("dedup shadowed sentinel rows in {table}"), e))?;
    conn.execute(
        &format!(
            "DELETE FROM {table} WHERE rowid NOT IN (
                 SELECT MAX(rowid) FROM {table} GROUP BY {new_key})"
        ),
        [],
    )
    .map_err(|e| mig(&format!("dedup colliding rows in {table}"), e))?;
    Ok(())
}

/// Rebuild `table` at the current schema: create-new, copy, drop-old,
/// rename. Runs inside the caller's transaction so a crash mid-way leaves
/// the old table intact.
fn rebuild(conn: &Connection, table: &str, create_sql: &str, columns: &str) -> Result<()> {
    let tmp = format!("{table}_migration_new");
    let create_tmp = create_sql.replace(
        &format!("CREATE TABLE IF NOT EXISTS {table} "),
        &format!("CREATE TABLE {tmp} "),
    );
    conn.execute_batch(&create_tmp)
        .map_err(|e| mig(&format!("create rebuilt {table}"), e))?;
    conn.execute(
        &format!("INSERT INTO {tmp} ({columns}) SELECT {columns} FROM {table}"),
        [],
    )
    .map_err(|e| mig(&format!("copy rows into rebuilt {table}"), e))?;
    conn.execute(&format!("DROP TABLE {table}"), [])
        .map_err(|e| mig(&format!("drop old {table}"), e))?;
    conn.execute(&format!("ALTER TABLE {tmp} RENAME TO {table}"), [])
        .map_err(|e| mig(&format!("rename rebuilt {table}"), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_column_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT)").unwrap();
        add_column_if_missing(&conn, "t", "b", "TEXT NOT NULL DEFAULT 'x'").unwrap();
        add_column_if_missing(&conn, "t", "b", "TEXT NOT NULL DEFAULT 'x'").unwrap();
        let cols = get_columns(&conn, "t").unwrap();
        assert!(cols.contains("a") && cols.contains("b"));
    }

    #[test]
    fn pk_columns_reports_key_order() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT, b TEXT, c TEXT, PRIMARY KEY (b, a))")
            .unwrap();
        assert_eq!(pk_columns(&conn, "t").unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn migrate_twice_changes_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let before = pk_columns(&conn, "environment_runs").unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(pk_columns(&conn, "environment_runs").unwrap(), before);
        assert_eq!(
            pk_columns(&conn, "test_cases").unwrap(),
            vec!["commit_id", "env_name", "env_group", "test_name"]
        );
    }
}
