//! Data model: raw test events, grouped results, persisted rows and the
//! derived analytics rows computed from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result value of a passed test.
pub const PASS: &str = "pass";
/// Result value of a failed test.
pub const FAIL: &str = "fail";
/// Result value of a skipped test.
pub const SKIP: &str = "skip";

/// Sentinel environment group for rows predating the group dimension.
pub const LEGACY_ENV_GROUP: &str = "Legacy";

/// The three terminal result buckets, in report order.
pub const RESULT_TYPES: [&str; 3] = [PASS, FAIL, SKIP];

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// One line of the producer's JSON event stream.
///
/// Field names match the test runner's output, so the struct deserializes
/// the stream directly. Absent fields default rather than fail; the parser
/// is forgiving by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    /// Event timestamp, RFC3339 in the stream.
    #[serde(rename = "Time", default = "epoch")]
    pub time: DateTime<Utc>,
    /// Lifecycle action: run, pass, fail, skip, output, ...
    #[serde(rename = "Action", default)]
    pub action: String,
    /// Owning package of the test.
    #[serde(rename = "Package", default)]
    pub package: String,
    /// Test name; empty for package-level events. Hierarchical names join
    /// segments with "/".
    #[serde(rename = "Test", default)]
    pub test: String,
    /// Cumulative elapsed seconds reported at each status transition.
    #[serde(rename = "Elapsed", default)]
    pub elapsed: f64,
    /// Free-form output text attached to the event.
    #[serde(rename = "Output", default)]
    pub output: String,
}

/// All events observed for one distinct test name.
#[derive(Debug, Clone, Serialize)]
pub struct TestGroup {
    pub test_name: String,
    /// 1-based discovery ordinal, assigned to non-hidden groups only.
    pub test_order: usize,
    /// Hidden groups are synthetic ancestors whose results are already
    /// reported by their subtests.
    pub hidden: bool,
    /// Last observed action for this name.
    pub status: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Elapsed seconds carried by the last event, not a sum.
    pub duration: f64,
    pub events: Vec<TestEvent>,
}

/// Identity metadata attached to one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDetail {
    /// Environment name, e.g. "KVM Linux".
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Commit identifier (plus any job tokens appended during ingestion).
    #[serde(rename = "Details", default)]
    pub details: String,
    /// Pull request number, if any.
    #[serde(rename = "PR", default)]
    pub pr: String,
    /// Source repository, e.g. a github repo.
    #[serde(rename = "RepoName", default)]
    pub repo_name: String,
}

/// One finished run in one environment. Keyed by
/// (commit_id, env_name, env_group); upserted as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRun {
    pub commit_id: String,
    pub env_name: String,
    pub env_group: String,
    /// When this row was ingested.
    pub ingest_time: DateTime<Utc>,
    /// When the tests actually ran.
    pub test_time: DateTime<Utc>,
    pub number_of_fail: i64,
    pub number_of_pass: i64,
    pub number_of_skip: i64,
    pub total_duration: f64,
    pub tool_version: String,
    /// Storage path of the run's artifacts, empty when unknown.
    pub artifact_path: String,
}

/// One test result within one run. Keyed by
/// (commit_id, env_name, env_group, test_name); superseded on re-ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseRow {
    pub pr: String,
    pub commit_id: String,
    pub env_name: String,
    pub env_group: String,
    pub test_name: String,
    pub result: String,
    pub test_time: DateTime<Utc>,
    pub duration: f64,
    pub test_order: i64,
}

/// Per-test flake standing within one (environment, group). Derived, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakeRow {
    pub test_name: String,
    pub recent_flake_percentage: f64,
    pub growth_rate: f64,
}

/// One time bucket of a per-test flake series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakeBucketRow {
    /// Bucket label, ISO date of the bucket start.
    pub period: String,
    pub flake_percentage: f64,
    /// Commits contributing results to this bucket, for drill-down.
    pub commits: Vec<String>,
    /// Artifact locations of those runs, where known.
    pub artifact_paths: Vec<String>,
}

/// One time bucket of a duration series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationBucketRow {
    pub period: String,
    pub duration: f64,
    pub commits: Vec<String>,
}

/// Per-environment standing over the overview window. Derived, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvSummaryRow {
    pub env_name: String,
    pub env_group: String,
    /// Average failures per observed day.
    pub avg_fail_per_day: f64,
    /// Average run duration per observed day, seconds.
    pub avg_duration: f64,
    /// Recent-window minus prior-window average failures.
    pub fail_growth: f64,
    /// Recent-window minus prior-window average duration.
    pub duration_growth: f64,
}

impl TestCaseRow {
    /// Observation date used for windowing, truncated to the day.
    pub fn test_date(&self) -> chrono::NaiveDate {
        self.test_time.date_naive()
    }
}
