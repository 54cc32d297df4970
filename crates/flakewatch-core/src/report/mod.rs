//! Result summarizer: partitions grouped results into pass/fail/skip
//! buckets and produces the portable run summary.

pub mod summary;

use chrono::{DateTime, Utc};

use crate::model::{RunDetail, TestGroup, FAIL, PASS, SKIP};
pub use summary::Summary;

/// Build/version metadata threaded into report and analytics outputs.
/// Injected configuration, not global state.
#[derive(Debug, Clone, Default)]
pub struct ToolVersion {
    pub version: String,
    pub build: String,
}

impl ToolVersion {
    pub fn new(version: impl Into<String>, build: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build: build.into(),
        }
    }

    /// Combined form stamped onto persisted rows.
    pub fn stamp(&self) -> String {
        format!("{}_{}", self.version, self.build)
    }
}

/// The reduced view of one run: non-hidden groups partitioned by result.
#[derive(Debug, Clone)]
pub struct ReportContent {
    pub passed: Vec<TestGroup>,
    pub failed: Vec<TestGroup>,
    pub skipped: Vec<TestGroup>,
    /// Count of non-hidden tests across all buckets.
    pub total_tests: usize,
    /// Wall-clock seconds: latest end minus earliest start, not a sum of
    /// per-test durations (sub-tests run in parallel).
    pub total_duration: f64,
    pub version: ToolVersion,
    pub created_on: DateTime<Utc>,
    pub detail: RunDetail,
}

/// Partition groups into result buckets and compute run totals.
///
/// Ordinals are 1-based discovery positions; hidden groups keep their slot
/// in the numbering but are excluded from every bucket and total.
pub fn generate(detail: RunDetail, groups: &[TestGroup], version: ToolVersion) -> ReportContent {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    let mut skipped = Vec::new();

    let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (order, g) in groups.iter().enumerate() {
        if g.hidden {
            continue;
        }
        let (start, end) = bounds.get_or_insert((g.start, g.end));
        if g.start < *start {
            *start = g.start;
        }
        if g.end > *end {
            *end = g.end;
        }

        let mut g = g.clone();
        g.test_order = order + 1;
        match g.status.as_str() {
            PASS => passed.push(g),
            FAIL => failed.push(g),
            SKIP => skipped.push(g),
            _ => {}
        }
    }

    let total_duration = match bounds {
        Some((start, end)) => ((end - start).num_milliseconds() as f64 / 1000.0 * 100.0).round() / 100.0,
        None => 0.0,
    };

    ReportContent {
        total_tests: passed.len() + failed.len() + skipped.len(),
        passed,
        failed,
        skipped,
        total_duration,
        version,
        created_on: Utc::now(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn group(name: &str, status: &str, hidden: bool, start_s: i64, end_s: i64, dur: f64) -> TestGroup {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        TestGroup {
            test_name: name.into(),
            test_order: 0,
            hidden,
            status: status.into(),
            start: base + Duration::seconds(start_s),
            end: base + Duration::seconds(end_s),
            duration: dur,
            events: Vec::new(),
        }
    }

    #[test]
    fn partitions_and_orders_non_hidden_groups() {
        let groups = vec![
            group("TestA", PASS, false, 0, 10, 10.0),
            group("TestB", FAIL, true, 0, 20, 20.0),
            group("TestB/sub", FAIL, false, 5, 20, 15.0),
            group("TestC", SKIP, false, 1, 1, 0.0),
        ];
        let content = generate(RunDetail::default(), &groups, ToolVersion::default());
        assert_eq!(content.total_tests, 3);
        assert_eq!(content.passed[0].test_order, 1);
        assert_eq!(content.failed[0].test_name, "TestB/sub");
        assert_eq!(content.failed[0].test_order, 3);
        assert_eq!(content.skipped[0].test_order, 4);
    }

    #[test]
    fn total_duration_is_wall_clock_not_sum() {
        // Two overlapping tests: 0..30 and 10..20. Wall clock is 30s even
        // though durations sum to 40s.
        let groups = vec![
            group("TestA", PASS, false, 0, 30, 30.0),
            group("TestB", PASS, false, 10, 20, 10.0),
        ];
        let content = generate(RunDetail::default(), &groups, ToolVersion::default());
        assert_eq!(content.total_duration, 30.0);
    }

    #[test]
    fn hidden_groups_do_not_stretch_the_run() {
        let groups = vec![
            group("TestX", PASS, true, 0, 100, 100.0),
            group("TestX/sub", PASS, false, 10, 40, 30.0),
        ];
        let content = generate(RunDetail::default(), &groups, ToolVersion::default());
        assert_eq!(content.total_duration, 30.0);
    }

    #[test]
    fn empty_run_has_zero_duration() {
        let content = generate(RunDetail::default(), &[], ToolVersion::default());
        assert_eq!(content.total_tests, 0);
        assert_eq!(content.total_duration, 0.0);
    }
}
