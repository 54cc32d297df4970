//! Flake-rate analytics: time-windowed flake percentages, growth rates,
//! bucketed series and the cross-environment overview.
//!
//! All functions here are pure windowing math over row history already
//! scoped to one (environment, group); the reference backend fetches the
//! windowed rows (from its materialized 90-day view) and delegates the
//! aggregation to this module.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Duration, NaiveDate};

use crate::error::{Error, Result};
use crate::model::{EnvironmentRun, EnvSummaryRow, FAIL, FlakeBucketRow, FlakeRow, SKIP};
use crate::model::{DurationBucketRow, TestCaseRow};

/// Default flake window length in distinct observed dates (W).
pub const DEFAULT_WINDOW: usize = 15;

/// Length of the overview / materialized-view window, in days.
pub const OVERVIEW_WINDOW_DAYS: i64 = 90;

/// Time buckets for chart series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Day,
    Week,
    Month,
}

impl Bucket {
    /// Stable label for the bucket containing `date`: the day itself, the
    /// Monday of its ISO week, or "YYYY-MM".
    fn label(self, date: NaiveDate) -> String {
        match self {
            Bucket::Day => date.to_string(),
            Bucket::Week => {
                let monday =
                    date - Duration::days(date.weekday().num_days_from_monday() as i64);
                monday.to_string()
            }
            Bucket::Month => format!("{:04}-{:02}", date.year(), date.month()),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Distinct observed dates, newest first, capped at `2 * window`.
fn window_dates(dates: impl IntoIterator<Item = NaiveDate>, window: usize) -> Vec<NaiveDate> {
    let set: BTreeSet<NaiveDate> = dates.into_iter().collect();
    set.into_iter().rev().take(2 * window).collect()
}

/// The boundary dates of the two comparison windows: the W-th and 2W-th
/// most recent observed dates. Absent when history is shorter; an absent
/// boundary leaves its window unbounded at the old end.
fn cutoffs(dates: &[NaiveDate], window: usize) -> (Option<NaiveDate>, Option<NaiveDate>) {
    (
        dates.get(window - 1).copied(),
        dates.get(2 * window - 1).copied(),
    )
}

fn after(date: NaiveDate, cutoff: Option<NaiveDate>) -> bool {
    cutoff.is_none_or(|c| date >= c)
}

/// fail / total as a percentage, 0 when the denominator is zero.
fn percentage(fails: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(100.0 * fails as f64 / total as f64)
    }
}

/// Compute per-test recent flake percentage and growth rate.
///
/// Skips carry no flake signal and are excluded before anything else. The
/// recent percentage is restricted to dates at or after the W-th most
/// recent observed date; growth is that window's percentage minus the
/// preceding equal-length window's. Flakiest tests sort first, name order
/// breaking ties. A zero window is treated as one observed date.
pub fn flake_rates(rows: &[TestCaseRow], window: usize) -> Vec<FlakeRow> {
    let window = window.max(1);
    let rows: Vec<&TestCaseRow> = rows.iter().filter(|r| r.result != SKIP).collect();
    let dates = window_dates(rows.iter().map(|r| r.test_date()), window);
    let (recent_cutoff, prev_cutoff) = cutoffs(&dates, window);

    let mut by_test: BTreeMap<&str, Vec<&TestCaseRow>> = BTreeMap::new();
    for r in &rows {
        by_test.entry(r.test_name.as_str()).or_default().push(r);
    }

    let mut out: Vec<FlakeRow> = by_test
        .into_iter()
        .map(|(name, rows)| {
            let mut recent = (0usize, 0usize);
            let mut prior = (0usize, 0usize);
            for r in rows {
                let date = r.test_date();
                if !after(date, prev_cutoff) {
                    continue;
                }
                let bucket = if after(date, recent_cutoff) {
                    &mut recent
                } else {
                    &mut prior
                };
                bucket.1 += 1;
                if r.result == FAIL {
                    bucket.0 += 1;
                }
            }
            let recent_pct = percentage(recent.0, recent.1);
            let prior_pct = percentage(prior.0, prior.1);
            FlakeRow {
                test_name: name.to_string(),
                recent_flake_percentage: recent_pct,
                growth_rate: round2(recent_pct - prior_pct),
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.recent_flake_percentage
            .total_cmp(&a.recent_flake_percentage)
            .then_with(|| a.test_name.cmp(&b.test_name))
    });
    out
}

/// Bucketed flake-percentage series for one test's history, annotated with
/// the contributing commits and their artifact locations.
pub fn flake_buckets(
    rows: &[TestCaseRow],
    artifacts: &HashMap<String, String>,
    bucket: Bucket,
) -> Vec<FlakeBucketRow> {
    let mut grouped: BTreeMap<String, (usize, usize, Vec<String>)> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.result != SKIP) {
        let entry = grouped.entry(bucket.label(r.test_date())).or_default();
        entry.1 += 1;
        if r.result == FAIL {
            entry.0 += 1;
        }
        if !entry.2.contains(&r.commit_id) {
            entry.2.push(r.commit_id.clone());
        }
    }
    grouped
        .into_iter()
        .map(|(period, (fails, total, commits))| FlakeBucketRow {
            period,
            flake_percentage: percentage(fails, total),
            artifact_paths: commits
                .iter()
                .filter_map(|c| artifacts.get(c).filter(|p| !p.is_empty()).cloned())
                .collect(),
            commits,
        })
        .collect()
}

/// Bucketed average-duration series for one test's history.
pub fn duration_buckets(rows: &[TestCaseRow], bucket: Bucket) -> Vec<DurationBucketRow> {
    let mut grouped: BTreeMap<String, (f64, usize, Vec<String>)> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.result != SKIP) {
        let entry = grouped.entry(bucket.label(r.test_date())).or_default();
        entry.0 += r.duration;
        entry.1 += 1;
        if !entry.2.contains(&r.commit_id) {
            entry.2.push(r.commit_id.clone());
        }
    }
    grouped
        .into_iter()
        .map(|(period, (sum, n, commits))| DurationBucketRow {
            period,
            duration: round2(sum / n as f64),
            commits,
        })
        .collect()
}

/// Per-(environment, group) overview: daily averages of failure count and
/// duration over the runs given (the caller restricts them to the overview
/// window), plus the two-window growth comparison applied to both.
pub fn env_overview(runs: &[EnvironmentRun], window: usize) -> Vec<EnvSummaryRow> {
    let window = window.max(1);
    let mut by_env: BTreeMap<(String, String), Vec<&EnvironmentRun>> = BTreeMap::new();
    for r in runs {
        by_env
            .entry((r.env_name.clone(), r.env_group.clone()))
            .or_default()
            .push(r);
    }

    by_env
        .into_iter()
        .map(|((env_name, env_group), runs)| {
            let dates =
                window_dates(runs.iter().map(|r| r.test_time.date_naive()), window);
            let (recent_cutoff, prev_cutoff) = cutoffs(&dates, window);

            let mut per_day: BTreeMap<NaiveDate, (i64, f64, usize)> = BTreeMap::new();
            for r in &runs {
                let entry = per_day.entry(r.test_time.date_naive()).or_default();
                entry.0 += r.number_of_fail;
                entry.1 += r.total_duration;
                entry.2 += 1;
            }

            let day_avgs: Vec<(NaiveDate, f64, f64)> = per_day
                .into_iter()
                .map(|(date, (fails, duration, n))| {
                    (date, fails as f64 / n as f64, duration / n as f64)
                })
                .collect();

            let averages = |filter: &dyn Fn(NaiveDate) -> bool| -> (f64, f64) {
                let days: Vec<_> =
                    day_avgs.iter().filter(|(d, _, _)| filter(*d)).collect();
                if days.is_empty() {
                    return (0.0, 0.0);
                }
                let n = days.len() as f64;
                (
                    days.iter().map(|(_, f, _)| f).sum::<f64>() / n,
                    days.iter().map(|(_, _, d)| d).sum::<f64>() / n,
                )
            };

            let (avg_fail, avg_duration) = averages(&|_| true);
            let (recent_fail, recent_duration) = averages(&|d| after(d, recent_cutoff));
            let (prior_fail, prior_duration) = averages(&|d| {
                after(d, prev_cutoff)
                    && recent_cutoff.is_some_and(|c| d < c)
            });

            EnvSummaryRow {
                env_name,
                env_group,
                avg_fail_per_day: round2(avg_fail),
                avg_duration: round2(avg_duration),
                fail_growth: round2(recent_fail - prior_fail),
                duration_growth: round2(recent_duration - prior_duration),
            }
        })
        .collect()
}

/// Resolve the environment group to query.
///
/// `pairs` is the set of (env_name, env_group) combinations known to the
/// store. An explicit group must exist for the environment; with no
/// explicit group the environment must map to exactly one.
pub fn resolve_env_group(
    pairs: &[(String, String)],
    env: &str,
    group: Option<&str>,
) -> Result<String> {
    let groups: BTreeSet<&str> = pairs
        .iter()
        .filter(|(e, _)| e == env)
        .map(|(_, g)| g.as_str())
        .collect();
    if groups.is_empty() {
        return Err(Error::validation(format!("unknown environment {env:?}")));
    }
    match group {
        Some(g) if groups.contains(g) => Ok(g.to_string()),
        Some(g) => Err(Error::validation(format!(
            "environment group {g:?} not found for environment {env:?}"
        ))),
        None => match (groups.len(), groups.iter().next()) {
            (1, Some(g)) => Ok((*g).to_string()),
            _ => Err(Error::validation(format!(
                "ambiguous environment {env:?}: groups {groups:?}"
            ))),
        },
    }
}
