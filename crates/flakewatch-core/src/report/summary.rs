//! Portable run summary: the JSON document exchanged between the report
//! generator, the crawl pipeline and the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    EnvironmentRun, RunDetail, TestCaseRow, FAIL, LEGACY_ENV_GROUP, PASS, SKIP,
};
use crate::report::ReportContent;

/// Mirrors the `test_summary.json` artifact written next to each run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "NumberOfTests", default)]
    pub number_of_tests: i64,
    #[serde(rename = "NumberOfFail", default)]
    pub number_of_fail: i64,
    #[serde(rename = "NumberOfPass", default)]
    pub number_of_pass: i64,
    #[serde(rename = "NumberOfSkip", default)]
    pub number_of_skip: i64,
    #[serde(rename = "FailedTests", default)]
    pub failed_tests: Vec<String>,
    #[serde(rename = "PassedTests", default)]
    pub passed_tests: Vec<String>,
    #[serde(rename = "SkippedTests", default)]
    pub skipped_tests: Vec<String>,
    #[serde(rename = "Durations", default)]
    pub durations: BTreeMap<String, f64>,
    #[serde(rename = "TotalDuration", default)]
    pub total_duration: f64,
    #[serde(rename = "ToolVersion", default)]
    pub tool_version: String,
    #[serde(rename = "ToolBuild", default)]
    pub tool_build: String,
    #[serde(rename = "Detail", default)]
    pub detail: RunDetail,
}

impl ReportContent {
    /// Produce the portable summary: test names without logs.
    pub fn short_summary(&self) -> Summary {
        let mut s = Summary {
            number_of_pass: self.passed.len() as i64,
            number_of_fail: self.failed.len() as i64,
            number_of_skip: self.skipped.len() as i64,
            total_duration: self.total_duration,
            tool_version: self.version.version.clone(),
            tool_build: self.version.build.clone(),
            detail: self.detail.clone(),
            ..Summary::default()
        };
        for t in &self.passed {
            s.passed_tests.push(t.test_name.clone());
            s.durations.insert(t.test_name.clone(), t.duration);
        }
        for t in &self.failed {
            s.failed_tests.push(t.test_name.clone());
            s.durations.insert(t.test_name.clone(), t.duration);
        }
        for t in &self.skipped {
            // Skip durations are near-zero and would pollute cross-run
            // trend charts, so they are tracked in the bucket list only.
            s.skipped_tests.push(t.test_name.clone());
        }
        s.number_of_tests = s.number_of_fail + s.number_of_pass + s.number_of_skip;
        s
    }
}

impl Summary {
    /// Check the summary is internally consistent before persisting it.
    pub fn validate(&self) -> Result<()> {
        if self.detail.name.is_empty() {
            return Err(Error::validation("missing detail name"));
        }
        if self.detail.details.is_empty() {
            return Err(Error::validation("missing detail id"));
        }
        let listed =
            self.failed_tests.len() + self.passed_tests.len() + self.skipped_tests.len();
        if listed == 0 {
            return Err(Error::validation("no tests listed"));
        }
        if self.number_of_fail != self.failed_tests.len() as i64 {
            return Err(Error::validation(format!(
                "failed count mismatch: expected {}, got {}",
                self.failed_tests.len(),
                self.number_of_fail
            )));
        }
        if self.number_of_pass != self.passed_tests.len() as i64 {
            return Err(Error::validation(format!(
                "pass count mismatch: expected {}, got {}",
                self.passed_tests.len(),
                self.number_of_pass
            )));
        }
        if self.number_of_skip != self.skipped_tests.len() as i64 {
            return Err(Error::validation(format!(
                "skip count mismatch: expected {}, got {}",
                self.skipped_tests.len(),
                self.number_of_skip
            )));
        }
        if self.number_of_tests != self.number_of_fail + self.number_of_pass + self.number_of_skip {
            return Err(Error::validation(format!(
                "total test count mismatch: expected {}, got {}",
                self.number_of_fail + self.number_of_pass + self.number_of_skip,
                self.number_of_tests
            )));
        }
        Ok(())
    }

    /// Convert a valid summary into persistable rows.
    ///
    /// The environment group defaults to the legacy sentinel; ingestion
    /// paths that know the group overwrite it before `set`.
    pub fn to_db_rows(
        &self,
        test_time: DateTime<Utc>,
    ) -> Result<(EnvironmentRun, Vec<TestCaseRow>)> {
        self.validate()?;

        let mut rows = Vec::with_capacity(self.number_of_tests as usize);
        let mut add = |result: &str, names: &[String], rows: &mut Vec<TestCaseRow>| {
            for name in names {
                rows.push(TestCaseRow {
                    pr: self.detail.pr.clone(),
                    commit_id: self.detail.details.clone(),
                    env_name: self.detail.name.clone(),
                    env_group: LEGACY_ENV_GROUP.to_string(),
                    test_name: name.clone(),
                    result: result.to_string(),
                    test_time,
                    duration: self.durations.get(name).copied().unwrap_or(0.0),
                    test_order: 0,
                });
            }
        };
        add(PASS, &self.passed_tests, &mut rows);
        add(FAIL, &self.failed_tests, &mut rows);
        add(SKIP, &self.skipped_tests, &mut rows);

        let run = EnvironmentRun {
            commit_id: self.detail.details.clone(),
            env_name: self.detail.name.clone(),
            env_group: LEGACY_ENV_GROUP.to_string(),
            ingest_time: Utc::now(),
            test_time,
            number_of_fail: self.number_of_fail,
            number_of_pass: self.number_of_pass,
            number_of_skip: self.number_of_skip,
            total_duration: self.total_duration,
            tool_version: if self.tool_build.is_empty() {
                self.tool_version.clone()
            } else {
                format!("{}_{}", self.tool_version, self.tool_build)
            },
            artifact_path: String::new(),
        };
        Ok((run, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_summary() -> Summary {
        Summary {
            number_of_tests: 4,
            number_of_fail: 1,
            number_of_pass: 2,
            number_of_skip: 1,
            failed_tests: vec!["TestFunctional/Flaky".into()],
            passed_tests: vec!["TestStart".into(), "TestStop".into()],
            skipped_tests: vec!["TestGpu".into()],
            durations: BTreeMap::from([
                ("TestStart".into(), 40.0),
                ("TestStop".into(), 12.5),
                ("TestFunctional/Flaky".into(), 88.0),
            ]),
            total_duration: 120.0,
            tool_version: "v0.3.0".into(),
            tool_build: "abc123".into(),
            detail: RunDetail {
                name: "KVM Linux".into(),
                details: "deadbeef".into(),
                pr: "12345".into(),
                repo_name: "minikube".into(),
            },
        }
    }

    #[test]
    fn valid_summary_passes() {
        valid_summary().validate().unwrap();
    }

    #[test]
    fn missing_identity_fails() {
        let mut s = valid_summary();
        s.detail.name.clear();
        assert!(s.validate().is_err());
        let mut s = valid_summary();
        s.detail.details.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn count_mismatches_fail() {
        let mut s = valid_summary();
        s.number_of_pass = 3;
        assert!(s.validate().is_err());
        let mut s = valid_summary();
        s.number_of_tests = 5;
        assert!(s.validate().is_err());
        let mut s = valid_summary();
        s.failed_tests.clear();
        s.passed_tests.clear();
        s.skipped_tests.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn to_db_rows_round_trip() {
        let s = valid_summary();
        let when = Utc::now();
        let (run, rows) = s.to_db_rows(when).unwrap();
        assert_eq!(
            rows.len() as i64,
            s.number_of_fail + s.number_of_pass + s.number_of_skip
        );
        assert_eq!(run.number_of_fail, s.number_of_fail);
        assert_eq!(run.number_of_pass, s.number_of_pass);
        assert_eq!(run.number_of_skip, s.number_of_skip);
        assert_eq!(run.env_group, LEGACY_ENV_GROUP);
        assert_eq!(run.tool_version, "v0.3.0_abc123");
        let flaky = rows.iter().find(|r| r.test_name == "TestFunctional/Flaky").unwrap();
        assert_eq!(flaky.result, FAIL);
        assert_eq!(flaky.duration, 88.0);
        let skipped = rows.iter().find(|r| r.test_name == "TestGpu").unwrap();
        assert_eq!(skipped.duration, 0.0);
    }

    #[test]
    fn summary_serializes_with_producer_field_names() {
        let json = serde_json::to_value(valid_summary()).unwrap();
        assert!(json.get("NumberOfTests").is_some());
        assert!(json.get("FailedTests").is_some());
        assert!(json.get("Detail").and_then(|d| d.get("PR")).is_some());
    }
}
