//! Crawl configuration: which dashboards to harvest and how.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::LEGACY_ENV_GROUP;

/// Default number of index pages to scan per dashboard.
pub const DEFAULT_MAX_PAGES: usize = 20;

/// Default parallel summary fetches while loading a dashboard.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Job status skipped by default: aborted runs carry no useful results.
pub const STATUS_ABORTED: &str = "ABORTED";

/// One dashboard entry: a job stream in the external index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub skip_statuses: Vec<String>,
    /// Duration floor, e.g. "10m"; jobs shorter than this are ignored.
    #[serde(default)]
    pub min_duration: String,
    #[serde(default)]
    pub max_pages: usize,
    /// Environment group tag applied to everything ingested from this
    /// dashboard.
    #[serde(default)]
    pub env_group: String,
}

/// The full dashboard list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub dashboards: Vec<DashboardConfig>,
}

impl CrawlConfig {
    /// Load dashboards from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: CrawlConfig = serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("bad crawl config: {e}")))?;
        let cfg = cfg.normalize();
        if cfg.dashboards.is_empty() {
            return Err(Error::config("no dashboards configured"));
        }
        Ok(cfg)
    }

    /// Locate a dashboard by id or job name.
    pub fn find_dashboard(&self, key: &str) -> Option<&DashboardConfig> {
        if key.is_empty() {
            return None;
        }
        self.dashboards
            .iter()
            .find(|d| d.id == key || d.job_name == key)
    }

    fn normalize(self) -> Self {
        let dashboards = self
            .dashboards
            .into_iter()
            .map(DashboardConfig::normalize)
            .filter(|d| !d.id.is_empty() || !d.job_name.is_empty())
            .collect();
        Self { dashboards }
    }
}

impl DashboardConfig {
    fn normalize(mut self) -> Self {
        self.id = self.id.trim().to_string();
        self.job_name = self.job_name.trim().to_string();
        self.label = self.label.trim().to_string();
        self.skip_statuses = normalize_statuses(self.skip_statuses);
        self.env_group = self.env_group.trim().to_string();
        if self.max_pages == 0 {
            self.max_pages = DEFAULT_MAX_PAGES;
        }
        if self.job_name.is_empty() && !self.id.is_empty() {
            // Ids like "periodics#ci-integration" carry the job name after
            // the dashboard marker.
            self.job_name = match self.id.split_once('#') {
                Some((_, job)) if !job.is_empty() => job.trim().to_string(),
                _ => self.id.clone(),
            };
        }
        if self.id.is_empty() {
            self.id = self.job_name.clone();
        }
        if self.label.is_empty() {
            self.label = self.id.clone();
        }
        self
    }

    /// The group tag to apply, falling back to the legacy sentinel.
    pub fn env_group_or_default(&self) -> String {
        if self.env_group.is_empty() {
            LEGACY_ENV_GROUP.to_string()
        } else {
            self.env_group.clone()
        }
    }

    /// Statuses to skip, defaulting to aborted runs.
    pub fn skip_statuses_or_default(&self) -> Vec<String> {
        if self.skip_statuses.is_empty() {
            vec![STATUS_ABORTED.to_string()]
        } else {
            self.skip_statuses.clone()
        }
    }

    /// Parse the duration floor; empty means no floor.
    pub fn parse_min_duration(&self) -> Result<Duration> {
        let raw = self.min_duration.trim();
        if raw.is_empty() {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(raw)
            .map_err(|e| Error::config(format!("invalid min_duration {raw:?}: {e}")))
    }
}

fn normalize_statuses(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_ascii_uppercase())
        .filter(|v| !v.is_empty())
        .map(|v| if v == "ABORT" { STATUS_ABORTED.to_string() } else { v })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_inferred_from_id() {
        let d = DashboardConfig {
            id: "minikube-periodics#ci-minikube-integration".into(),
            ..Default::default()
        }
        .normalize();
        assert_eq!(d.job_name, "ci-minikube-integration");
        assert_eq!(d.label, d.id);
        assert_eq!(d.max_pages, DEFAULT_MAX_PAGES);
    }

    #[test]
    fn statuses_upper_cased_and_aliased() {
        let d = DashboardConfig {
            job_name: "job".into(),
            skip_statuses: vec![" abort ".into(), "pending".into(), "".into()],
            ..Default::default()
        }
        .normalize();
        assert_eq!(d.skip_statuses, vec!["ABORTED", "PENDING"]);
    }

    #[test]
    fn min_duration_parses_or_defaults() {
        let mut d = DashboardConfig::default();
        assert_eq!(d.parse_min_duration().unwrap(), Duration::ZERO);
        d.min_duration = "10m".into();
        assert_eq!(d.parse_min_duration().unwrap(), Duration::from_secs(600));
        d.min_duration = "bogus".into();
        assert!(d.parse_min_duration().is_err());
    }

    #[test]
    fn find_by_id_or_job_name() {
        let cfg = CrawlConfig {
            dashboards: vec![DashboardConfig {
                id: "periodics#ci-job".into(),
                ..Default::default()
            }],
        }
        .normalize();
        assert!(cfg.find_dashboard("periodics#ci-job").is_some());
        assert!(cfg.find_dashboard("ci-job").is_some());
        assert!(cfg.find_dashboard("").is_none());
        assert!(cfg.find_dashboard("other").is_none());
    }

    #[test]
    fn env_group_defaults_to_sentinel() {
        let d = DashboardConfig::default();
        assert_eq!(d.env_group_or_default(), LEGACY_ENV_GROUP);
    }
}
