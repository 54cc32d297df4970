//! Paged client for the external job index.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// How long one index page fetch may take.
const INDEX_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// One historical job run as listed by the index.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Terminal status, e.g. SUCCESS, FAILURE, ABORTED.
    #[serde(rename = "Result", default)]
    pub status: String,
    /// RFC3339 start time.
    #[serde(rename = "Started", default)]
    pub started: String,
    /// Job length in seconds.
    #[serde(rename = "Duration", default)]
    pub duration_seconds: f64,
    /// Link into the index's result viewer; resolves to the artifact
    /// location.
    #[serde(rename = "ViewerLink", default)]
    pub viewer_link: String,
}

/// Filters applied while listing jobs.
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub job_name: String,
    pub max_pages: usize,
    pub skip_statuses: Vec<String>,
    pub min_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct IndexClient {
    client: reqwest::Client,
    base_url: String,
}

impl IndexClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(INDEX_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fetch up to `max_pages` pages of job history, newest first, dropping
    /// jobs matching a skipped status or shorter than the duration floor.
    /// An empty page ends pagination early.
    pub async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for page in 1..=query.max_pages {
            let url = format!("{}/jobs/{}?page={page}", self.base_url, query.job_name);
            let resp = self.client.get(&url).send().await?;
            if !resp.status().is_success() {
                return Err(Error::Network {
                    message: format!("unexpected status {} for {url}", resp.status()),
                });
            }
            let page_jobs: Vec<JobRecord> = resp.json().await.map_err(|e| {
                Error::InvalidResponse {
                    message: format!("bad job listing from {url}: {e}"),
                }
            })?;
            if page_jobs.is_empty() {
                break;
            }
            jobs.extend(page_jobs);
        }
        let before = jobs.len();
        jobs.retain(|j| {
            !query
                .skip_statuses
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&j.status))
                && j.duration_seconds >= query.min_duration.as_secs_f64()
        });
        debug!(
            job = %query.job_name,
            listed = before,
            kept = jobs.len(),
            "job index listing complete"
        );
        Ok(jobs)
    }
}
