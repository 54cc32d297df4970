//! Crawl-ingest pipeline: walks an external job index, fetches each run's
//! summary artifact and upserts it into the store.

pub mod index;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DashboardConfig;
use crate::error::{Error, Result};
use crate::report::Summary;
use crate::storage::Store;

pub use index::{IndexClient, JobQuery, JobRecord};

const SUMMARY_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_ERROR_SAMPLES: usize = 10;

const DEFAULT_VIEW_HOST: &str = "https://prow.k8s.io";
const DEFAULT_STORAGE_BASE: &str = "https://storage.googleapis.com";

const SUMMARY_SUFFIX: &str = "/artifacts/test_summary.json";

/// Outcome of one crawl run, returned to the caller and suitable for a
/// JSON response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlReport {
    pub dashboard: String,
    pub job_name: String,
    pub total_jobs: usize,
    pub inserted: usize,
    pub missing_summary: usize,
    pub invalid_summary: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_samples: Vec<String>,
    pub duration: String,
    pub max_pages: usize,
    pub concurrency: usize,
}

#[derive(Debug, Default)]
struct CrawlStats {
    total_jobs: usize,
    inserted: usize,
    missing_summary: usize,
    invalid_summary: usize,
    errors: usize,
    error_samples: Vec<String>,
}

impl CrawlStats {
    fn add_sample(&mut self, message: String) {
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(message);
        }
    }

    fn add_invalid(&mut self, message: String) {
        self.invalid_summary += 1;
        self.add_sample(message);
    }

    fn add_error(&mut self, message: String) {
        self.errors += 1;
        self.add_sample(message);
    }

    fn report(
        &self,
        dashboard: &str,
        job_name: &str,
        elapsed: Duration,
        max_pages: usize,
        concurrency: usize,
    ) -> CrawlReport {
        CrawlReport {
            dashboard: dashboard.to_string(),
            job_name: job_name.to_string(),
            total_jobs: self.total_jobs,
            inserted: self.inserted,
            missing_summary: self.missing_summary,
            invalid_summary: self.invalid_summary,
            errors: self.errors,
            error_samples: self.error_samples.clone(),
            duration: humantime::format_duration(Duration::from_millis(
                elapsed.as_millis() as u64,
            ))
            .to_string(),
            max_pages,
            concurrency,
        }
    }
}

/// Soft, countable result of one job; hard failures come back as `Err`.
enum JobOutcome {
    Inserted,
    MissingSummary,
    InvalidSummary(String),
}

/// Crawls a job index and loads every reachable summary into the store.
#[derive(Clone)]
pub struct Crawler {
    index: IndexClient,
    http: reqwest::Client,
    store: Arc<dyn Store>,
    view_host: String,
    storage_base: String,
}

impl Crawler {
    pub fn new(index_base: impl Into<String>, store: Arc<dyn Store>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SUMMARY_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            index: IndexClient::new(index_base)?,
            http,
            store,
            view_host: DEFAULT_VIEW_HOST.to_string(),
            storage_base: DEFAULT_STORAGE_BASE.to_string(),
        })
    }

    /// Override the host prepended to root-relative viewer links.
    pub fn with_view_host(mut self, host: impl Into<String>) -> Self {
        self.view_host = host.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the artifact storage base viewer links resolve against.
    pub fn with_storage_base(mut self, base: impl Into<String>) -> Self {
        self.storage_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Crawl one dashboard's job history. Per-job failures are counted,
    /// never fatal; only a failed listing aborts the run.
    pub async fn run(
        &self,
        dashboard: &DashboardConfig,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<CrawlReport> {
        if dashboard.job_name.is_empty() {
            return Err(Error::config(format!(
                "dashboard {} has no job_name",
                dashboard.id
            )));
        }
        let env_group = dashboard.env_group_or_default();
        let query = JobQuery {
            job_name: dashboard.job_name.clone(),
            max_pages: dashboard.max_pages,
            skip_statuses: dashboard.skip_statuses_or_default(),
            min_duration: dashboard.parse_min_duration()?,
        };
        info!(
            dashboard = %dashboard.id,
            job = %query.job_name,
            max_pages = query.max_pages,
            concurrency,
            "crawl start"
        );

        let jobs = self.index.list_jobs(&query).await?;
        let stats = Arc::new(Mutex::new(CrawlStats {
            total_jobs: jobs.len(),
            ..CrawlStats::default()
        }));
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::store(format!("crawl scheduler closed: {e}")))?;
            let this = self.clone();
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            let job_name = query.job_name.clone();
            let env_group = env_group.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return;
                }
                let outcome = this.process_job(&job, &job_name, &env_group).await;
                let mut stats = lock_stats(&stats);
                match outcome {
                    Ok(JobOutcome::Inserted) => stats.inserted += 1,
                    Ok(JobOutcome::MissingSummary) => stats.missing_summary += 1,
                    Ok(JobOutcome::InvalidSummary(msg)) => stats.add_invalid(msg),
                    Err(e) => stats.add_error(format!("job {}: {e}", job.id)),
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                lock_stats(&stats).add_error(format!("crawl worker failed: {e}"));
            }
        }

        let report = lock_stats(&stats).report(
            &dashboard.id,
            &query.job_name,
            started.elapsed(),
            query.max_pages,
            concurrency,
        );
        info!(
            inserted = report.inserted,
            missing = report.missing_summary,
            invalid = report.invalid_summary,
            errors = report.errors,
            duration = %report.duration,
            "crawl finished"
        );
        Ok(report)
    }

    async fn process_job(
        &self,
        job: &JobRecord,
        job_name: &str,
        env_group: &str,
    ) -> Result<JobOutcome> {
        let summary_url =
            viewer_to_summary_url(&job.viewer_link, &self.view_host, &self.storage_base)?;
        let started_at = chrono::DateTime::parse_from_rfc3339(&job.started)
            .map_err(|e| Error::InvalidResponse {
                message: format!("bad start time {:?}: {e}", job.started),
            })?
            .with_timezone(&chrono::Utc);

        let resp = self.http.get(&summary_url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(job = %job.id, "summary artifact missing");
            return Ok(JobOutcome::MissingSummary);
        }
        if !resp.status().is_success() {
            return Err(Error::Network {
                message: format!("unexpected status {} for {summary_url}", resp.status()),
            });
        }
        let mut summary: Summary = resp.json().await.map_err(|e| Error::InvalidResponse {
            message: format!("bad summary body from {summary_url}: {e}"),
        })?;

        let artifact_path = match summary_url_to_artifact_path(&summary_url) {
            Ok(path) => path,
            Err(e) => {
                warn!(job = %job.id, error = %e, "could not derive artifact path");
                String::new()
            }
        };
        summary.detail.details =
            ensure_details_token(&summary.detail.details, job_name, &job.id);
        if let Err(e) = summary.validate() {
            return Ok(JobOutcome::InvalidSummary(format!(
                "job {}: invalid summary: {e}",
                job.id
            )));
        }
        let (mut run, cases) = match summary.to_db_rows(started_at) {
            Ok(rows) => rows,
            Err(e) => {
                return Ok(JobOutcome::InvalidSummary(format!(
                    "job {}: summary conversion: {e}",
                    job.id
                )))
            }
        };
        run.env_group = env_group.to_string();
        if !artifact_path.is_empty() {
            run.artifact_path = artifact_path;
        }
        self.store.set(&run, &cases).await?;
        Ok(JobOutcome::Inserted)
    }
}

fn lock_stats(stats: &Mutex<CrawlStats>) -> std::sync::MutexGuard<'_, CrawlStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve a viewer link from the job index into the URL of the run's
/// summary artifact.
///
/// Three shapes are accepted: a root-relative viewer path, a direct
/// storage URL, and an absolute viewer URL with a `/view/gs/` path.
pub fn viewer_to_summary_url(link: &str, view_host: &str, storage_base: &str) -> Result<String> {
    if link.is_empty() {
        return Err(Error::UnsupportedLink {
            link: "<empty>".to_string(),
        });
    }
    let absolute = if link.starts_with('/') {
        format!("{view_host}{link}")
    } else {
        link.to_string()
    };
    let storage_prefix = format!("{storage_base}/");
    if absolute.starts_with(&storage_prefix) {
        return Ok(format!(
            "{}{SUMMARY_SUFFIX}",
            absolute.trim_end_matches('/')
        ));
    }
    let path = absolute
        .splitn(4, '/')
        .nth(3)
        .map(|p| format!("/{p}"))
        .unwrap_or_default();
    let gs_path = match path.strip_prefix("/view/gs/") {
        Some(rest) => rest.trim_end_matches('/'),
        None => {
            return Err(Error::UnsupportedLink {
                link: link.to_string(),
            })
        }
    };
    if gs_path.is_empty() {
        return Err(Error::UnsupportedLink {
            link: link.to_string(),
        });
    }
    Ok(format!("{storage_base}/{gs_path}{SUMMARY_SUFFIX}"))
}

/// Derive the bucket-relative artifact path recorded on the run row.
pub fn summary_url_to_artifact_path(summary_url: &str) -> Result<String> {
    let path = summary_url
        .splitn(4, '/')
        .nth(3)
        .ok_or_else(|| Error::UnsupportedLink {
            link: summary_url.to_string(),
        })?;
    let path = path.strip_suffix(&SUMMARY_SUFFIX[1..]).and_then(|p| {
        p.strip_suffix('/')
    }).ok_or_else(|| Error::UnsupportedLink {
        link: summary_url.to_string(),
    })?;
    let path = path.strip_prefix("gs/").unwrap_or(path);
    if path.is_empty() {
        return Err(Error::UnsupportedLink {
            link: summary_url.to_string(),
        });
    }
    Ok(path.to_string())
}

/// Normalize a crawled run's id so it carries the job id exactly once and
/// no marker or job-name prefix. Idempotent.
pub fn ensure_details_token(details: &str, job_name: &str, job_id: &str) -> String {
    let mut details = details.trim();
    if let Some(head) = details.get(..9) {
        if head.eq_ignore_ascii_case("external:") {
            details = details[9..].trim();
        }
    }
    if !job_name.is_empty() {
        if let Some(rest) = details.strip_prefix(&format!("{job_name}:")) {
            details = rest.trim();
        }
    }
    if details.is_empty() {
        return job_id.to_string();
    }
    if job_id.is_empty() {
        return details.to_string();
    }
    if details.split(':').any(|token| token.trim() == job_id) {
        return details.to_string();
    }
    format!("{details}:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_link_forms_resolve() {
        let view = "https://prow.example.com";
        let store = "https://storage.example.com";
        assert_eq!(
            viewer_to_summary_url("/view/gs/bucket/logs/123", view, store).unwrap(),
            "https://storage.example.com/bucket/logs/123/artifacts/test_summary.json"
        );
        assert_eq!(
            viewer_to_summary_url(
                "https://prow.example.com/view/gs/bucket/logs/123/",
                view,
                store
            )
            .unwrap(),
            "https://storage.example.com/bucket/logs/123/artifacts/test_summary.json"
        );
        assert_eq!(
            viewer_to_summary_url(
                "https://storage.example.com/bucket/logs/123/",
                view,
                store
            )
            .unwrap(),
            "https://storage.example.com/bucket/logs/123/artifacts/test_summary.json"
        );
    }

    #[test]
    fn unsupported_viewer_links_are_rejected() {
        let view = "https://prow.example.com";
        let store = "https://storage.example.com";
        assert!(viewer_to_summary_url("", view, store).is_err());
        assert!(viewer_to_summary_url("https://elsewhere.example.com/runs/9", view, store).is_err());
        assert!(viewer_to_summary_url("/view/gs/", view, store).is_err());
    }

    #[test]
    fn artifact_path_strips_scheme_and_suffix() {
        assert_eq!(
            summary_url_to_artifact_path(
                "https://storage.example.com/bucket/logs/123/artifacts/test_summary.json"
            )
            .unwrap(),
            "bucket/logs/123"
        );
        assert_eq!(
            summary_url_to_artifact_path(
                "https://storage.example.com/gs/bucket/logs/9/artifacts/test_summary.json"
            )
            .unwrap(),
            "bucket/logs/9"
        );
        assert!(summary_url_to_artifact_path("https://storage.example.com/bucket/other.json")
            .is_err());
    }

    #[test]
    fn details_token_normalization() {
        assert_eq!(ensure_details_token("", "job", "42"), "42");
        assert_eq!(ensure_details_token("deadbeef", "job", "42"), "deadbeef:42");
        assert_eq!(ensure_details_token("deadbeef:42", "job", "42"), "deadbeef:42");
        assert_eq!(
            ensure_details_token("External: job: deadbeef", "job", "42"),
            "deadbeef:42"
        );
        assert_eq!(ensure_details_token("deadbeef", "job", ""), "deadbeef");
        // Applying twice changes nothing.
        let once = ensure_details_token("external:deadbeef", "job", "42");
        assert_eq!(ensure_details_token(&once, "job", "42"), once);
    }
}
