//! End-to-end crawl tests against a mock job index and artifact store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use flakewatch_core::config::DashboardConfig;
use flakewatch_core::crawl::Crawler;
use flakewatch_core::storage::sqlite::SqliteStore;
use flakewatch_core::storage::{QueryOutcome, Store};

fn dashboard(job: &str, max_pages: usize) -> DashboardConfig {
    DashboardConfig {
        id: job.to_string(),
        job_name: job.to_string(),
        label: job.to_string(),
        skip_statuses: Vec::new(),
        min_duration: String::new(),
        max_pages,
        env_group: "GroupA".to_string(),
    }
}

fn job(id: &str, status: &str, link: &str) -> serde_json::Value {
    json!({
        "ID": id,
        "Result": status,
        "Started": "2026-08-01T10:00:00Z",
        "Duration": 900.0,
        "ViewerLink": link,
    })
}

fn summary(commit: &str) -> serde_json::Value {
    json!({
        "NumberOfTests": 2,
        "NumberOfFail": 1,
        "NumberOfPass": 1,
        "NumberOfSkip": 0,
        "FailedTests": ["TestB"],
        "PassedTests": ["TestA"],
        "Durations": { "TestA": 3.5, "TestB": 9.0 },
        "TotalDuration": 12.5,
        "ToolVersion": "v0.3.0",
        "ToolBuild": "abc",
        "Detail": { "Name": "kvm", "Details": commit, "PR": "", "RepoName": "r" },
    })
}

async fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    store.initialize().await.unwrap();
    Arc::new(store)
}

async fn mount_index(server: &MockServer, job_name: &str, jobs: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/jobs/{job_name}")))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jobs))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/jobs/{job_name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

async fn mount_summary(server: &MockServer, slot: u32, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!(
            "/bucket/logs/{slot}/artifacts/test_summary.json"
        )))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn crawl_counts_soft_and_hard_failures_separately() {
    let server = MockServer::start().await;
    let link = |slot: u32| format!("{}/bucket/logs/{slot}", server.uri());
    mount_index(
        &server,
        "ci-flake",
        json!([
            job("1001", "SUCCESS", &link(1)),
            job("1002", "FAILURE", &link(2)),
            job("1003", "SUCCESS", &link(3)),
            job("1004", "SUCCESS", &link(4)),
            job("1005", "SUCCESS", &link(5)),
            job("1006", "ABORTED", &link(6)),
        ]),
    )
    .await;
    for slot in 1..=3 {
        mount_summary(
            &server,
            slot,
            ResponseTemplate::new(200).set_body_json(summary(&format!("commit{slot}"))),
        )
        .await;
    }
    mount_summary(&server, 4, ResponseTemplate::new(404)).await;
    mount_summary(&server, 5, ResponseTemplate::new(500)).await;

    let store = store().await;
    let crawler = Crawler::new(server.uri(), store.clone() as Arc<dyn Store>)
        .unwrap()
        .with_storage_base(server.uri());
    let mut dash = dashboard("ci-flake", 1);
    dash.skip_statuses = vec!["ABORTED".to_string()];
    let report = crawler
        .run(&dash, 3, &CancellationToken::new())
        .await
        .unwrap();

    // The aborted job never makes it past the listing filter.
    assert_eq!(report.total_jobs, 5);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.missing_summary, 1);
    assert_eq!(report.invalid_summary, 0);
    assert_eq!(report.errors, 1);
    assert_eq!(report.error_samples.len(), 1);
    assert!(report.error_samples[0].contains("1005"));

    let QueryOutcome::Rows(recent) = store.recent(100).await.unwrap() else {
        panic!("expected rows");
    };
    assert_eq!(recent.runs.len(), 3);
    for run in &recent.runs {
        assert_eq!(run.env_group, "GroupA");
        assert!(run.artifact_path.starts_with("bucket/logs/"));
        // Run identity carries the job id appended to the commit.
        assert!(run.commit_id.contains(':'));
    }
}

#[tokio::test]
async fn crawl_counts_inconsistent_summaries_as_invalid() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "ci-flake",
        json!([job(
            "2001",
            "SUCCESS",
            &format!("{}/bucket/logs/1", server.uri())
        )]),
    )
    .await;
    let mut bad = summary("commitx");
    bad["NumberOfPass"] = json!(7);
    mount_summary(&server, 1, ResponseTemplate::new(200).set_body_json(bad)).await;

    let store = store().await;
    let crawler = Crawler::new(server.uri(), store.clone() as Arc<dyn Store>)
        .unwrap()
        .with_storage_base(server.uri());
    let report = crawler
        .run(&dashboard("ci-flake", 1), 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.inserted, 0);
    assert_eq!(report.invalid_summary, 1);
    assert_eq!(report.errors, 0);
    assert!(matches!(
        store.recent(10).await.unwrap(),
        QueryOutcome::Empty
    ));
}

/// Serves a summary while counting how many fetches are inside the
/// handler at once, so the test can read back the observed maximum.
struct GatedSummary {
    body: serde_json::Value,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Respond for GatedSummary {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Hold the gate open long enough for queued fetches to pile up
        // here if the permit bound were broken.
        std::thread::sleep(Duration::from_millis(100));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(self.body.clone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crawl_respects_the_concurrency_bound() {
    let server = MockServer::start().await;
    let link = |slot: u32| format!("{}/bucket/logs/{slot}", server.uri());
    let jobs: Vec<serde_json::Value> = (1..=6)
        .map(|slot| job(&format!("30{slot:02}"), "SUCCESS", &link(slot)))
        .collect();
    mount_index(&server, "ci-flake", json!(jobs)).await;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    for slot in 1..=6 {
        Mock::given(method("GET"))
            .and(path(format!(
                "/bucket/logs/{slot}/artifacts/test_summary.json"
            )))
            .respond_with(GatedSummary {
                body: summary(&format!("commit{slot}")),
                in_flight: Arc::clone(&in_flight),
                max_in_flight: Arc::clone(&max_in_flight),
            })
            .mount(&server)
            .await;
    }

    let store = store().await;
    let crawler = Crawler::new(server.uri(), store.clone() as Arc<dyn Store>)
        .unwrap()
        .with_storage_base(server.uri());
    let report = crawler
        .run(&dashboard("ci-flake", 1), 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.inserted, 6);
    let peak = max_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "observed {peak} concurrent fetches");
}

#[tokio::test]
async fn cancelled_crawl_processes_nothing() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "ci-flake",
        json!([job(
            "4001",
            "SUCCESS",
            &format!("{}/bucket/logs/1", server.uri())
        )]),
    )
    .await;

    let store = store().await;
    let crawler = Crawler::new(server.uri(), store.clone() as Arc<dyn Store>)
        .unwrap()
        .with_storage_base(server.uri());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = crawler
        .run(&dashboard("ci-flake", 1), 2, &cancel)
        .await
        .unwrap();

    assert_eq!(report.total_jobs, 1);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.errors, 0);
    assert!(matches!(
        store.recent(10).await.unwrap(),
        QueryOutcome::Empty
    ));
}
