//! Ingestion and flake analytics for line-oriented test-runner event logs.
//!
//! The pipeline runs in three stages: [`parse`] turns a raw event stream
//! into ordered test groups, [`report`] summarizes them into a run report
//! and its portable summary artifact, and [`storage`] persists the rows
//! behind a backend-agnostic [`storage::Store`]. On top of the stored rows,
//! [`analytics`] computes windowed flake rates and trend buckets, and
//! [`crawl`] bulk-ingests historical runs from an external job index.

pub mod analytics;
pub mod config;
pub mod crawl;
pub mod error;
pub mod model;
pub mod parse;
pub mod report;
pub mod storage;

pub use error::{Error, Result};
pub use model::{EnvironmentRun, RunDetail, TestCaseRow, TestEvent, TestGroup};
pub use report::{ReportContent, Summary, ToolVersion};
pub use storage::{open, QueryOutcome, Store, StoreConfig};
