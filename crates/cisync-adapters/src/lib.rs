//! Provider client contracts, run selection and report analyzers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cisync_core::{
    convert_to_report_test_suites, parse_junit, Artifact, CiService, CustomReportArtifacts,
    TestReport, WorkflowParams, WorkflowReport,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod bitrise;
pub mod circleci;
pub mod fixture;
pub mod github;
pub mod jenkins;

pub use fixture::FixtureClient;

pub const CRATE_NAME: &str = "cisync-adapters";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Named custom report and the artifact globs it is collected from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomReportConfig {
    pub name: String,
    pub paths: Vec<String>,
}

/// A selected run as seen by the orchestrator.
pub trait RunSummary {
    /// Watermark unit of the run.
    fn run_number(&self) -> u64;
    /// Provider-side identifier used to fetch the run's details.
    fn run_key(&self) -> String;
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    type Summary: Send + Sync;
    type Run: RunSummary + Clone + Send + Sync;
    type Detail: Send + Sync;

    async fn fetch_runs(
        &self,
        entity: &str,
        last_run: Option<u64>,
    ) -> Result<Vec<Self::Summary>, ClientError>;

    async fn fetch_run_detail(&self, entity: &str, run: &Self::Run) -> Result<Self::Detail, ClientError>;

    async fn fetch_tests(
        &self,
        entity: &str,
        run: &Self::Run,
        globs: &[String],
    ) -> Result<Vec<Artifact>, ClientError>;

    async fn fetch_custom_reports(
        &self,
        entity: &str,
        run: &Self::Run,
        configs: &[CustomReportConfig],
    ) -> Result<CustomReportArtifacts, ClientError>;
}

/// Watermark metadata version an analyzer writes, and whether moving an
/// entity onto it invalidates the stored run number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaVersionPolicy {
    pub version: u32,
    pub reset_on_migrate: bool,
}

/// Run selection and report normalization for one provider.
pub trait Analyzer: Send + Sync {
    type Summary;
    type Run: RunSummary;
    type Detail;

    fn service(&self) -> CiService;

    fn meta_version(&self) -> Option<MetaVersionPolicy> {
        None
    }

    /// Stream a summary belongs to when the provider numbers runs per stream
    /// rather than per entity. Each partition is selected against, and
    /// advances, its own watermark.
    fn watermark_partition(&self, _summary: &Self::Summary) -> Option<String> {
        None
    }

    /// Settled runs above `last_run`, ascending by run number.
    fn select_runs(&self, summaries: Vec<Self::Summary>, last_run: Option<u64>) -> Vec<Self::Run>;

    fn create_workflow_params(
        &self,
        repository: &str,
        workflow_name: &str,
        build_number: u64,
    ) -> WorkflowParams {
        WorkflowParams::new(repository, workflow_name, build_number)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        run: &Self::Run,
        detail: &Self::Detail,
    ) -> Vec<WorkflowReport>;

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        detail: &Self::Detail,
        artifacts: &[Artifact],
    ) -> Vec<TestReport>;
}

/// Shared selection rule: drop runs at or below the watermark, then withhold
/// everything from the oldest in-flight run onwards.
pub fn settled_runs<T>(
    runs: Vec<T>,
    last_run: Option<u64>,
    number: impl Fn(&T) -> u64,
    in_flight: impl Fn(&T) -> bool,
) -> Vec<T> {
    let mut runs: Vec<T> = runs
        .into_iter()
        .filter(|run| last_run.map_or(true, |last| number(run) > last))
        .collect();
    if let Some(boundary) = runs.iter().filter(|run| in_flight(run)).map(&number).min() {
        runs.retain(|run| number(run) < boundary);
    }
    runs.sort_by_key(|run| number(run));
    runs
}

/// Parses JUnit artifacts into test reports; unparsable artifacts are skipped.
pub fn junit_test_reports(workflow: &WorkflowReport, artifacts: &[Artifact]) -> Vec<TestReport> {
    artifacts
        .iter()
        .filter_map(|artifact| {
            let text = String::from_utf8_lossy(&artifact.data);
            match parse_junit(&text) {
                Ok(suites) => Some(TestReport::new(
                    workflow,
                    convert_to_report_test_suites(suites),
                )),
                Err(err) => {
                    warn!(
                        path = %artifact.path,
                        workflow_run_id = %workflow.workflow_run_id,
                        "skipping unparsable junit artifact: {err}"
                    );
                    None
                }
            }
        })
        .collect()
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;
    use cisync_core::Status;

    #[derive(Debug, Clone, PartialEq)]
    struct Run {
        number: u64,
        running: bool,
    }

    fn run(number: u64, running: bool) -> Run {
        Run { number, running }
    }

    fn select(runs: Vec<Run>, last_run: Option<u64>) -> Vec<u64> {
        settled_runs(runs, last_run, |r| r.number, |r| r.running)
            .into_iter()
            .map(|r| r.number)
            .collect()
    }

    #[test]
    fn withholds_everything_from_first_in_flight_run() {
        let runs = vec![run(5, false), run(3, true), run(4, false), run(2, false)];
        assert_eq!(select(runs, None), vec![2]);
    }

    #[test]
    fn keeps_all_when_nothing_runs_and_sorts() {
        let runs = vec![run(3, false), run(1, false), run(2, false)];
        assert_eq!(select(runs, None), vec![1, 2, 3]);
    }

    #[test]
    fn selection_is_idempotent_and_batches_do_not_overlap() {
        let all = vec![run(1, false), run(2, false), run(3, false), run(4, true), run(5, false)];
        let first = select(all.clone(), Some(0));
        assert_eq!(first, select(all.clone(), Some(0)));
        assert_eq!(first, vec![1, 2, 3]);

        // Run 4 finishes later; the next batch starts right after the watermark.
        let later: Vec<Run> = all.into_iter().map(|r| run(r.number, false)).collect();
        let next = select(later, first.last().copied());
        assert_eq!(next, vec![4, 5]);
    }

    #[test]
    fn in_flight_runs_below_watermark_are_ignored() {
        let runs = vec![run(2, true), run(6, false), run(7, false)];
        assert_eq!(select(runs, Some(5)), vec![6, 7]);
    }

    #[test]
    fn junit_reports_skip_broken_artifacts() {
        let wf = testutil::workflow();
        let artifacts = vec![
            Artifact::new("broken.xml", b"<testsuites><testsuite".to_vec()),
            Artifact::new(
                "ok.xml",
                br#"<testsuite name="s" tests="1" failures="1"><testcase name="t"><failure/></testcase></testsuite>"#.to_vec(),
            ),
        ];
        let reports = junit_test_reports(&wf, &artifacts);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, Status::Failure);
        assert_eq!(reports[0].success_count, 0);
        assert_eq!(reports[0].workflow_run_id, wf.workflow_run_id);
        assert_eq!(reports[0].test_suites.testsuite.len(), 1);
    }
}
