//! Canonical CI report model shared by every provider analyzer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod custom_report;
pub mod junit;

pub use custom_report::{
    aggregate_custom_report_artifacts, create_custom_report_collection, CustomReport,
    CustomReportArtifacts, CustomReportCollection,
};
pub use junit::{
    convert_to_report_test_suites, parse_junit, JunitError, ReportTestCase, ReportTestSuite,
    ReportTestSuites, TestSuites,
};

pub const CRATE_NAME: &str = "cisync-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiService {
    Github,
    Circleci,
    Jenkins,
    Bitrise,
}

impl CiService {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiService::Github => "github",
            CiService::Circleci => "circleci",
            CiService::Jenkins => "jenkins",
            CiService::Bitrise => "bitrise",
        }
    }
}

impl fmt::Display for CiService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CiService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(CiService::Github),
            "circleci" => Ok(CiService::Circleci),
            "jenkins" => Ok(CiService::Jenkins),
            "bitrise" => Ok(CiService::Bitrise),
            other => Err(format!("unknown ci service `{other}`")),
        }
    }
}

/// Normalized outcome of a workflow, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    Aborted,
    Other,
}

impl Status {
    pub fn success_count(self) -> u8 {
        u8::from(self == Status::Success)
    }
}

/// Normalized outcome of a single testcase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Success,
    Failure,
    Error,
    Skipped,
}

/// Identity fields of one workflow run.
///
/// Every analyzer builds its reports from these so that workflow and test
/// reports of the same run always join on identical ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowParams {
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub build_number: u64,
    pub workflow_name: String,
}

impl WorkflowParams {
    pub fn new(repository: &str, workflow_name: &str, build_number: u64) -> Self {
        Self::from_workflow_id(
            format!("{repository}-{workflow_name}"),
            workflow_name,
            build_number,
        )
    }

    pub fn from_workflow_id(workflow_id: String, workflow_name: &str, build_number: u64) -> Self {
        Self {
            workflow_run_id: format!("{workflow_id}-{build_number}"),
            workflow_id,
            build_number,
            workflow_name: workflow_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub service: CiService,
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub build_number: u64,
    pub workflow_name: String,
    pub created_at: DateTime<Utc>,
    pub trigger: String,
    pub status: Status,
    pub repository: String,
    pub head_sha: String,
    pub branch: String,
    pub tag: String,
    pub jobs: Vec<JobReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub workflow_duration_sec: f64,
    pub sum_jobs_duration_sec: f64,
    pub success_count: u8,
    pub parameters: Vec<JobParameter>,
    pub queued_duration_sec: f64,
    pub commit_message: String,
    pub actor: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub workflow_run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
    pub job_id: String,
    pub job_name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub job_duration_sec: f64,
    pub sum_steps_duration_sec: f64,
    pub steps: Vec<StepReport>,
    pub url: String,
    pub executor_class: String,
    pub executor_type: String,
    pub executor_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub name: String,
    pub status: Status,
    pub number: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub step_duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub build_number: u64,
    pub workflow_name: String,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    pub service: CiService,
    pub test_suites: ReportTestSuites,
    pub status: Status,
    pub success_count: u8,
}

impl TestReport {
    pub fn new(workflow: &WorkflowReport, test_suites: ReportTestSuites) -> Self {
        let status = if test_suites.failures > 0 || test_suites.errors > 0 {
            Status::Failure
        } else {
            Status::Success
        };
        Self {
            workflow_id: workflow.workflow_id.clone(),
            workflow_run_id: workflow.workflow_run_id.clone(),
            build_number: workflow.build_number,
            workflow_name: workflow.workflow_name.clone(),
            created_at: workflow.created_at,
            branch: workflow.branch.clone(),
            service: workflow.service,
            test_suites,
            status,
            success_count: status.success_count(),
        }
    }
}

/// Raw artifact handed over by a provider client (JUnit XML, custom JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

pub fn round_sec(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Seconds between two instants, rounded to milliseconds and never negative.
pub fn diff_sec(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    round_sec(millis as f64 / 1000.0)
}

pub fn sum_sec(values: impl IntoIterator<Item = f64>) -> f64 {
    round_sec(values.into_iter().sum())
}

/// Earliest job start and latest job end, or `fallback` for both when there are no jobs.
pub fn job_time_bounds(jobs: &[JobReport], fallback: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let started_at = jobs.iter().map(|j| j.started_at).min().unwrap_or(fallback);
    let completed_at = jobs
        .iter()
        .map(|j| j.completed_at)
        .max()
        .unwrap_or(fallback)
        .max(started_at);
    (started_at, completed_at)
}

/// Workflow verdict for providers that only report per-job statuses.
pub fn status_from_jobs(statuses: impl IntoIterator<Item = Status>) -> Status {
    let statuses: Vec<Status> = statuses.into_iter().collect();
    if statuses.contains(&Status::Failure) {
        Status::Failure
    } else if statuses.contains(&Status::Aborted) {
        Status::Aborted
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == Status::Success) {
        Status::Success
    } else {
        Status::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn workflow_params_compose_ids() {
        let params = WorkflowParams::new("owner/repo", "ci", 42);
        assert_eq!(params.workflow_id, "owner/repo-ci");
        assert_eq!(params.workflow_run_id, "owner/repo-ci-42");
        assert_eq!(params.build_number, 42);
        assert_eq!(params.workflow_name, "ci");
    }

    #[test]
    fn diff_sec_rounds_and_clamps() {
        let start = at(0);
        let end = start + chrono::Duration::milliseconds(1_234_567);
        assert_eq!(diff_sec(start, end), 1234.567);
        assert_eq!(diff_sec(end, start), 0.0);
    }

    #[test]
    fn job_bounds_fall_back_without_jobs() {
        let (s, e) = job_time_bounds(&[], at(10));
        assert_eq!(s, at(10));
        assert_eq!(e, at(10));
    }

    #[test]
    fn status_from_jobs_prefers_failure_then_aborted() {
        assert_eq!(
            status_from_jobs([Status::Success, Status::Aborted, Status::Failure]),
            Status::Failure
        );
        assert_eq!(status_from_jobs([Status::Success, Status::Aborted]), Status::Aborted);
        assert_eq!(status_from_jobs([Status::Success, Status::Success]), Status::Success);
        assert_eq!(status_from_jobs([Status::Success, Status::Other]), Status::Other);
        assert_eq!(status_from_jobs(Vec::new()), Status::Other);
    }

    #[test]
    fn statuses_serialize_screaming() {
        assert_eq!(serde_json::to_string(&Status::Aborted).unwrap(), "\"ABORTED\"");
        assert_eq!(serde_json::to_string(&TestStatus::Skipped).unwrap(), "\"SKIPPED\"");
        assert_eq!(serde_json::to_string(&CiService::Circleci).unwrap(), "\"circleci\"");
    }

    #[test]
    fn service_names_parse_case_insensitively() {
        assert_eq!("GitHub".parse::<CiService>(), Ok(CiService::Github));
        assert_eq!(" jenkins ".parse::<CiService>(), Ok(CiService::Jenkins));
        assert!("travis".parse::<CiService>().is_err());
    }
}
