//! CircleCI v1.1 (build-centric) and v2 (pipeline-centric) analyzers.

use cisync_core::junit::{TestCase, TestOutcome, TestSuite, TestSuites};
use cisync_core::{convert_to_report_test_suites, Status, TestReport, WorkflowReport};
use serde::{Deserialize, Serialize};

pub mod v1;
pub mod v2;

/// Test metadata entry as returned by the `tests` endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciTest {
    #[serde(default)]
    pub classname: String,
    pub name: String,
    pub result: String,
    #[serde(default)]
    pub run_time: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

/// Tests collected for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciJobTests {
    pub job_name: String,
    #[serde(default)]
    pub tests: Vec<CircleciTest>,
}

pub fn normalize_status(status: &str) -> Status {
    match status {
        "success" | "fixed" | "no_tests" => Status::Success,
        "failed" | "error" | "failing" | "infrastructure_fail" | "timedout" => Status::Failure,
        "canceled" | "cancelled" => Status::Aborted,
        _ => Status::Other,
    }
}

fn test_case(test: &CircleciTest) -> TestCase {
    let outcome = || TestOutcome {
        message: test.message.clone(),
        kind: None,
        text: String::new(),
    };
    let mut case = TestCase {
        name: test.name.clone(),
        classname: Some(test.classname.clone()).filter(|c| !c.is_empty()),
        time: test.run_time,
        ..TestCase::default()
    };
    match test.result.as_str() {
        "failure" | "failed" => case.failure.push(outcome()),
        "error" => case.error.push(outcome()),
        "skipped" => case.skipped.push(outcome()),
        _ => {}
    }
    case
}

/// One flat suite per job; jobs without tests contribute nothing.
pub fn test_suites_from_jobs(workflow_name: &str, jobs: &[CircleciJobTests]) -> Option<TestSuites> {
    let testsuite: Vec<TestSuite> = jobs
        .iter()
        .filter(|job| !job.tests.is_empty())
        .map(|job| {
            let testcase: Vec<TestCase> = job.tests.iter().map(test_case).collect();
            let time: f64 = job.tests.iter().filter_map(|t| t.run_time).sum();
            TestSuite {
                name: job.job_name.clone(),
                time: Some(time),
                testcase,
                ..TestSuite::default()
            }
        })
        .collect();
    if testsuite.is_empty() {
        return None;
    }
    Some(TestSuites {
        name: Some(workflow_name.to_string()),
        time: Some(testsuite.iter().filter_map(|s| s.time).sum()),
        testsuite,
        ..TestSuites::default()
    })
}

pub(crate) fn test_reports(workflow: &WorkflowReport, jobs: &[CircleciJobTests]) -> Vec<TestReport> {
    test_suites_from_jobs(&workflow.workflow_name, jobs)
        .map(|suites| vec![TestReport::new(workflow, convert_to_report_test_suites(suites))])
        .unwrap_or_default()
}
