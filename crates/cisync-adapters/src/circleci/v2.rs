//! CircleCI API v2: pipelines carry one or more workflows; the pipeline
//! number is the watermark unit.

use chrono::{DateTime, Utc};
use cisync_core::{
    diff_sec, sum_sec, Artifact, CiService, JobReport, StepReport, TestReport, WorkflowReport,
};
use serde::{Deserialize, Serialize};

use super::{normalize_status, test_reports, CircleciJobTests};
use crate::{settled_runs, Analyzer, MetaVersionPolicy, RunSummary};

/// Watermarks written before v2 counted build numbers, not pipeline numbers.
pub const META_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciActor {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciTrigger {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub actor: Option<CircleciActor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciCommit {
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircleciVcs {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub commit: Option<CircleciCommit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciWorkflow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl CircleciWorkflow {
    fn is_in_flight(&self) -> bool {
        matches!(self.status.as_str(), "running" | "on_hold" | "failing")
    }
}

/// Pipeline with its workflows attached by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciPipeline {
    pub id: String,
    pub number: u64,
    #[serde(default)]
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub trigger: CircleciTrigger,
    #[serde(default)]
    pub vcs: Option<CircleciVcs>,
    #[serde(default)]
    pub workflows: Vec<CircleciWorkflow>,
}

impl RunSummary for CircleciPipeline {
    fn run_number(&self) -> u64 {
        self.number
    }

    fn run_key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciExecutor {
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciJobStep {
    pub name: String,
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciJob {
    /// Approval jobs have no number and are not reported.
    #[serde(default)]
    pub job_number: Option<u64>,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub executor: Option<CircleciExecutor>,
    #[serde(default)]
    pub steps: Vec<CircleciJobStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciWorkflowJobs {
    pub workflow_id: String,
    #[serde(default)]
    pub jobs: Vec<CircleciJob>,
    #[serde(default)]
    pub tests: Vec<CircleciJobTests>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircleciPipelineDetail {
    #[serde(default)]
    pub workflows: Vec<CircleciWorkflowJobs>,
}

impl CircleciPipelineDetail {
    fn workflow(&self, workflow_id: &str) -> Option<&CircleciWorkflowJobs> {
        self.workflows.iter().find(|w| w.workflow_id == workflow_id)
    }
}

/// Drops `not_run` workflows (and pipelines left without any), then applies
/// the shared selection rule with any running workflow as the in-flight mark.
pub fn select_runs(pipelines: Vec<CircleciPipeline>, last_run: Option<u64>) -> Vec<CircleciPipeline> {
    let pipelines = pipelines
        .into_iter()
        .filter_map(|mut pipeline| {
            pipeline.workflows.retain(|w| w.status != "not_run");
            (!pipeline.workflows.is_empty()).then_some(pipeline)
        })
        .collect();
    settled_runs(
        pipelines,
        last_run,
        |p| p.number,
        |p| p.workflows.iter().any(CircleciWorkflow::is_in_flight),
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircleciV2Analyzer;

fn job_report(workflow_run_id: &str, job: &CircleciJob, job_number: u64, fallback: DateTime<Utc>) -> JobReport {
    let started_at = job.started_at.unwrap_or(fallback);
    let completed_at = job.stopped_at.unwrap_or(started_at).max(started_at);
    let steps: Vec<StepReport> = job
        .steps
        .iter()
        .map(|step| {
            let step_start = step.start_time.unwrap_or(started_at);
            let step_end = step.end_time.unwrap_or(step_start).max(step_start);
            StepReport {
                name: step.name.clone(),
                status: normalize_status(&step.status),
                number: step.step,
                started_at: step_start,
                completed_at: step_end,
                step_duration_sec: diff_sec(step_start, step_end),
            }
        })
        .collect();
    let executor = job.executor.as_ref();
    JobReport {
        workflow_run_id: workflow_run_id.to_string(),
        build_number: Some(job_number),
        job_id: job_number.to_string(),
        job_name: job.name.clone(),
        status: normalize_status(&job.status),
        started_at,
        completed_at,
        job_duration_sec: diff_sec(started_at, completed_at),
        sum_steps_duration_sec: sum_sec(steps.iter().map(|s| s.step_duration_sec)),
        steps,
        url: job.web_url.clone().unwrap_or_default(),
        executor_class: executor.and_then(|e| e.resource_class.clone()).unwrap_or_default(),
        executor_type: executor.and_then(|e| e.kind.clone()).unwrap_or_default(),
        executor_name: String::new(),
    }
}

impl Analyzer for CircleciV2Analyzer {
    type Summary = CircleciPipeline;
    type Run = CircleciPipeline;
    type Detail = CircleciPipelineDetail;

    fn service(&self) -> CiService {
        CiService::Circleci
    }

    fn meta_version(&self) -> Option<MetaVersionPolicy> {
        Some(MetaVersionPolicy {
            version: META_VERSION,
            reset_on_migrate: true,
        })
    }

    fn select_runs(&self, summaries: Vec<CircleciPipeline>, last_run: Option<u64>) -> Vec<CircleciPipeline> {
        select_runs(summaries, last_run)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        pipeline: &CircleciPipeline,
        detail: &CircleciPipelineDetail,
    ) -> Vec<WorkflowReport> {
        let vcs = pipeline.vcs.clone().unwrap_or_default();
        pipeline
            .workflows
            .iter()
            .filter(|w| w.status != "not_run")
            .map(|workflow| {
                let params = self.create_workflow_params(entity, &workflow.name, pipeline.number);
                let jobs: Vec<JobReport> = detail
                    .workflow(&workflow.id)
                    .map(|w| w.jobs.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|job| {
                        let number = job.job_number?;
                        Some(job_report(&params.workflow_run_id, job, number, workflow.created_at))
                    })
                    .collect();
                let started_at = jobs
                    .iter()
                    .map(|j| j.started_at)
                    .min()
                    .unwrap_or(workflow.created_at);
                let completed_at = workflow
                    .stopped_at
                    .or_else(|| jobs.iter().map(|j| j.completed_at).max())
                    .unwrap_or(started_at)
                    .max(started_at);
                let status = normalize_status(&workflow.status);

                WorkflowReport {
                    service: CiService::Circleci,
                    workflow_id: params.workflow_id,
                    workflow_run_id: params.workflow_run_id,
                    build_number: params.build_number,
                    workflow_name: params.workflow_name,
                    created_at: workflow.created_at,
                    trigger: pipeline.trigger.kind.clone(),
                    status,
                    repository: entity.to_string(),
                    head_sha: vcs.revision.clone().unwrap_or_default(),
                    branch: vcs.branch.clone().unwrap_or_default(),
                    tag: vcs.tag.clone().unwrap_or_default(),
                    started_at,
                    completed_at,
                    workflow_duration_sec: diff_sec(started_at, completed_at),
                    sum_jobs_duration_sec: sum_sec(jobs.iter().map(|j| j.job_duration_sec)),
                    jobs,
                    success_count: status.success_count(),
                    parameters: vec![],
                    queued_duration_sec: diff_sec(workflow.created_at, started_at),
                    commit_message: vcs
                        .commit
                        .as_ref()
                        .and_then(|c| c.subject.clone())
                        .unwrap_or_default(),
                    actor: pipeline
                        .trigger
                        .actor
                        .as_ref()
                        .map(|a| a.login.clone())
                        .unwrap_or_default(),
                    url: format!("https://app.circleci.com/pipelines/workflows/{}", workflow.id),
                }
            })
            .collect()
    }

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        detail: &CircleciPipelineDetail,
        _artifacts: &[Artifact],
    ) -> Vec<TestReport> {
        // Job numbers are unique per project, so they identify the workflow.
        let job_numbers: Vec<u64> = workflow.jobs.iter().filter_map(|j| j.build_number).collect();
        let tests = detail
            .workflows
            .iter()
            .find(|w| {
                w.jobs
                    .iter()
                    .any(|j| j.job_number.is_some_and(|n| job_numbers.contains(&n)))
            })
            .map(|w| w.tests.as_slice())
            .unwrap_or_default();
        test_reports(workflow, tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cisync_core::Status;
    use serde_json::json;

    fn pipeline(number: u64, workflows: &[(&str, &str)]) -> CircleciPipeline {
        let workflows: Vec<serde_json::Value> = workflows
            .iter()
            .map(|(name, status)| {
                json!({
                    "id": format!("{number}-{name}"),
                    "name": name,
                    "status": status,
                    "created_at": "2024-03-01T10:00:00Z",
                    "stopped_at": "2024-03-01T10:05:00Z"
                })
            })
            .collect();
        serde_json::from_value(json!({
            "id": format!("pipe-{number}"),
            "number": number,
            "state": "created",
            "created_at": "2024-03-01T09:59:50Z",
            "trigger": { "type": "webhook", "actor": { "login": "dev" } },
            "vcs": { "branch": "main", "revision": "abc", "commit": { "subject": "ship it" } },
            "workflows": workflows
        }))
        .unwrap()
    }

    fn numbers(runs: &[CircleciPipeline]) -> Vec<u64> {
        runs.iter().map(|p| p.number).collect()
    }

    #[test]
    fn not_run_workflows_are_excluded() {
        let runs = select_runs(
            vec![
                pipeline(1, &[("build", "success"), ("deploy", "not_run")]),
                pipeline(2, &[("build", "not_run")]),
                pipeline(3, &[("build", "failed")]),
            ],
            Some(0),
        );
        assert_eq!(numbers(&runs), vec![1, 3]);
        assert_eq!(runs[0].workflows.len(), 1);
    }

    #[test]
    fn on_hold_workflow_blocks_newer_pipelines() {
        let runs = select_runs(
            vec![
                pipeline(4, &[("build", "success")]),
                pipeline(5, &[("build", "success"), ("release", "on_hold")]),
                pipeline(6, &[("build", "success")]),
            ],
            Some(3),
        );
        assert_eq!(numbers(&runs), vec![4]);
    }

    #[test]
    fn one_report_per_workflow_keyed_by_pipeline_number() {
        let p = pipeline(9, &[("build", "success"), ("lint", "failed")]);
        let detail: CircleciPipelineDetail = serde_json::from_value(json!({
            "workflows": [
                {
                    "workflow_id": "9-build",
                    "jobs": [
                        { "job_number": 101, "name": "compile", "status": "success",
                          "started_at": "2024-03-01T10:00:30Z", "stopped_at": "2024-03-01T10:02:30Z",
                          "executor": { "resource_class": "medium", "type": "docker" } },
                        { "name": "approve", "status": "success" }
                    ],
                    "tests": [
                        { "job_name": "compile", "tests": [
                            { "classname": "a", "name": "t1", "result": "success", "run_time": 0.2 }
                        ] }
                    ]
                },
                { "workflow_id": "9-lint", "jobs": [
                    { "job_number": 102, "name": "eslint", "status": "failed",
                      "started_at": "2024-03-01T10:00:10Z", "stopped_at": "2024-03-01T10:00:40Z" }
                ] }
            ]
        }))
        .unwrap();

        let reports = CircleciV2Analyzer.create_workflow_reports("org/repo", &p, &detail);
        assert_eq!(reports.len(), 2);
        let build = &reports[0];
        assert_eq!(build.workflow_run_id, "org/repo-build-9");
        assert_eq!(build.build_number, 9);
        assert_eq!(build.jobs.len(), 1);
        assert_eq!(build.jobs[0].executor_type, "docker");
        assert_eq!(build.queued_duration_sec, 30.0);
        assert_eq!(build.workflow_duration_sec, 270.0);
        assert_eq!(build.commit_message, "ship it");
        assert_eq!(reports[1].status, Status::Failure);

        let tests = CircleciV2Analyzer.create_test_reports(build, &detail, &[]);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].test_suites.testsuite[0].name, "compile");
        assert!(CircleciV2Analyzer
            .create_test_reports(&reports[1], &detail, &[])
            .is_empty());
    }
}
