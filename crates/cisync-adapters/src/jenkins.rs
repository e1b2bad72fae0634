use chrono::{DateTime, Duration, Utc};
use cisync_core::{
    diff_sec, round_sec, sum_sec, Artifact, CiService, JobParameter, JobReport, Status, StepReport,
    TestReport, WorkflowParams, WorkflowReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{junit_test_reports, millis_to_datetime, settled_runs, Analyzer, RunSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JenkinsParameter {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsCause {
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JenkinsBranch {
    #[serde(rename = "SHA1", default)]
    pub sha1: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JenkinsRevision {
    #[serde(rename = "SHA1", default)]
    pub sha1: String,
    #[serde(default)]
    pub branch: Vec<JenkinsBranch>,
}

/// Build actions are heterogeneous; each kind fills a different subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsAction {
    #[serde(rename = "_class", default)]
    pub class: Option<String>,
    #[serde(default)]
    pub parameters: Vec<JenkinsParameter>,
    #[serde(default)]
    pub causes: Vec<JenkinsCause>,
    #[serde(default)]
    pub last_built_revision: Option<JenkinsRevision>,
    #[serde(default)]
    pub queuing_duration_millis: Option<i64>,
}

/// Entry of `GET /job/{name}/api/json?tree=builds[...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JenkinsBuild {
    pub number: u64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub building: bool,
    /// Scheduled time, epoch millis.
    pub timestamp: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub actions: Vec<JenkinsAction>,
}

impl JenkinsBuild {
    fn is_in_flight(&self) -> bool {
        self.building || self.result.is_none()
    }
}

impl RunSummary for JenkinsBuild {
    fn run_number(&self) -> u64 {
        self.number
    }

    fn run_key(&self) -> String {
        self.number.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsFlowNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_time_millis: i64,
    #[serde(default)]
    pub duration_millis: i64,
    #[serde(default)]
    pub parameter_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsStage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_time_millis: i64,
    #[serde(default)]
    pub duration_millis: i64,
    #[serde(default)]
    pub stage_flow_nodes: Vec<JenkinsFlowNode>,
}

/// Pipeline description (`wfapi/describe`); freestyle jobs have no stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsRunDetail {
    #[serde(default)]
    pub start_time_millis: Option<i64>,
    #[serde(default)]
    pub end_time_millis: Option<i64>,
    #[serde(default)]
    pub queue_duration_millis: Option<i64>,
    #[serde(default)]
    pub stages: Vec<JenkinsStage>,
}

pub fn select_runs(builds: Vec<JenkinsBuild>, last_run: Option<u64>) -> Vec<JenkinsBuild> {
    settled_runs(builds, last_run, |b| b.number, JenkinsBuild::is_in_flight)
}

pub fn normalize_status(result: &str) -> Status {
    match result {
        "SUCCESS" => Status::Success,
        "FAILURE" | "FAILED" | "UNSTABLE" => Status::Failure,
        "ABORTED" => Status::Aborted,
        _ => Status::Other,
    }
}

fn parameter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn window(start_millis: i64, duration_millis: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    let started_at = millis_to_datetime(start_millis);
    (started_at, started_at + Duration::milliseconds(duration_millis.max(0)))
}

/// Workflow id is the job name; Jenkins jobs are not tied to one repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct JenkinsAnalyzer;

impl JenkinsAnalyzer {
    fn stage_job(&self, params: &WorkflowParams, build: &JenkinsBuild, stage: &JenkinsStage) -> JobReport {
        let (started_at, completed_at) = window(stage.start_time_millis, stage.duration_millis);
        let steps: Vec<StepReport> = stage
            .stage_flow_nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let (step_start, step_end) = window(node.start_time_millis, node.duration_millis);
                StepReport {
                    name: node
                        .parameter_description
                        .clone()
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| node.name.clone()),
                    status: normalize_status(&node.status),
                    number: index as u64 + 1,
                    started_at: step_start,
                    completed_at: step_end,
                    step_duration_sec: diff_sec(step_start, step_end),
                }
            })
            .collect();
        JobReport {
            workflow_run_id: params.workflow_run_id.clone(),
            build_number: Some(build.number),
            job_id: stage.id.clone(),
            job_name: stage.name.clone(),
            status: normalize_status(&stage.status),
            started_at,
            completed_at,
            job_duration_sec: diff_sec(started_at, completed_at),
            sum_steps_duration_sec: sum_sec(steps.iter().map(|s| s.step_duration_sec)),
            steps,
            url: build.url.clone(),
            executor_class: String::new(),
            executor_type: String::new(),
            executor_name: String::new(),
        }
    }
}

impl Analyzer for JenkinsAnalyzer {
    type Summary = JenkinsBuild;
    type Run = JenkinsBuild;
    type Detail = JenkinsRunDetail;

    fn service(&self) -> CiService {
        CiService::Jenkins
    }

    fn select_runs(&self, summaries: Vec<JenkinsBuild>, last_run: Option<u64>) -> Vec<JenkinsBuild> {
        select_runs(summaries, last_run)
    }

    fn create_workflow_params(&self, _repository: &str, workflow_name: &str, build_number: u64) -> WorkflowParams {
        WorkflowParams::from_workflow_id(workflow_name.to_string(), workflow_name, build_number)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        build: &JenkinsBuild,
        detail: &JenkinsRunDetail,
    ) -> Vec<WorkflowReport> {
        let params = self.create_workflow_params("", entity, build.number);
        let created_at = millis_to_datetime(build.timestamp);
        let started_at = detail
            .start_time_millis
            .filter(|ms| *ms > 0)
            .map(millis_to_datetime)
            .unwrap_or(created_at);
        let completed_at = detail
            .end_time_millis
            .filter(|ms| *ms > 0)
            .map(millis_to_datetime)
            .unwrap_or_else(|| started_at + Duration::milliseconds(build.duration.max(0)))
            .max(started_at);
        let status = normalize_status(build.result.as_deref().unwrap_or_default());

        let jobs: Vec<JobReport> = if detail.stages.is_empty() {
            vec![JobReport {
                workflow_run_id: params.workflow_run_id.clone(),
                build_number: Some(build.number),
                job_id: build.number.to_string(),
                job_name: entity.to_string(),
                status,
                started_at,
                completed_at,
                job_duration_sec: diff_sec(started_at, completed_at),
                sum_steps_duration_sec: 0.0,
                steps: vec![],
                url: build.url.clone(),
                executor_class: String::new(),
                executor_type: String::new(),
                executor_name: String::new(),
            }]
        } else {
            detail
                .stages
                .iter()
                .map(|stage| self.stage_job(&params, build, stage))
                .collect()
        };

        let parameters: Vec<JobParameter> = build
            .actions
            .iter()
            .flat_map(|a| a.parameters.iter())
            .map(|p| JobParameter {
                name: p.name.clone(),
                value: parameter_value(&p.value),
            })
            .collect();
        let cause = build.actions.iter().flat_map(|a| a.causes.iter()).next();
        let revision = build
            .actions
            .iter()
            .find_map(|a| a.last_built_revision.as_ref());
        let queued_millis = build
            .actions
            .iter()
            .find_map(|a| a.queuing_duration_millis)
            .or(detail.queue_duration_millis)
            .unwrap_or(0);

        vec![WorkflowReport {
            service: CiService::Jenkins,
            workflow_id: params.workflow_id,
            workflow_run_id: params.workflow_run_id,
            build_number: params.build_number,
            workflow_name: params.workflow_name,
            created_at,
            trigger: cause.map(|c| c.short_description.clone()).unwrap_or_default(),
            status,
            repository: String::new(),
            head_sha: revision.map(|r| r.sha1.clone()).unwrap_or_default(),
            branch: revision
                .and_then(|r| r.branch.first())
                .map(|b| b.name.trim_start_matches("refs/remotes/").to_string())
                .unwrap_or_default(),
            tag: String::new(),
            started_at,
            completed_at,
            workflow_duration_sec: diff_sec(started_at, completed_at),
            sum_jobs_duration_sec: sum_sec(jobs.iter().map(|j| j.job_duration_sec)),
            jobs,
            success_count: status.success_count(),
            parameters,
            queued_duration_sec: round_sec(queued_millis.max(0) as f64 / 1000.0),
            commit_message: String::new(),
            actor: cause.and_then(|c| c.user_id.clone()).unwrap_or_default(),
            url: build.url.clone(),
        }]
    }

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        _detail: &JenkinsRunDetail,
        artifacts: &[Artifact],
    ) -> Vec<TestReport> {
        junit_test_reports(workflow, artifacts)
    }
}
