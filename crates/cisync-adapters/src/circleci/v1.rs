//! CircleCI API v1.1: builds are listed individually and grouped into
//! workflow runs by `workflows.workflow_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cisync_core::{
    diff_sec, job_time_bounds, status_from_jobs, sum_sec, Artifact, CiService, JobReport,
    StepReport, TestReport, WorkflowReport,
};
use serde::{Deserialize, Serialize};

use super::{normalize_status, test_reports, CircleciJobTests};
use crate::{settled_runs, Analyzer, MetaVersionPolicy, RunSummary};

pub const META_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciWorkflowRef {
    pub workflow_id: String,
    pub workflow_name: String,
    pub job_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciUser {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciAction {
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
pub struct CircleciStep {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<CircleciAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciResourceClass {
    #[serde(default)]
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciPicard {
    #[serde(default)]
    pub resource_class: Option<CircleciResourceClass>,
    #[serde(default)]
    pub executor: Option<String>,
}

/// Build as returned by the recent-builds and single-build endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciBuild {
    pub build_num: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub reponame: String,
    pub lifecycle: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub workflows: Option<CircleciWorkflowRef>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub why: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub vcs_tag: Option<String>,
    #[serde(default)]
    pub vcs_revision: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub user: Option<CircleciUser>,
    #[serde(default)]
    pub build_url: String,
    #[serde(default)]
    pub picard: Option<CircleciPicard>,
    #[serde(default)]
    pub steps: Vec<CircleciStep>,
}

impl CircleciBuild {
    fn is_finished(&self) -> bool {
        self.lifecycle == "finished"
    }

    fn is_not_run(&self) -> bool {
        matches!(self.lifecycle.as_str(), "not_run" | "not_running")
    }
}

/// Builds of one workflow execution, keyed by their highest build number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleciWorkflowRun {
    pub workflow_id: String,
    pub workflow_name: String,
    pub last_build_num: u64,
    pub build_nums: Vec<u64>,
    pub finished: bool,
}

impl RunSummary for CircleciWorkflowRun {
    fn run_number(&self) -> u64 {
        self.last_build_num
    }

    fn run_key(&self) -> String {
        self.workflow_id.clone()
    }
}

/// Full builds (with steps) of a workflow run and their test metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircleciWorkflowDetail {
    #[serde(default)]
    pub builds: Vec<CircleciBuild>,
    #[serde(default)]
    pub tests: Vec<CircleciJobTests>,
}

/// Groups builds by workflow and applies the shared selection rule on the
/// groups' highest build numbers.
pub fn select_runs(builds: Vec<CircleciBuild>, last_run: Option<u64>) -> Vec<CircleciWorkflowRun> {
    let mut groups: BTreeMap<String, CircleciWorkflowRun> = BTreeMap::new();
    for build in builds.into_iter().filter(|b| !b.is_not_run()) {
        let Some(workflow) = build.workflows.as_ref() else {
            continue;
        };
        let group = groups
            .entry(workflow.workflow_id.clone())
            .or_insert_with(|| CircleciWorkflowRun {
                workflow_id: workflow.workflow_id.clone(),
                workflow_name: workflow.workflow_name.clone(),
                last_build_num: build.build_num,
                build_nums: vec![],
                finished: true,
            });
        group.last_build_num = group.last_build_num.max(build.build_num);
        group.build_nums.push(build.build_num);
        group.finished &= build.is_finished();
    }
    let runs = groups
        .into_values()
        .map(|mut run| {
            run.build_nums.sort_unstable();
            run
        })
        .collect();
    settled_runs(runs, last_run, |r| r.last_build_num, |r| !r.finished)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CircleciV1Analyzer;

fn step_report(step: &CircleciStep, fallback: DateTime<Utc>) -> Option<StepReport> {
    let action = step.actions.first()?;
    let started_at = action.start_time.unwrap_or(fallback);
    let completed_at = action.end_time.unwrap_or(started_at).max(started_at);
    Some(StepReport {
        name: step.name.clone(),
        status: normalize_status(&action.status),
        number: action.step,
        started_at,
        completed_at,
        step_duration_sec: diff_sec(started_at, completed_at),
    })
}

fn job_report(workflow_run_id: &str, build: &CircleciBuild, fallback: DateTime<Utc>) -> JobReport {
    let started_at = build.start_time.or(build.queued_at).unwrap_or(fallback);
    let completed_at = build.stop_time.unwrap_or(started_at).max(started_at);
    let steps: Vec<StepReport> = build
        .steps
        .iter()
        .filter_map(|step| step_report(step, started_at))
        .collect();
    let picard = build.picard.as_ref();
    JobReport {
        workflow_run_id: workflow_run_id.to_string(),
        build_number: Some(build.build_num),
        job_id: build.build_num.to_string(),
        job_name: build
            .workflows
            .as_ref()
            .map(|w| w.job_name.clone())
            .unwrap_or_default(),
        status: normalize_status(&build.status),
        started_at,
        completed_at,
        job_duration_sec: diff_sec(started_at, completed_at),
        sum_steps_duration_sec: sum_sec(steps.iter().map(|s| s.step_duration_sec)),
        steps,
        url: build.build_url.clone(),
        executor_class: picard
            .and_then(|p| p.resource_class.as_ref())
            .map(|r| r.class.clone())
            .unwrap_or_default(),
        executor_type: picard.and_then(|p| p.executor.clone()).unwrap_or_default(),
        executor_name: String::new(),
    }
}

impl Analyzer for CircleciV1Analyzer {
    type Summary = CircleciBuild;
    type Run = CircleciWorkflowRun;
    type Detail = CircleciWorkflowDetail;

    fn service(&self) -> CiService {
        CiService::Circleci
    }

    fn meta_version(&self) -> Option<MetaVersionPolicy> {
        Some(MetaVersionPolicy {
            version: META_VERSION,
            reset_on_migrate: false,
        })
    }

    fn select_runs(&self, summaries: Vec<CircleciBuild>, last_run: Option<u64>) -> Vec<CircleciWorkflowRun> {
        select_runs(summaries, last_run)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        run: &CircleciWorkflowRun,
        detail: &CircleciWorkflowDetail,
    ) -> Vec<WorkflowReport> {
        let mut builds: Vec<&CircleciBuild> = detail.builds.iter().collect();
        builds.sort_by_key(|b| b.build_num);
        let params = self.create_workflow_params(entity, &run.workflow_name, run.last_build_num);

        let created_at = builds
            .iter()
            .filter_map(|b| b.queued_at.or(b.start_time))
            .min()
            .unwrap_or_default();
        let jobs: Vec<JobReport> = builds
            .iter()
            .map(|build| job_report(&params.workflow_run_id, build, created_at))
            .collect();
        let (started_at, completed_at) = job_time_bounds(&jobs, created_at);
        let status = status_from_jobs(jobs.iter().map(|j| j.status));
        let first = builds.first().copied();

        vec![WorkflowReport {
            service: CiService::Circleci,
            workflow_id: params.workflow_id,
            workflow_run_id: params.workflow_run_id,
            build_number: params.build_number,
            workflow_name: params.workflow_name,
            created_at,
            trigger: first.and_then(|b| b.why.clone()).unwrap_or_default(),
            status,
            repository: entity.to_string(),
            head_sha: first.and_then(|b| b.vcs_revision.clone()).unwrap_or_default(),
            branch: first.and_then(|b| b.branch.clone()).unwrap_or_default(),
            tag: first.and_then(|b| b.vcs_tag.clone()).unwrap_or_default(),
            started_at,
            completed_at,
            workflow_duration_sec: diff_sec(started_at, completed_at),
            sum_jobs_duration_sec: sum_sec(jobs.iter().map(|j| j.job_duration_sec)),
            jobs,
            success_count: status.success_count(),
            parameters: vec![],
            queued_duration_sec: diff_sec(created_at, started_at),
            commit_message: first.and_then(|b| b.subject.clone()).unwrap_or_default(),
            actor: first
                .and_then(|b| b.user.as_ref())
                .map(|u| u.login.clone())
                .unwrap_or_default(),
            url: format!("https://app.circleci.com/pipelines/workflows/{}", run.workflow_id),
        }]
    }

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        detail: &CircleciWorkflowDetail,
        _artifacts: &[Artifact],
    ) -> Vec<TestReport> {
        test_reports(workflow, &detail.tests)
    }
}
