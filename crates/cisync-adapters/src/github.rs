use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cisync_core::{
    diff_sec, job_time_bounds, sum_sec, Artifact, CiService, JobReport, Status, StepReport,
    TestReport, WorkflowReport,
};
use serde::{Deserialize, Serialize};

use crate::{junit_test_reports, settled_runs, Analyzer, RunSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubActor {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubHeadCommit {
    #[serde(default)]
    pub message: String,
}

/// Entry of `GET /repos/{owner}/{repo}/actions/runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubRun {
    pub id: u64,
    pub run_number: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub head_sha: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub run_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub actor: Option<GithubActor>,
    #[serde(default)]
    pub head_commit: Option<GithubHeadCommit>,
}

impl GithubRun {
    fn is_in_flight(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("queued" | "in_progress" | "waiting" | "requested" | "pending")
        )
    }

    /// Display name, falling back to the workflow file name.
    pub fn workflow_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .map(|file| file.trim_end_matches(".yml").trim_end_matches(".yaml").to_string())
            .unwrap_or_else(|| self.id.to_string())
    }
}

impl RunSummary for GithubRun {
    fn run_number(&self) -> u64 {
        self.run_number
    }

    fn run_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubStep {
    pub name: String,
    pub number: u64,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubJob {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub runner_group_name: Option<String>,
    #[serde(default)]
    pub steps: Vec<GithubStep>,
}

/// Jobs of one run plus the repository's tag lookup (commit sha to tag name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GithubRunDetail {
    #[serde(default)]
    pub jobs: Vec<GithubJob>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub fn select_runs(runs: Vec<GithubRun>, last_run: Option<u64>) -> Vec<GithubRun> {
    settled_runs(runs, last_run, |r| r.run_number, GithubRun::is_in_flight)
}

pub fn normalize_status(conclusion: Option<&str>) -> Status {
    match conclusion {
        Some("success") => Status::Success,
        Some("failure" | "timed_out" | "startup_failure") => Status::Failure,
        Some("cancelled") => Status::Aborted,
        _ => Status::Other,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GithubAnalyzer;

impl GithubAnalyzer {
    fn job_report(&self, workflow_run_id: &str, job: &GithubJob) -> JobReport {
        let started_at = job.started_at;
        let completed_at = job.completed_at.unwrap_or(started_at).max(started_at);
        let steps: Vec<StepReport> = job
            .steps
            .iter()
            .map(|step| {
                let step_start = step.started_at.unwrap_or(started_at);
                let step_end = step.completed_at.unwrap_or(step_start).max(step_start);
                StepReport {
                    name: step.name.clone(),
                    status: normalize_status(step.conclusion.as_deref()),
                    number: step.number,
                    started_at: step_start,
                    completed_at: step_end,
                    step_duration_sec: diff_sec(step_start, step_end),
                }
            })
            .collect();

        JobReport {
            workflow_run_id: workflow_run_id.to_string(),
            build_number: None,
            job_id: job.id.to_string(),
            job_name: job.name.clone(),
            status: normalize_status(job.conclusion.as_deref()),
            started_at,
            completed_at,
            job_duration_sec: diff_sec(started_at, completed_at),
            sum_steps_duration_sec: sum_sec(steps.iter().map(|s| s.step_duration_sec)),
            steps,
            url: job.html_url.clone().unwrap_or_default(),
            executor_class: job.labels.join(","),
            executor_type: job.runner_group_name.clone().unwrap_or_default(),
            executor_name: job.runner_name.clone().unwrap_or_default(),
        }
    }
}

impl Analyzer for GithubAnalyzer {
    type Summary = GithubRun;
    type Run = GithubRun;
    type Detail = GithubRunDetail;

    fn service(&self) -> CiService {
        CiService::Github
    }

    /// `run_number` counts per workflow file.
    fn watermark_partition(&self, run: &GithubRun) -> Option<String> {
        run.path
            .clone()
            .filter(|path| !path.is_empty())
            .or_else(|| run.name.clone().filter(|name| !name.is_empty()))
    }

    fn select_runs(&self, summaries: Vec<GithubRun>, last_run: Option<u64>) -> Vec<GithubRun> {
        select_runs(summaries, last_run)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        run: &GithubRun,
        detail: &GithubRunDetail,
    ) -> Vec<WorkflowReport> {
        let workflow_name = run.workflow_name();
        let params = self.create_workflow_params(entity, &workflow_name, run.run_number);
        let jobs: Vec<JobReport> = detail
            .jobs
            .iter()
            .map(|job| self.job_report(&params.workflow_run_id, job))
            .collect();
        let fallback = run.run_started_at.unwrap_or(run.created_at);
        let (started_at, completed_at) = job_time_bounds(&jobs, fallback);
        let status = normalize_status(run.conclusion.as_deref());

        vec![WorkflowReport {
            service: CiService::Github,
            workflow_id: params.workflow_id,
            workflow_run_id: params.workflow_run_id,
            build_number: params.build_number,
            workflow_name: params.workflow_name,
            created_at: run.created_at,
            trigger: run.event.clone(),
            status,
            repository: entity.to_string(),
            head_sha: run.head_sha.clone(),
            branch: run.head_branch.clone().unwrap_or_default(),
            tag: detail.tags.get(&run.head_sha).cloned().unwrap_or_default(),
            started_at,
            completed_at,
            workflow_duration_sec: diff_sec(started_at, completed_at),
            sum_jobs_duration_sec: sum_sec(jobs.iter().map(|j| j.job_duration_sec)),
            jobs,
            success_count: status.success_count(),
            parameters: vec![],
            queued_duration_sec: diff_sec(run.created_at, started_at),
            commit_message: run
                .head_commit
                .as_ref()
                .map(|c| c.message.clone())
                .unwrap_or_default(),
            actor: run.actor.as_ref().map(|a| a.login.clone()).unwrap_or_default(),
            url: run.html_url.clone(),
        }]
    }

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        _detail: &GithubRunDetail,
        artifacts: &[Artifact],
    ) -> Vec<TestReport> {
        junit_test_reports(workflow, artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::at;
    use serde_json::json;

    fn run(number: u64, status: &str, conclusion: Option<&str>) -> GithubRun {
        serde_json::from_value(json!({
            "id": 1000 + number,
            "run_number": number,
            "name": "CI",
            "path": ".github/workflows/ci.yml",
            "status": status,
            "conclusion": conclusion,
            "event": "push",
            "head_branch": "main",
            "head_sha": format!("sha{number}"),
            "created_at": "2024-03-01T10:00:00Z",
            "html_url": format!("https://github.com/org/repo/actions/runs/{}", 1000 + number),
            "actor": { "login": "octocat" },
            "head_commit": { "message": "fix build" }
        }))
        .unwrap()
    }

    fn numbers(runs: &[GithubRun]) -> Vec<u64> {
        runs.iter().map(|r| r.run_number).collect()
    }

    #[test]
    fn queued_run_blocks_later_runs() {
        let runs = vec![
            run(12, "completed", Some("success")),
            run(10, "completed", Some("failure")),
            run(11, "queued", None),
            run(9, "completed", Some("success")),
        ];
        assert_eq!(numbers(&select_runs(runs, Some(8))), vec![9, 10]);
    }

    #[test]
    fn unknown_conclusions_become_other() {
        assert_eq!(normalize_status(Some("success")), Status::Success);
        assert_eq!(normalize_status(Some("timed_out")), Status::Failure);
        assert_eq!(normalize_status(Some("cancelled")), Status::Aborted);
        assert_eq!(normalize_status(Some("neutral")), Status::Other);
        assert_eq!(normalize_status(None), Status::Other);
    }

    #[test]
    fn runs_are_partitioned_by_workflow_file() {
        let ci = run(50, "completed", Some("success"));
        let mut deploy = run(3, "completed", Some("success"));
        deploy.path = Some(".github/workflows/deploy.yml".into());
        assert_eq!(
            GithubAnalyzer.watermark_partition(&ci).as_deref(),
            Some(".github/workflows/ci.yml")
        );
        assert_eq!(
            GithubAnalyzer.watermark_partition(&deploy).as_deref(),
            Some(".github/workflows/deploy.yml")
        );

        let mut unnamed = run(1, "completed", Some("success"));
        unnamed.path = None;
        unnamed.name = None;
        assert_eq!(GithubAnalyzer.watermark_partition(&unnamed), None);
    }

    #[test]
    fn workflow_name_falls_back_to_file_name() {
        let mut r = run(1, "completed", Some("success"));
        r.name = None;
        assert_eq!(r.workflow_name(), "ci");
    }

    #[test]
    fn builds_report_from_jobs_and_steps() {
        let r = run(42, "completed", Some("failure"));
        let detail: GithubRunDetail = serde_json::from_value(json!({
            "jobs": [
                {
                    "id": 7,
                    "name": "build",
                    "conclusion": "success",
                    "started_at": "2024-03-01T10:01:00Z",
                    "completed_at": "2024-03-01T10:03:00Z",
                    "labels": ["ubuntu-latest"],
                    "runner_name": "GitHub Actions 2",
                    "steps": [
                        { "name": "checkout", "number": 1, "conclusion": "success",
                          "started_at": "2024-03-01T10:01:00Z", "completed_at": "2024-03-01T10:01:30Z" },
                        { "name": "compile", "number": 2, "conclusion": "success",
                          "started_at": "2024-03-01T10:01:30Z", "completed_at": "2024-03-01T10:03:00Z" }
                    ]
                },
                {
                    "id": 8,
                    "name": "test",
                    "conclusion": "failure",
                    "started_at": "2024-03-01T10:03:00Z",
                    "completed_at": "2024-03-01T10:04:00Z"
                }
            ],
            "tags": { "sha42": "v1.2.0" }
        }))
        .unwrap();

        let reports = GithubAnalyzer.create_workflow_reports("org/repo", &r, &detail);
        assert_eq!(reports.len(), 1);
        let wf = &reports[0];
        assert_eq!(wf.workflow_id, "org/repo-CI");
        assert_eq!(wf.workflow_run_id, "org/repo-CI-42");
        assert_eq!(wf.status, Status::Failure);
        assert_eq!(wf.success_count, 0);
        assert_eq!(wf.tag, "v1.2.0");
        assert_eq!(wf.queued_duration_sec, 60.0);
        assert_eq!(wf.workflow_duration_sec, 180.0);
        assert_eq!(wf.sum_jobs_duration_sec, 180.0);
        assert_eq!(wf.jobs[0].sum_steps_duration_sec, 120.0);
        assert_eq!(wf.jobs[0].executor_class, "ubuntu-latest");
        assert_eq!(wf.jobs[1].workflow_run_id, wf.workflow_run_id);
        assert_eq!(wf.commit_message, "fix build");
        assert_eq!(wf.actor, "octocat");
    }

    #[test]
    fn missing_job_completion_does_not_go_negative() {
        let r = run(1, "completed", Some("cancelled"));
        let detail = GithubRunDetail {
            jobs: vec![GithubJob {
                id: 1,
                name: "build".into(),
                conclusion: Some("cancelled".into()),
                started_at: at(30),
                completed_at: Some(at(0)),
                html_url: None,
                labels: vec![],
                runner_name: None,
                runner_group_name: None,
                steps: vec![],
            }],
            tags: BTreeMap::new(),
        };
        let wf = &GithubAnalyzer.create_workflow_reports("org/repo", &r, &detail)[0];
        assert_eq!(wf.jobs[0].job_duration_sec, 0.0);
        assert_eq!(wf.status, Status::Aborted);
    }
}
