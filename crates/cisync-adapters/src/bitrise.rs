use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use cisync_core::{
    diff_sec, round_sec, sum_sec, Artifact, CiService, JobReport, Status, StepReport, TestReport,
    WorkflowReport,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{junit_test_reports, settled_runs, Analyzer, RunSummary};

/// One row of the step summary table printed at the end of a build log,
/// e.g. `| ✓ | git-clone@8 (exit code: 0) | 5.41 sec |`.
static STEP_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|\s*(✓|x|!|-)\s*\|\s*(.+?)\s*\|\s*[<>]?\s*([0-9]+(?:\.[0-9]+)?)\s*(sec|min|hour)s?\s*\|\s*$")
        .expect("valid regex")
});

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(exit code: -?[0-9]+\)$").expect("valid regex"));

/// Entry of `GET /apps/{app-slug}/builds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitriseBuild {
    pub slug: String,
    pub build_number: u64,
    /// 0 running, 1 success, 2 failed, 3 aborted with failure, 4 aborted with success.
    pub status: u8,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub started_on_worker_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub triggered_workflow: String,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub machine_type_id: Option<String>,
    #[serde(default)]
    pub stack_identifier: Option<String>,
}

impl RunSummary for BitriseBuild {
    fn run_number(&self) -> u64 {
        self.build_number
    }

    fn run_key(&self) -> String {
        self.slug.clone()
    }
}

/// Full build log; steps are recovered from its summary table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitriseBuildDetail {
    #[serde(default)]
    pub log: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitriseLogStep {
    pub name: String,
    pub status: Status,
    pub duration_sec: f64,
}

pub fn select_runs(builds: Vec<BitriseBuild>, last_run: Option<u64>) -> Vec<BitriseBuild> {
    settled_runs(builds, last_run, |b| b.build_number, |b| b.status == 0)
}

pub fn normalize_status(status: u8) -> Status {
    match status {
        1 => Status::Success,
        2 => Status::Failure,
        3 | 4 => Status::Aborted,
        _ => Status::Other,
    }
}

fn mark_status(mark: &str) -> Status {
    match mark {
        "✓" => Status::Success,
        "x" | "!" => Status::Failure,
        _ => Status::Other,
    }
}

pub fn parse_log_steps(log: &str) -> Vec<BitriseLogStep> {
    log.lines()
        .filter_map(|line| {
            let caps = STEP_ROW_RE.captures(line.trim())?;
            let value: f64 = caps[3].parse().ok()?;
            let factor = match &caps[4] {
                "min" => 60.0,
                "hour" => 3600.0,
                _ => 1.0,
            };
            Some(BitriseLogStep {
                name: EXIT_CODE_RE.replace(&caps[2], "").into_owned(),
                status: mark_status(&caps[1]),
                duration_sec: round_sec(value * factor),
            })
        })
        .collect()
}

/// Lays log steps out back to back from `started_at`.
fn step_reports(steps: &[BitriseLogStep], started_at: DateTime<Utc>) -> Vec<StepReport> {
    let mut cursor = started_at;
    steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let step_start = cursor;
            let step_end = step_start + Duration::milliseconds((step.duration_sec * 1000.0) as i64);
            cursor = step_end;
            StepReport {
                name: step.name.clone(),
                status: step.status,
                number: index as u64 + 1,
                started_at: step_start,
                completed_at: step_end,
                step_duration_sec: step.duration_sec,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BitriseAnalyzer;

impl Analyzer for BitriseAnalyzer {
    type Summary = BitriseBuild;
    type Run = BitriseBuild;
    type Detail = BitriseBuildDetail;

    fn service(&self) -> CiService {
        CiService::Bitrise
    }

    fn select_runs(&self, summaries: Vec<BitriseBuild>, last_run: Option<u64>) -> Vec<BitriseBuild> {
        select_runs(summaries, last_run)
    }

    fn create_workflow_reports(
        &self,
        entity: &str,
        build: &BitriseBuild,
        detail: &BitriseBuildDetail,
    ) -> Vec<WorkflowReport> {
        let params = self.create_workflow_params(entity, &build.triggered_workflow, build.build_number);
        let started_at = build.started_on_worker_at.unwrap_or(build.triggered_at);
        let completed_at = build.finished_at.unwrap_or(started_at).max(started_at);
        let status = normalize_status(build.status);
        let steps = step_reports(&parse_log_steps(&detail.log), started_at);
        let url = format!("https://app.bitrise.io/build/{}", build.slug);

        let job = JobReport {
            workflow_run_id: params.workflow_run_id.clone(),
            build_number: Some(build.build_number),
            job_id: build.slug.clone(),
            job_name: build.triggered_workflow.clone(),
            status,
            started_at,
            completed_at,
            job_duration_sec: diff_sec(started_at, completed_at),
            sum_steps_duration_sec: sum_sec(steps.iter().map(|s| s.step_duration_sec)),
            steps,
            url: url.clone(),
            executor_class: build.machine_type_id.clone().unwrap_or_default(),
            executor_type: build.stack_identifier.clone().unwrap_or_default(),
            executor_name: String::new(),
        };

        vec![WorkflowReport {
            service: CiService::Bitrise,
            workflow_id: params.workflow_id,
            workflow_run_id: params.workflow_run_id,
            build_number: params.build_number,
            workflow_name: params.workflow_name,
            created_at: build.triggered_at,
            trigger: build.triggered_by.clone().unwrap_or_default(),
            status,
            repository: entity.to_string(),
            head_sha: build.commit_hash.clone().unwrap_or_default(),
            branch: build.branch.clone().unwrap_or_default(),
            tag: build.tag.clone().unwrap_or_default(),
            started_at,
            completed_at,
            workflow_duration_sec: diff_sec(started_at, completed_at),
            sum_jobs_duration_sec: job.job_duration_sec,
            jobs: vec![job],
            success_count: status.success_count(),
            parameters: vec![],
            queued_duration_sec: diff_sec(build.triggered_at, started_at),
            commit_message: build.commit_message.clone().unwrap_or_default(),
            actor: String::new(),
            url,
        }]
    }

    fn create_test_reports(
        &self,
        workflow: &WorkflowReport,
        _detail: &BitriseBuildDetail,
        artifacts: &[Artifact],
    ) -> Vec<TestReport> {
        junit_test_reports(workflow, artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOG: &str = "\
Running workflow: primary
+------------------------------------------------------------------------------+
|                               bitrise summary                                |
+---+---------------------------------------------------------------+----------+
|   | title                                                         | time (s) |
+---+---------------------------------------------------------------+----------+
| ✓ | activate-ssh-key@4                                            | 1.5 sec  |
+---+---------------------------------------------------------------+----------+
| ✓ | git-clone@8                                                   | 2.5 sec  |
+---+---------------------------------------------------------------+----------+
| x | script@1 (exit code: 1)                                       | 1.2 min  |
+---+---------------------------------------------------------------+----------+
| - | deploy-to-bitrise-io@2                                        | 0 sec    |
+---+---------------------------------------------------------------+----------+
| Total runtime: 1.3 min                                                       |
+------------------------------------------------------------------------------+
";

    fn build(number: u64, status: u8) -> BitriseBuild {
        serde_json::from_value(json!({
            "slug": format!("slug-{number}"),
            "build_number": number,
            "status": status,
            "triggered_at": "2024-03-01T10:00:00Z",
            "started_on_worker_at": "2024-03-01T10:00:20Z",
            "finished_at": "2024-03-01T10:02:00Z",
            "triggered_workflow": "primary",
            "triggered_by": "webhook",
            "branch": "develop",
            "commit_hash": "c0ffee",
            "machine_type_id": "standard"
        }))
        .unwrap()
    }

    #[test]
    fn running_build_blocks_later_builds() {
        let builds = vec![build(3, 2), build(4, 0), build(5, 1), build(2, 1)];
        let numbers: Vec<u64> = select_runs(builds, Some(1)).iter().map(|b| b.build_number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn parses_summary_table_rows_only() {
        let steps = parse_log_steps(LOG);
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].name, "activate-ssh-key@4");
        assert_eq!(steps[2].name, "script@1");
        assert_eq!(steps[2].status, Status::Failure);
        assert_eq!(steps[2].duration_sec, 72.0);
        assert_eq!(steps[3].status, Status::Other);
    }

    #[test]
    fn steps_are_laid_out_back_to_back() {
        let b = build(9, 2);
        let detail = BitriseBuildDetail { log: LOG.to_string() };
        let wf = &BitriseAnalyzer.create_workflow_reports("org/app", &b, &detail)[0];
        assert_eq!(wf.workflow_id, "org/app-primary");
        assert_eq!(wf.status, Status::Failure);
        assert_eq!(wf.queued_duration_sec, 20.0);
        assert_eq!(wf.workflow_duration_sec, 100.0);

        let steps = &wf.jobs[0].steps;
        assert_eq!(steps[1].started_at, steps[0].completed_at);
        assert_eq!(steps[2].started_at, b.started_on_worker_at.unwrap() + Duration::seconds(4));
        assert_eq!(wf.jobs[0].sum_steps_duration_sec, 76.0);
        assert_eq!(wf.jobs[0].executor_class, "standard");
    }

    #[test]
    fn aborted_statuses() {
        assert_eq!(normalize_status(3), Status::Aborted);
        assert_eq!(normalize_status(4), Status::Aborted);
        assert_eq!(normalize_status(0), Status::Other);
    }
}
