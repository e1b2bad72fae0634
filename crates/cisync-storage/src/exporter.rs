use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use cisync_core::{CiService, CustomReportCollection, TestReport, WorkflowReport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::write_atomic;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Sink for the reports collected in one provider cycle.
///
/// Calls may be repeated with a superset of earlier reports after a failed
/// cycle, so implementations must tolerate re-delivery.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export_workflow_reports(&self, reports: &[WorkflowReport]) -> Result<(), ExportError>;

    async fn export_test_reports(&self, reports: &[TestReport]) -> Result<(), ExportError>;

    async fn export_custom_reports(&self, reports: &CustomReportCollection) -> Result<(), ExportError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    JsonLines,
}

/// Writes timestamped JSON or JSON Lines files into `out_dir`.
#[derive(Debug, Clone)]
pub struct LocalExporter {
    service: CiService,
    out_dir: PathBuf,
    format: ExportFormat,
}

impl LocalExporter {
    pub fn new(service: CiService, out_dir: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            service,
            out_dir: out_dir.into(),
            format,
        }
    }

    fn file_path(&self, kind: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        self.out_dir
            .join(format!("{stamp}-{kind}-{}.json", self.service))
    }

    /// Custom report names become part of a file name; anything outside
    /// `[A-Za-z0-9._-]` is replaced so the file stays inside `out_dir`.
    fn custom_kind(name: &str) -> String {
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        format!("custom-{name}")
    }

    fn encode<T: Serialize>(&self, what: &'static str, items: &[T]) -> Result<Vec<u8>, ExportError> {
        let json_err = |source| ExportError::Json { what, source };
        match self.format {
            ExportFormat::Json => serde_json::to_vec_pretty(items).map_err(json_err),
            ExportFormat::JsonLines => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(serde_json::to_vec(item).map_err(json_err)?);
                    out.push(b'\n');
                }
                Ok(out)
            }
        }
    }

    async fn write<T: Serialize + Sync>(
        &self,
        kind: &str,
        what: &'static str,
        items: &[T],
    ) -> Result<(), ExportError> {
        if items.is_empty() {
            return Ok(());
        }
        let bytes = self.encode(what, items)?;
        let path = self.file_path(kind);
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| ExportError::Io {
                path: path.clone(),
                source,
            })?;
        info!(service = %self.service, path = %path.display(), count = items.len(), "exported {what}");
        Ok(())
    }
}

#[async_trait]
impl Exporter for LocalExporter {
    fn name(&self) -> &str {
        "local"
    }

    async fn export_workflow_reports(&self, reports: &[WorkflowReport]) -> Result<(), ExportError> {
        self.write("workflow", "workflow reports", reports).await
    }

    async fn export_test_reports(&self, reports: &[TestReport]) -> Result<(), ExportError> {
        self.write("test", "test reports", reports).await
    }

    async fn export_custom_reports(&self, reports: &CustomReportCollection) -> Result<(), ExportError> {
        for (name, items) in reports.iter() {
            self.write(&Self::custom_kind(name), "custom reports", items).await?;
        }
        Ok(())
    }
}

/// Fans every export out to all configured exporters.
///
/// Every exporter is attempted; the first failure is returned afterwards.
#[derive(Default)]
pub struct CompositeExporter {
    exporters: Vec<Box<dyn Exporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Box<dyn Exporter>>) -> Self {
        Self { exporters }
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

fn keep_first(first: &mut Option<ExportError>, exporter: &str, result: Result<(), ExportError>) {
    if let Err(err) = result {
        error!(exporter, "export failed: {err}");
        first.get_or_insert(err);
    }
}

#[async_trait]
impl Exporter for CompositeExporter {
    fn name(&self) -> &str {
        "composite"
    }

    async fn export_workflow_reports(&self, reports: &[WorkflowReport]) -> Result<(), ExportError> {
        let mut first = None;
        for exporter in &self.exporters {
            let result = exporter.export_workflow_reports(reports).await;
            keep_first(&mut first, exporter.name(), result);
        }
        first.map_or(Ok(()), Err)
    }

    async fn export_test_reports(&self, reports: &[TestReport]) -> Result<(), ExportError> {
        let mut first = None;
        for exporter in &self.exporters {
            let result = exporter.export_test_reports(reports).await;
            keep_first(&mut first, exporter.name(), result);
        }
        first.map_or(Ok(()), Err)
    }

    async fn export_custom_reports(&self, reports: &CustomReportCollection) -> Result<(), ExportError> {
        let mut first = None;
        for exporter in &self.exporters {
            let result = exporter.export_custom_reports(reports).await;
            keep_first(&mut first, exporter.name(), result);
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cisync_core::{CustomReport, Status};
    use tempfile::tempdir;

    fn workflow(build_number: u64) -> WorkflowReport {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().unwrap();
        WorkflowReport {
            service: CiService::Jenkins,
            workflow_id: "deploy".into(),
            workflow_run_id: format!("deploy-{build_number}"),
            build_number,
            workflow_name: "deploy".into(),
            created_at: at,
            trigger: "timer".into(),
            status: Status::Success,
            repository: String::new(),
            head_sha: String::new(),
            branch: String::new(),
            tag: String::new(),
            jobs: vec![],
            started_at: at,
            completed_at: at,
            workflow_duration_sec: 0.0,
            sum_jobs_duration_sec: 0.0,
            success_count: 1,
            parameters: vec![],
            queued_duration_sec: 0.0,
            commit_message: String::new(),
            actor: String::new(),
            url: String::new(),
        }
    }

    fn files_in(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn json_lines_writes_one_report_per_line() {
        let dir = tempdir().expect("tempdir");
        let exporter = LocalExporter::new(CiService::Jenkins, dir.path(), ExportFormat::JsonLines);
        exporter
            .export_workflow_reports(&[workflow(1), workflow(2)])
            .await
            .unwrap();

        let names = files_in(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("-workflow-jenkins.json"));
        let text = std::fs::read_to_string(dir.path().join(&names[0])).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["workflowRunId"], "deploy-2");
    }

    #[tokio::test]
    async fn empty_collections_write_nothing() {
        let dir = tempdir().expect("tempdir");
        let exporter = LocalExporter::new(CiService::Github, dir.path(), ExportFormat::Json);
        exporter.export_workflow_reports(&[]).await.unwrap();
        exporter.export_test_reports(&[]).await.unwrap();
        exporter
            .export_custom_reports(&CustomReportCollection::new())
            .await
            .unwrap();
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn custom_reports_get_one_file_per_name() {
        let dir = tempdir().expect("tempdir");
        let exporter = LocalExporter::new(CiService::Github, dir.path(), ExportFormat::Json);
        let wf = workflow(3);
        let mut collection = CustomReportCollection::new();
        collection.push("coverage", CustomReport::new(&wf, serde_json::Map::new()));
        collection.push("bundle_size", CustomReport::new(&wf, serde_json::Map::new()));

        let composite = CompositeExporter::new(vec![Box::new(exporter)]);
        composite.export_custom_reports(&collection).await.unwrap();

        let names = files_in(dir.path());
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with("-custom-coverage-github.json")));
        assert!(names.iter().any(|n| n.ends_with("-custom-bundle_size-github.json")));
    }

    #[tokio::test]
    async fn custom_report_named_like_a_builtin_keeps_both_files() {
        let dir = tempdir().expect("tempdir");
        let exporter = LocalExporter::new(CiService::Github, dir.path(), ExportFormat::Json);
        let wf = workflow(4);
        let mut collection = CustomReportCollection::new();
        collection.push("workflow", CustomReport::new(&wf, serde_json::Map::new()));
        collection.push("../escape", CustomReport::new(&wf, serde_json::Map::new()));

        exporter.export_workflow_reports(&[wf.clone()]).await.unwrap();
        exporter.export_custom_reports(&collection).await.unwrap();

        let names = files_in(dir.path());
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|n| n.ends_with("-workflow-github.json") && !n.contains("custom")));
        assert!(names.iter().any(|n| n.ends_with("-custom-workflow-github.json")));
        assert!(names.iter().any(|n| n.ends_with("-custom-.._escape-github.json")));
    }
}
