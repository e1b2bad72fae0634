//! Fixture-replay client: serves recorded provider responses from disk.
//!
//! Layout per entity (slashes in the entity name become `__`):
//!
//! ```text
//! {root}/{entity}/runs.json
//! {root}/{entity}/runs/{run-key}/detail.json
//! {root}/{entity}/runs/{run-key}/artifacts/**
//! ```

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cisync_core::{aggregate_custom_report_artifacts, Artifact, CustomReportArtifacts};
use glob::{MatchOptions, Pattern};
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::debug;

use crate::{ClientError, CustomReportConfig, ProviderClient, RunSummary};

pub fn entity_slug(entity: &str) -> String {
    entity.replace('/', "__")
}

pub struct FixtureClient<S, R, D> {
    root: PathBuf,
    _types: PhantomData<fn() -> (S, R, D)>,
}

impl<S, R, D> FixtureClient<S, R, D> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _types: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_dir(&self, entity: &str) -> PathBuf {
        self.root.join(entity_slug(entity))
    }

    fn run_dir(&self, entity: &str, run_key: &str) -> PathBuf {
        self.entity_dir(entity).join("runs").join(run_key)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Files under `dir` as `/`-separated relative paths, sorted.
async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if fs::metadata(dir).await.is_err() {
        return Ok(files);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .with_context(|| format!("listing {}", current.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn read_matching(dir: &Path, globs: &[String]) -> Result<Vec<Artifact>, ClientError> {
    let patterns = globs
        .iter()
        .map(|g| Pattern::new(g).map_err(|e| ClientError::Message(format!("invalid glob {g:?}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };

    let mut artifacts = Vec::new();
    for relative in list_files(dir).await? {
        if !patterns.iter().any(|p| p.matches_with(&relative, options)) {
            continue;
        }
        let path = dir.join(&relative);
        let data = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        artifacts.push(Artifact::new(relative, data));
    }
    Ok(artifacts)
}

#[async_trait]
impl<S, R, D> ProviderClient for FixtureClient<S, R, D>
where
    S: DeserializeOwned + Send + Sync + 'static,
    R: RunSummary + Clone + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
{
    type Summary = S;
    type Run = R;
    type Detail = D;

    async fn fetch_runs(&self, entity: &str, _last_run: Option<u64>) -> Result<Vec<S>, ClientError> {
        let path = self.entity_dir(entity).join("runs.json");
        let runs: Vec<S> = read_json(&path).await?;
        debug!(entity, count = runs.len(), path = %path.display(), "loaded fixture runs");
        Ok(runs)
    }

    async fn fetch_run_detail(&self, entity: &str, run: &R) -> Result<D, ClientError> {
        let path = self.run_dir(entity, &run.run_key()).join("detail.json");
        Ok(read_json(&path).await?)
    }

    async fn fetch_tests(&self, entity: &str, run: &R, globs: &[String]) -> Result<Vec<Artifact>, ClientError> {
        if globs.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.run_dir(entity, &run.run_key()).join("artifacts");
        read_matching(&dir, globs).await
    }

    async fn fetch_custom_reports(
        &self,
        entity: &str,
        run: &R,
        configs: &[CustomReportConfig],
    ) -> Result<CustomReportArtifacts, ClientError> {
        let dir = self.run_dir(entity, &run.run_key()).join("artifacts");
        let mut per_config = Vec::with_capacity(configs.len());
        for config in configs {
            let artifacts = read_matching(&dir, &config.paths).await?;
            per_config.push(CustomReportArtifacts::from([(config.name.clone(), artifacts)]));
        }
        Ok(aggregate_custom_report_artifacts(per_config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jenkins::{JenkinsBuild, JenkinsRunDetail};
    use tempfile::tempdir;

    type JenkinsFixtures = FixtureClient<JenkinsBuild, JenkinsBuild, JenkinsRunDetail>;

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn seed(root: &Path) {
        let entity = root.join("folder__deploy");
        write(
            &entity.join("runs.json"),
            r#"[{"number": 4, "result": "SUCCESS", "timestamp": 1709287200000}]"#,
        );
        let run = entity.join("runs/4");
        write(&run.join("detail.json"), r#"{"stages": []}"#);
        write(&run.join("artifacts/reports/junit-a.xml"), "<testsuite name=\"a\"/>");
        write(&run.join("artifacts/reports/nested/junit-b.xml"), "<testsuite name=\"b\"/>");
        write(&run.join("artifacts/coverage.json"), r#"{"lines": 81.5}"#);
    }

    #[tokio::test]
    async fn replays_runs_details_and_globbed_artifacts() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());
        let client = JenkinsFixtures::new(dir.path());

        let runs = client.fetch_runs("folder/deploy", Some(0)).await.unwrap();
        assert_eq!(runs.len(), 1);
        let detail = client.fetch_run_detail("folder/deploy", &runs[0]).await.unwrap();
        assert!(detail.stages.is_empty());

        let tests = client
            .fetch_tests("folder/deploy", &runs[0], &["reports/*.xml".to_string()])
            .await
            .unwrap();
        let paths: Vec<&str> = tests.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["reports/junit-a.xml"]);

        let all = client
            .fetch_tests("folder/deploy", &runs[0], &["reports/**/*.xml".to_string()])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let custom = client
            .fetch_custom_reports(
                "folder/deploy",
                &runs[0],
                &[CustomReportConfig {
                    name: "coverage".into(),
                    paths: vec!["coverage.json".into()],
                }],
            )
            .await
            .unwrap();
        assert_eq!(custom["coverage"].len(), 1);
    }

    #[tokio::test]
    async fn same_named_custom_reports_concatenate_in_config_order() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());
        write(
            &dir.path().join("folder__deploy/runs/4/artifacts/extra/coverage-ui.json"),
            r#"{"lines": 64.0}"#,
        );
        let client = JenkinsFixtures::new(dir.path());
        let runs = client.fetch_runs("folder/deploy", None).await.unwrap();

        let config = |paths: &str| CustomReportConfig {
            name: "coverage".into(),
            paths: vec![paths.into()],
        };
        let custom = client
            .fetch_custom_reports(
                "folder/deploy",
                &runs[0],
                &[config("extra/*.json"), config("coverage.json")],
            )
            .await
            .unwrap();
        let paths: Vec<&str> = custom["coverage"].iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["extra/coverage-ui.json", "coverage.json"]);
    }

    #[tokio::test]
    async fn missing_runs_file_is_a_client_error() {
        let dir = tempdir().expect("tempdir");
        let client = JenkinsFixtures::new(dir.path());
        let err = client.fetch_runs("nope", None).await.unwrap_err();
        assert!(err.to_string().contains("runs.json"));
    }

    #[tokio::test]
    async fn missing_artifacts_dir_yields_nothing() {
        let dir = tempdir().expect("tempdir");
        seed(dir.path());
        std::fs::remove_dir_all(dir.path().join("folder__deploy/runs/4/artifacts")).unwrap();
        let client = JenkinsFixtures::new(dir.path());
        let runs = client.fetch_runs("folder/deploy", None).await.unwrap();
        let tests = client
            .fetch_tests("folder/deploy", &runs[0], &["**/*.xml".to_string()])
            .await
            .unwrap();
        assert!(tests.is_empty());
    }
}
