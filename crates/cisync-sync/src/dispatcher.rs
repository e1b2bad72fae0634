use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cisync_adapters::bitrise::{BitriseAnalyzer, BitriseBuild, BitriseBuildDetail};
use cisync_adapters::circleci::v1::{
    CircleciBuild, CircleciV1Analyzer, CircleciWorkflowDetail, CircleciWorkflowRun,
};
use cisync_adapters::circleci::v2::{CircleciPipeline, CircleciPipelineDetail, CircleciV2Analyzer};
use cisync_adapters::github::{GithubAnalyzer, GithubRun, GithubRunDetail};
use cisync_adapters::jenkins::{JenkinsAnalyzer, JenkinsBuild, JenkinsRunDetail};
use cisync_adapters::{Analyzer, FixtureClient, ProviderClient};
use cisync_core::CiService;
use cisync_storage::{CompositeExporter, Exporter, LocalExporter, LocalStore, NullStore, WatermarkStore};
use futures::future::join_all;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, ServiceConfig};
use crate::orchestrator::{ProviderRunner, ProviderSummary, ProviderSync, SyncOptions};

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub sync: SyncOptions,
    /// Keep watermarks in memory only.
    pub dry_run: bool,
    /// Restrict the cycle to these services; empty means all configured.
    pub only_services: Vec<CiService>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub providers: Vec<ProviderSummary>,
}

impl CycleSummary {
    pub fn is_success(&self) -> bool {
        self.providers.iter().all(ProviderSummary::is_success)
    }

    pub fn failed_entities(&self) -> usize {
        self.providers
            .iter()
            .flat_map(|p| p.entities.iter())
            .filter(|e| !e.is_success())
            .count()
    }
}

/// Runs every configured provider concurrently.
#[derive(Default)]
pub struct Dispatcher {
    providers: Vec<Box<dyn ProviderSync>>,
}

impl Dispatcher {
    pub fn new(providers: Vec<Box<dyn ProviderSync>>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &Config, options: &DispatchOptions) -> Result<Self> {
        let wanted = |service: CiService| {
            options.only_services.is_empty() || options.only_services.contains(&service)
        };
        let mut providers: Vec<Box<dyn ProviderSync>> = Vec::new();

        if let Some(github) = config.github.as_ref().filter(|_| wanted(CiService::Github)) {
            providers.push(build_provider(
                github,
                FixtureClient::<GithubRun, GithubRun, GithubRunDetail>::new(&github.source.fixtures.dir),
                GithubAnalyzer,
                options,
            ));
        }
        if let Some(circleci) = config.circleci.as_ref().filter(|_| wanted(CiService::Circleci)) {
            let service = &circleci.service;
            let dir = &service.source.fixtures.dir;
            match circleci.version {
                1 => providers.push(build_provider(
                    service,
                    FixtureClient::<CircleciBuild, CircleciWorkflowRun, CircleciWorkflowDetail>::new(dir),
                    CircleciV1Analyzer,
                    options,
                )),
                2 => providers.push(build_provider(
                    service,
                    FixtureClient::<CircleciPipeline, CircleciPipeline, CircleciPipelineDetail>::new(dir),
                    CircleciV2Analyzer,
                    options,
                )),
                other => anyhow::bail!("unsupported circleci api version {other}"),
            }
        }
        if let Some(jenkins) = config.jenkins.as_ref().filter(|_| wanted(CiService::Jenkins)) {
            providers.push(build_provider(
                jenkins,
                FixtureClient::<JenkinsBuild, JenkinsBuild, JenkinsRunDetail>::new(&jenkins.source.fixtures.dir),
                JenkinsAnalyzer,
                options,
            ));
        }
        if let Some(bitrise) = config.bitrise.as_ref().filter(|_| wanted(CiService::Bitrise)) {
            providers.push(build_provider(
                bitrise,
                FixtureClient::<BitriseBuild, BitriseBuild, BitriseBuildDetail>::new(&bitrise.source.fixtures.dir),
                BitriseAnalyzer,
                options,
            ));
        }

        Ok(Self::new(providers))
    }

    pub fn services(&self) -> Vec<CiService> {
        self.providers.iter().map(|p| p.service()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn run_once(&self) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, providers = self.providers.len(), "sync cycle starting");

        let providers = join_all(self.providers.iter().map(|p| p.run())).await;
        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            providers,
        };
        info!(
            %run_id,
            success = summary.is_success(),
            failed_entities = summary.failed_entities(),
            "sync cycle finished"
        );
        summary
    }
}

fn build_provider<C, A>(
    config: &ServiceConfig,
    client: C,
    analyzer: A,
    options: &DispatchOptions,
) -> Box<dyn ProviderSync>
where
    C: ProviderClient + 'static,
    A: Analyzer<Summary = C::Summary, Run = C::Run, Detail = C::Detail> + 'static,
{
    let service = analyzer.service();
    let store: Arc<dyn WatermarkStore> = if options.dry_run {
        Arc::new(NullStore)
    } else {
        Arc::new(LocalStore::new(config.last_run_path(service)))
    };
    let mut exporters: Vec<Box<dyn Exporter>> = Vec::new();
    if let Some(local) = &config.exporter.local {
        exporters.push(Box::new(LocalExporter::new(service, &local.out_dir, local.format)));
    }
    let exporter: Arc<dyn Exporter> = Arc::new(CompositeExporter::new(exporters));

    Box::new(ProviderRunner::new(
        client,
        analyzer,
        config.entity_configs(),
        store,
        exporter,
        options.sync,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
github:
  repos: [org/api]
  source: { fixtures: { dir: fixtures/github } }
circleci:
  repos: [org/mobile]
  version: 1
  source: { fixtures: { dir: fixtures/circleci } }
bitrise:
  apps: [org/app]
  source: { fixtures: { dir: fixtures/bitrise } }
"#;

    #[test]
    fn builds_one_provider_per_section() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let dispatcher = Dispatcher::from_config(&config, &DispatchOptions::default()).unwrap();
        assert_eq!(
            dispatcher.services(),
            vec![CiService::Github, CiService::Circleci, CiService::Bitrise]
        );
    }

    #[test]
    fn only_services_filters_providers() {
        let config = Config::from_yaml(CONFIG).unwrap();
        let options = DispatchOptions {
            only_services: vec![CiService::Bitrise],
            ..DispatchOptions::default()
        };
        let dispatcher = Dispatcher::from_config(&config, &options).unwrap();
        assert_eq!(dispatcher.services(), vec![CiService::Bitrise]);
    }

    #[tokio::test]
    async fn empty_dispatcher_succeeds() {
        let summary = Dispatcher::default().run_once().await;
        assert!(summary.is_success());
        assert!(summary.providers.is_empty());
    }
}
