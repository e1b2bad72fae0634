use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cisync_adapters::CustomReportConfig;
use cisync_core::CiService;
use cisync_storage::ExportFormat;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "cisync.yaml";
pub const CONFIG_ENV: &str = "CISYNC_CONFIG";

/// Top-level YAML document; one optional section per provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: Option<ServiceConfig>,
    #[serde(default)]
    pub circleci: Option<CircleciConfig>,
    #[serde(default)]
    pub jenkins: Option<ServiceConfig>,
    #[serde(default)]
    pub bitrise: Option<ServiceConfig>,
}

impl Config {
    /// `explicit` wins over `CISYNC_CONFIG`, which wins over `cisync.yaml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        if let Some(circleci) = &config.circleci {
            anyhow::ensure!(
                matches!(circleci.version, 1 | 2),
                "unsupported circleci api version {}",
                circleci.version
            );
        }
        for service in config.service_configs() {
            for entity in service.entity_configs() {
                for report in &entity.custom_reports {
                    let name = report.name.as_str();
                    anyhow::ensure!(
                        !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != "..",
                        "{}: custom report name `{name}` must be a plain file name",
                        entity.name
                    );
                }
            }
        }
        Ok(config)
    }

    fn service_configs(&self) -> impl Iterator<Item = &ServiceConfig> {
        [
            self.github.as_ref(),
            self.circleci.as_ref().map(|c| &c.service),
            self.jenkins.as_ref(),
            self.bitrise.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn services(&self) -> Vec<CiService> {
        let mut services = Vec::new();
        if self.github.is_some() {
            services.push(CiService::Github);
        }
        if self.circleci.is_some() {
            services.push(CiService::Circleci);
        }
        if self.jenkins.is_some() {
            services.push(CiService::Jenkins);
        }
        if self.bitrise.is_some() {
            services.push(CiService::Bitrise);
        }
        services
    }
}

/// Shared shape of a provider section. The entity list is spelled `repos`,
/// `jobs` or `apps` depending on the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, alias = "repos", alias = "jobs", alias = "apps")]
    pub entities: Vec<EntitySpec>,
    pub source: SourceConfig,
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub last_run_saved_in: Option<LastRunConfig>,
}

impl ServiceConfig {
    pub fn entity_configs(&self) -> Vec<EntityConfig> {
        self.entities.iter().cloned().map(EntitySpec::into_config).collect()
    }

    pub fn last_run_path(&self, service: CiService) -> PathBuf {
        self.last_run_saved_in
            .as_ref()
            .map(|l| l.local.path.clone())
            .unwrap_or_else(|| PathBuf::from(format!(".cisync/last_run/{service}.json")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircleciConfig {
    #[serde(flatten)]
    pub service: ServiceConfig,
    #[serde(default = "default_circleci_version")]
    pub version: u8,
}

fn default_circleci_version() -> u8 {
    2
}

/// Either a bare entity name or the detailed form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EntitySpec {
    Name(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        name: String,
        #[serde(default)]
        tests: Vec<String>,
        #[serde(default)]
        custom_reports: Vec<CustomReportConfig>,
    },
}

impl EntitySpec {
    pub fn into_config(self) -> EntityConfig {
        match self {
            EntitySpec::Name(name) => EntityConfig {
                name,
                ..EntityConfig::default()
            },
            EntitySpec::Detailed {
                name,
                tests,
                custom_reports,
            } => EntityConfig {
                name,
                tests,
                custom_reports,
            },
        }
    }
}

/// One repository, job or app as the orchestrator sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityConfig {
    pub name: String,
    pub tests: Vec<String>,
    pub custom_reports: Vec<CustomReportConfig>,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub fixtures: FixtureSourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureSourceConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub local: Option<LocalExporterConfig>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            local: Some(LocalExporterConfig {
                out_dir: PathBuf::from("output"),
                format: ExportFormat::Json,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalExporterConfig {
    pub out_dir: PathBuf,
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastRunConfig {
    pub local: LocalLastRunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalLastRunConfig {
    pub path: PathBuf,
}
