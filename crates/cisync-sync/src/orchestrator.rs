//! Per-entity sync cycle and the per-provider runner around it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cisync_adapters::{Analyzer, MetaVersionPolicy, ProviderClient, RunSummary};
use cisync_core::{
    create_custom_report_collection, CiService, CustomReportCollection, TestReport,
    WorkflowReport,
};
use cisync_storage::{Exporter, LastRunStore, WatermarkMeta, WatermarkStore};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EntityConfig;
use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Skip failing runs instead of stopping at the first one.
    pub force_save_last_run: bool,
}

/// Watermark changes decided by one entity cycle, applied by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub meta: Option<WatermarkMeta>,
    pub reset: bool,
    pub last_run: Option<u64>,
}

impl WatermarkUpdate {
    pub fn apply(&self, entity: &str, store: &mut LastRunStore) {
        if let Some(meta) = self.meta {
            store.set_meta(entity, meta);
        }
        if self.reset {
            store.reset_last_run(entity);
        }
        if let Some(last_run) = self.last_run {
            store.set_last_run(entity, last_run);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub entity: String,
    pub selected_runs: usize,
    pub processed_runs: usize,
    pub last_run: Option<u64>,
    pub error: Option<String>,
}

impl EntityOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything one entity cycle produced.
#[derive(Debug)]
pub struct EntityCycle {
    pub workflow_reports: Vec<WorkflowReport>,
    pub test_reports: Vec<TestReport>,
    pub custom_reports: CustomReportCollection,
    /// Updates keyed by watermark key (see [`watermark_key`]).
    pub watermarks: BTreeMap<String, WatermarkUpdate>,
    pub outcome: EntityOutcome,
}

impl EntityCycle {
    fn new(entity: &str) -> Self {
        Self {
            workflow_reports: Vec::new(),
            test_reports: Vec::new(),
            custom_reports: CustomReportCollection::new(),
            watermarks: BTreeMap::new(),
            outcome: EntityOutcome {
                entity: entity.to_string(),
                selected_runs: 0,
                processed_runs: 0,
                last_run: None,
                error: None,
            },
        }
    }

    fn fail(mut self, err: &SyncError) -> Self {
        self.outcome.error = Some(err.to_string());
        self
    }
}

/// Key a watermark is stored under: the entity itself, or
/// `{entity}/{partition}` for providers that number runs per partition.
pub fn watermark_key(entity: &str, partition: Option<&str>) -> String {
    match partition {
        Some(partition) => format!("{entity}/{partition}"),
        None => entity.to_string(),
    }
}

fn has_partitions(last_runs: &LastRunStore, entity: &str) -> bool {
    let prefix = format!("{entity}/");
    last_runs.records().keys().any(|key| key.starts_with(&prefix))
}

/// Runs of one watermark key, selected against that key's watermark.
struct Lane<R> {
    key: String,
    runs: Vec<R>,
    last_run: Option<u64>,
    update: WatermarkUpdate,
}

/// Decides how stored watermark metadata moves to `policy`.
///
/// Returns the update to apply and the watermark to select runs against.
pub fn plan_migration(
    entity: &str,
    policy: Option<MetaVersionPolicy>,
    stored_meta: Option<WatermarkMeta>,
    stored_last_run: Option<u64>,
) -> Result<(WatermarkUpdate, Option<u64>), SyncError> {
    let Some(policy) = policy else {
        return Ok((WatermarkUpdate::default(), stored_last_run));
    };
    match stored_meta {
        Some(meta) if meta.version == policy.version => {
            Ok((WatermarkUpdate::default(), stored_last_run))
        }
        Some(meta) if meta.version > policy.version => Err(SyncError::MetaVersion {
            entity: entity.to_string(),
            stored: meta.version,
            current: policy.version,
        }),
        _ => {
            let reset = policy.reset_on_migrate && stored_last_run.is_some();
            let update = WatermarkUpdate {
                meta: Some(WatermarkMeta {
                    version: policy.version,
                }),
                reset,
                last_run: None,
            };
            let effective = if reset { Some(0) } else { stored_last_run };
            Ok((update, effective))
        }
    }
}

struct ProcessedRun {
    workflow_reports: Vec<WorkflowReport>,
    test_reports: Vec<TestReport>,
    custom_reports: CustomReportCollection,
}

async fn process_run<C, A>(
    client: &C,
    analyzer: &A,
    entity: &EntityConfig,
    run: &C::Run,
) -> Result<ProcessedRun, SyncError>
where
    C: ProviderClient,
    A: Analyzer<Summary = C::Summary, Run = C::Run, Detail = C::Detail>,
{
    let name = entity.name.as_str();
    let (detail, artifacts, custom_artifacts) = tokio::try_join!(
        client.fetch_run_detail(name, run),
        client.fetch_tests(name, run, &entity.tests),
        client.fetch_custom_reports(name, run, &entity.custom_reports),
    )?;

    let workflow_reports = analyzer.create_workflow_reports(name, run, &detail);
    let mut test_reports = Vec::new();
    for workflow in &workflow_reports {
        test_reports.extend(analyzer.create_test_reports(workflow, &detail, &artifacts));
    }
    // Custom artifacts belong to the run, not to each of its workflows.
    let custom_reports = workflow_reports
        .first()
        .map(|workflow| create_custom_report_collection(workflow, &custom_artifacts))
        .unwrap_or_default();

    Ok(ProcessedRun {
        workflow_reports,
        test_reports,
        custom_reports,
    })
}

/// Runs one entity: migrate, select, fetch and normalize each run in order.
///
/// Reads `last_runs` only; the returned [`WatermarkUpdate`] carries every
/// change for the caller to apply.
pub async fn run_entity_cycle<C, A>(
    client: &C,
    analyzer: &A,
    entity: &EntityConfig,
    last_runs: &LastRunStore,
    options: SyncOptions,
) -> EntityCycle
where
    C: ProviderClient,
    A: Analyzer<Summary = C::Summary, Run = C::Run, Detail = C::Detail>,
{
    let span = info_span!("entity_cycle", service = %analyzer.service(), entity = %entity.name);
    async move {
        let name = entity.name.as_str();
        let mut cycle = EntityCycle::new(name);
        let policy = analyzer.meta_version();

        let (migration, entity_last_run) = match plan_migration(
            name,
            policy,
            last_runs.get_meta(name),
            last_runs.get_last_run(name),
        ) {
            Ok(planned) => planned,
            Err(err) => {
                error!("{err}");
                return cycle.fail(&err);
            }
        };
        // One entity-wide hint cannot bound runs numbered per partition.
        let fetch_hint = if has_partitions(last_runs, name) {
            None
        } else {
            entity_last_run
        };
        info!(last_run = ?fetch_hint, "entity cycle starting");

        let summaries = match client.fetch_runs(name, fetch_hint).await {
            Ok(summaries) => summaries,
            Err(err) => {
                let err = SyncError::from(err);
                error!("fetching runs failed: {err}");
                cycle.watermarks.insert(name.to_string(), migration);
                return cycle.fail(&err);
            }
        };

        let mut groups: BTreeMap<Option<String>, Vec<C::Summary>> = BTreeMap::new();
        for summary in summaries {
            groups
                .entry(analyzer.watermark_partition(&summary))
                .or_default()
                .push(summary);
        }
        if groups.is_empty() {
            groups.insert(None, Vec::new());
        }

        let mut lanes = Vec::with_capacity(groups.len());
        for (partition, group) in groups {
            let key = watermark_key(name, partition.as_deref());
            let (update, last_run) = match partition {
                None => (migration, entity_last_run),
                Some(_) => match plan_migration(
                    &key,
                    policy,
                    last_runs.get_meta(&key),
                    last_runs.get_last_run(&key),
                ) {
                    Ok(planned) => planned,
                    Err(err) => {
                        error!("{err}");
                        return cycle.fail(&err);
                    }
                },
            };
            if update.reset {
                warn!(watermark = %key, "watermark metadata migrated; last run reset to 0");
            }
            let runs = analyzer.select_runs(group, last_run);
            debug!(watermark = %key, last_run = ?last_run, selected = runs.len(), "runs selected");
            lanes.push(Lane {
                key,
                runs,
                last_run,
                update,
            });
        }
        cycle.outcome.selected_runs = lanes.iter().map(|lane| lane.runs.len()).sum();

        let mut first_error: Option<SyncError> = None;
        'lanes: for lane in &mut lanes {
            for run in &lane.runs {
                let number = run.run_number();
                match process_run(client, analyzer, entity, run).await {
                    Ok(processed) => {
                        cycle.workflow_reports.extend(processed.workflow_reports);
                        cycle.test_reports.extend(processed.test_reports);
                        cycle.custom_reports.aggregate(processed.custom_reports);
                        cycle.outcome.processed_runs += 1;
                        lane.update.last_run = lane.update.last_run.max(Some(number));
                    }
                    Err(err) => {
                        error!(run = number, watermark = %lane.key, "run failed: {err}");
                        first_error.get_or_insert(err);
                        if !options.force_save_last_run {
                            break 'lanes;
                        }
                    }
                }
            }
        }

        cycle.outcome.last_run = lanes
            .iter()
            .filter_map(|lane| lane.update.last_run.or(lane.last_run))
            .max();
        cycle.watermarks = lanes
            .into_iter()
            .map(|lane| (lane.key, lane.update))
            .collect();
        match first_error {
            Some(err) => cycle.fail(&err),
            None => {
                info!(
                    processed = cycle.outcome.processed_runs,
                    last_run = ?cycle.outcome.last_run,
                    "entity cycle completed"
                );
                cycle
            }
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub service: CiService,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntityOutcome>,
    pub workflow_reports: usize,
    pub test_reports: usize,
    pub custom_reports: usize,
    /// Provider-level failure (store, export); entity failures live in `entities`.
    pub error: Option<String>,
}

impl ProviderSummary {
    pub fn failed(service: CiService, started_at: DateTime<Utc>, err: &SyncError) -> Self {
        Self {
            service,
            started_at,
            finished_at: Utc::now(),
            entities: Vec::new(),
            workflow_reports: 0,
            test_reports: 0,
            custom_reports: 0,
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.entities.iter().all(EntityOutcome::is_success)
    }
}

/// Object-safe face of a provider runner, used by the dispatcher.
#[async_trait]
pub trait ProviderSync: Send + Sync {
    fn service(&self) -> CiService;

    async fn run(&self) -> ProviderSummary;
}

/// Runs every configured entity of one provider, exports, then persists
/// watermarks.
pub struct ProviderRunner<C, A> {
    client: C,
    analyzer: A,
    entities: Vec<EntityConfig>,
    store: Arc<dyn WatermarkStore>,
    exporter: Arc<dyn Exporter>,
    options: SyncOptions,
}

impl<C, A> ProviderRunner<C, A>
where
    C: ProviderClient,
    A: Analyzer<Summary = C::Summary, Run = C::Run, Detail = C::Detail>,
{
    pub fn new(
        client: C,
        analyzer: A,
        entities: Vec<EntityConfig>,
        store: Arc<dyn WatermarkStore>,
        exporter: Arc<dyn Exporter>,
        options: SyncOptions,
    ) -> Self {
        Self {
            client,
            analyzer,
            entities,
            store,
            exporter,
            options,
        }
    }

    pub async fn run_cycle(&self) -> Result<ProviderSummary, SyncError> {
        let started_at = Utc::now();
        let service = self.analyzer.service();
        let mut last_runs = LastRunStore::init(self.store.clone()).await?;
        info!(
            %service,
            store = %last_runs.describe(),
            entities = self.entities.len(),
            "provider cycle starting"
        );

        let cycles = join_all(self.entities.iter().map(|entity| {
            run_entity_cycle(&self.client, &self.analyzer, entity, &last_runs, self.options)
        }))
        .await;

        let mut workflow_reports = Vec::new();
        let mut test_reports = Vec::new();
        let mut custom_reports = CustomReportCollection::new();
        let mut updates = Vec::with_capacity(cycles.len());
        let mut entities = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            workflow_reports.extend(cycle.workflow_reports);
            test_reports.extend(cycle.test_reports);
            custom_reports.aggregate(cycle.custom_reports);
            updates.extend(cycle.watermarks);
            entities.push(cycle.outcome);
        }

        self.exporter.export_workflow_reports(&workflow_reports).await?;
        self.exporter.export_test_reports(&test_reports).await?;
        self.exporter.export_custom_reports(&custom_reports).await?;

        for (key, update) in &updates {
            update.apply(key, &mut last_runs);
        }
        last_runs.save().await?;

        let summary = ProviderSummary {
            service,
            started_at,
            finished_at: Utc::now(),
            workflow_reports: workflow_reports.len(),
            test_reports: test_reports.len(),
            custom_reports: custom_reports.iter().map(|(_, items)| items.len()).sum(),
            entities,
            error: None,
        };
        info!(
            %service,
            workflow_reports = summary.workflow_reports,
            test_reports = summary.test_reports,
            failed_entities = summary.entities.iter().filter(|e| !e.is_success()).count(),
            "provider cycle finished"
        );
        Ok(summary)
    }
}

#[async_trait]
impl<C, A> ProviderSync for ProviderRunner<C, A>
where
    C: ProviderClient + 'static,
    A: Analyzer<Summary = C::Summary, Run = C::Run, Detail = C::Detail> + 'static,
{
    fn service(&self) -> CiService {
        self.analyzer.service()
    }

    async fn run(&self) -> ProviderSummary {
        let started_at = Utc::now();
        match self.run_cycle().await {
            Ok(summary) => summary,
            Err(err) => {
                error!(service = %self.service(), "provider cycle failed: {err}");
                ProviderSummary::failed(self.service(), started_at, &err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2: MetaVersionPolicy = MetaVersionPolicy {
        version: 2,
        reset_on_migrate: true,
    };

    #[test]
    fn partition_keys_nest_under_the_entity() {
        assert_eq!(watermark_key("org/api", None), "org/api");
        assert_eq!(
            watermark_key("org/api", Some(".github/workflows/ci.yml")),
            "org/api/.github/workflows/ci.yml"
        );
    }

    #[test]
    fn no_policy_leaves_state_alone() {
        let (update, last_run) = plan_migration("e", None, None, Some(9)).unwrap();
        assert_eq!(update, WatermarkUpdate::default());
        assert_eq!(last_run, Some(9));
    }

    #[test]
    fn legacy_state_is_reset_and_stamped() {
        let (update, last_run) = plan_migration("e", Some(V2), None, Some(900)).unwrap();
        assert_eq!(update.meta, Some(WatermarkMeta { version: 2 }));
        assert!(update.reset);
        assert_eq!(last_run, Some(0));

        let (update, last_run) =
            plan_migration("e", Some(V2), Some(WatermarkMeta { version: 1 }), Some(900)).unwrap();
        assert!(update.reset);
        assert_eq!(last_run, Some(0));
    }

    #[test]
    fn fresh_entity_only_gets_stamped() {
        let (update, last_run) = plan_migration("e", Some(V2), None, None).unwrap();
        assert_eq!(update.meta, Some(WatermarkMeta { version: 2 }));
        assert!(!update.reset);
        assert_eq!(last_run, None);
    }

    #[test]
    fn migration_without_reset_keeps_watermark() {
        let policy = MetaVersionPolicy {
            version: 3,
            reset_on_migrate: false,
        };
        let (update, last_run) =
            plan_migration("e", Some(policy), Some(WatermarkMeta { version: 2 }), Some(40)).unwrap();
        assert_eq!(update.meta, Some(WatermarkMeta { version: 3 }));
        assert!(!update.reset);
        assert_eq!(last_run, Some(40));
    }

    #[test]
    fn current_version_is_a_no_op() {
        let (update, last_run) =
            plan_migration("e", Some(V2), Some(WatermarkMeta { version: 2 }), Some(12)).unwrap();
        assert_eq!(update, WatermarkUpdate::default());
        assert_eq!(last_run, Some(12));
    }

    #[test]
    fn newer_stored_version_is_rejected() {
        let err = plan_migration("org/repo", Some(V2), Some(WatermarkMeta { version: 5 }), Some(3))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::MetaVersion { stored: 5, current: 2, .. }
        ));
    }
}
