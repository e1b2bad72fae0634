use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;

/// Schedules `dispatcher.run_once()` on `cron` (six fields, seconds first).
///
/// A tick that fires while the previous cycle is still running is skipped.
pub async fn build_scheduler(dispatcher: Arc<Dispatcher>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let busy = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let dispatcher = dispatcher.clone();
        let busy = busy.clone();
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                warn!("previous sync cycle still running; skipping tick");
                return;
            };
            let summary = dispatcher.run_once().await;
            if summary.is_success() {
                info!(run_id = %summary.run_id, "scheduled sync cycle succeeded");
            } else {
                error!(
                    run_id = %summary.run_id,
                    failed_entities = summary.failed_entities(),
                    "scheduled sync cycle had failures"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
