use std::sync::Arc;

use anyhow::{Context, Result};
use tks_storage::SkillStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{EnvironmentConfig, PipelineConfig};
use crate::graph::Topology;
use crate::pipeline::Pipeline;

/// One cron job that runs the whole graph for `environment`, a fresh
/// pipeline per tick. `None` when scheduling is disabled.
pub async fn build_scheduler(
    config: PipelineConfig,
    environment: EnvironmentConfig,
    topology: Topology,
    store: Arc<dyn SkillStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let environment = environment.clone();
        let store = Arc::clone(&store);
        Box::pin(async move {
            scheduled_run(config, environment, topology, store).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

async fn scheduled_run(
    config: PipelineConfig,
    environment: EnvironmentConfig,
    topology: Topology,
    store: Arc<dyn SkillStore>,
) {
    let env_name = environment.name.clone();
    let pipeline = match Pipeline::from_config(config, environment, topology, store) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(err) => {
            error!(environment = %env_name, error = %format!("{err:#}"), "could not build scheduled pipeline");
            return;
        }
    };

    info!(environment = %env_name, run_id = %pipeline.run_id(), "scheduled run triggered");
    match pipeline.run().await {
        Ok(run) if run.summary.is_success() => {
            info!(environment = %env_name, run_id = %run.summary.run_id, "scheduled run finished");
        }
        Ok(run) => {
            let failed: Vec<String> = run.summary.failures().map(|r| r.job.to_string()).collect();
            warn!(environment = %env_name, failed = %failed.join(","), "scheduled run finished with failures");
        }
        Err(err) => error!(environment = %env_name, error = %err, "scheduled run did not start"),
    }
}
