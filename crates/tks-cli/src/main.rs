use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tks_adapters::SourceKind;
use tks_sync::{
    build_scheduler, open_store, run_once, EnvironmentConfig, EnvironmentRegistry, JobId,
    Pipeline, PipelineConfig, PipelineRun, StoreKind, TaskGraph, Topology,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tks")]
#[command(about = "Top key skills of telecom vacancies on hh.ru")]
struct Cli {
    /// Environment name from environments.yaml or the built-in set.
    #[arg(long = "env", global = true, default_value = "test")]
    environment: String,
    #[arg(long, global = true, default_value_t = Topology::Folded)]
    topology: Topology,
    #[arg(long, global = true, default_value_t = StoreKind::Postgres)]
    store: StoreKind,
    /// Overrides TKS_SOURCE_MODE.
    #[arg(long, global = true)]
    source: Option<SourceKind>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate both schemas, then run every job of the graph.
    Run,
    /// Run one job after its prerequisites.
    Job { job: JobId },
    /// Print the job graph in execution order.
    Graph,
    Migrate,
    /// Run the graph on the TKS_SYNC_CRON schedule until interrupted.
    Schedule,
    Environments,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(source) = cli.source {
        config.source_mode = source;
    }
    let registry = EnvironmentRegistry::load(&config.workspace_root)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Environments => {
            for env in &registry.environments {
                println!(
                    "{}\tvacancies={}\tcompanies={}\tregistry={}",
                    env.name,
                    env.vacancies_schema,
                    env.companies_schema,
                    env.registry_archive.display()
                );
            }
        }
        Commands::Graph => {
            let environment = registry.get(&cli.environment)?;
            let graph = TaskGraph::for_environment(environment, cli.topology);
            for job in graph.topological_order()? {
                let deps: Vec<&str> = graph
                    .job(job)
                    .map(|spec| spec.depends_on.iter().map(|d| d.as_str()).collect())
                    .unwrap_or_default();
                if deps.is_empty() {
                    println!("{job}");
                } else {
                    println!("{job} <- {}", deps.join(", "));
                }
            }
        }
        Commands::Migrate => {
            let environment = registry.get(&cli.environment)?.clone();
            let pipeline = pipeline(config, environment, cli.topology, cli.store).await?;
            pipeline.migrate().await?;
        }
        Commands::Run => {
            let environment = registry.get(&cli.environment)?.clone();
            finish(run_once(config, environment, cli.topology, cli.store).await?)?;
        }
        Commands::Job { job } => {
            let environment = registry.get(&cli.environment)?.clone();
            let pipeline = pipeline(config, environment, cli.topology, cli.store).await?;
            pipeline.migrate().await?;
            finish(pipeline.run_through(job).await?)?;
        }
        Commands::Schedule => {
            let environment = registry.get(&cli.environment)?.clone();
            config.scheduler_enabled = true;
            let store = open_store(&config, cli.store).await?;
            let Some(mut sched) = build_scheduler(config.clone(), environment, cli.topology, store).await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, environment = %cli.environment, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn pipeline(
    config: PipelineConfig,
    environment: EnvironmentConfig,
    topology: Topology,
    store: StoreKind,
) -> Result<Arc<Pipeline>> {
    let store = open_store(&config, store).await?;
    Ok(Arc::new(Pipeline::from_config(config, environment, topology, store)?))
}

fn finish(run: PipelineRun) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&run.summary)?);
    if let Some(files) = &run.report_files {
        println!("report: {}", files.markdown.display());
    }
    if !run.summary.is_success() {
        let failed: Vec<String> = run.summary.failures().map(|r| r.job.to_string()).collect();
        bail!("run {} failed: {}", run.summary.run_id, failed.join(", "));
    }
    Ok(())
}
