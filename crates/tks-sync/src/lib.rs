//! Top-key-skills orchestration: environment config, the job graph and its
//! runner, skill resolution, the registry bulk load and the report export.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tks_storage::{MemoryStore, PgStore, SkillStore};
use tracing::info;

mod config;
mod error;
mod graph;
mod loader;
mod pipeline;
mod registry;
mod report;
mod resolver;
mod scheduler;

pub use config::{EnvironmentConfig, EnvironmentRegistry, PipelineConfig};
pub use error::{JobError, Stage, StageExt};
pub use graph::{
    run_graph, GraphError, GraphRunSummary, JobId, JobOutcome, JobRecord, JobRunner, JobSpec,
    JobTimer, TaskGraph, Topology,
};
pub use loader::load_vacancies;
pub use pipeline::{IngestSummary, Pipeline, PipelineRun};
pub use registry::{
    ensure_archive, list_members, load_registry, okved_matches, read_member, RegistryLoadOptions,
    RegistryLoadSummary,
};
pub use report::{
    company_join_key, compute_top_skills, employer_join_key, export_report, render_markdown,
    ReportFiles, SnapshotManifest, SnapshotManifestFile, TOP_SKILLS_LIMIT,
};
pub use resolver::{
    explode, normalize_skill, resolve_skills, ResolutionFault, ResolveError, ResolveSummary,
};
pub use scheduler::build_scheduler;

pub const CRATE_NAME: &str = "tks-sync";

/// Which [`SkillStore`] backs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Postgres,
    /// In-process tables, gone when the process exits.
    Memory,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown store {other:?} (expected postgres or memory)")),
        }
    }
}

pub async fn open_store(config: &PipelineConfig, kind: StoreKind) -> Result<Arc<dyn SkillStore>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Postgres => {
            let url = config.require_database_url()?;
            let store = PgStore::connect(url, config.registry_workers as u32 + 1, config.tables.clone())
                .await
                .context("connecting to postgres")?;
            info!(tables = ?config.tables, "connected to postgres");
            Ok(Arc::new(store))
        }
    }
}

/// Opens the store, migrates both schemas and runs every job of the graph.
pub async fn run_once(
    config: PipelineConfig,
    environment: EnvironmentConfig,
    topology: Topology,
    store_kind: StoreKind,
) -> Result<PipelineRun> {
    let store = open_store(&config, store_kind).await?;
    let pipeline = Arc::new(Pipeline::from_config(config, environment, topology, store)?);
    pipeline.migrate().await?;
    Ok(pipeline.run().await?)
}
