use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tks_adapters::{
    clean, crawl_listings, fetch_details, HhApiSource, HhHtmlSource, SkippedDetail, SourceKind,
    VacancySource,
};
use tks_core::{CleanVacancy, TopSkillsReport};
use tks_storage::{Downloader, HttpFetcher, SkillStore};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{EnvironmentConfig, PipelineConfig};
use crate::error::{JobError, Stage, StageExt};
use crate::graph::{run_graph, GraphError, GraphRunSummary, JobId, JobRunner, TaskGraph, Topology};
use crate::loader::load_vacancies;
use crate::registry::{ensure_archive, load_registry, RegistryLoadOptions, RegistryLoadSummary};
use crate::report::{compute_top_skills, export_report, ReportFiles};
use crate::resolver::{resolve_skills, ResolveSummary};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub pages_requested: u32,
    pub listed: usize,
    pub duplicate_listings: usize,
    pub detailed: usize,
    pub skipped_details: Vec<SkippedDetail>,
    pub cooldown_pauses: usize,
    /// Records dropped for a missing field.
    pub dropped: usize,
    pub truncated: usize,
    pub loaded: usize,
    pub inserted: u64,
}

#[derive(Debug, Default)]
struct RunState {
    cleaned: Option<Vec<CleanVacancy>>,
    ingest: Option<IngestSummary>,
    resolve: Option<ResolveSummary>,
    registry: Option<RegistryLoadSummary>,
    report: Option<TopSkillsReport>,
    report_files: Option<ReportFiles>,
}

/// Outcome of one graph run plus whatever each successful job produced.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub summary: GraphRunSummary,
    pub ingest: Option<IngestSummary>,
    pub resolve: Option<ResolveSummary>,
    pub registry: Option<RegistryLoadSummary>,
    pub report: Option<TopSkillsReport>,
    pub report_files: Option<ReportFiles>,
}

/// One run of the top-key-skills jobs for one environment. The store is a
/// connection pool passed in by the caller; each batch write borrows one
/// connection inside its transaction and hands it back when the batch ends.
pub struct Pipeline {
    config: PipelineConfig,
    environment: EnvironmentConfig,
    topology: Topology,
    store: Arc<dyn SkillStore>,
    source: Arc<dyn VacancySource>,
    downloader: Option<Downloader>,
    run_id: Uuid,
    state: Mutex<RunState>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        environment: EnvironmentConfig,
        topology: Topology,
        store: Arc<dyn SkillStore>,
        source: Arc<dyn VacancySource>,
    ) -> Self {
        Self {
            config,
            environment,
            topology,
            store,
            source,
            downloader: None,
            run_id: Uuid::new_v4(),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Builds the HTTP client and the hh.ru source selected by `source_mode`.
    pub fn from_config(
        config: PipelineConfig,
        environment: EnvironmentConfig,
        topology: Topology,
        store: Arc<dyn SkillStore>,
    ) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client())?);
        let downloader = Downloader::new(&config.http_client())?;
        let listing_url = environment.listing_url(config.source_mode).to_string();
        let query = environment.query.clone();
        let source: Arc<dyn VacancySource> = match config.source_mode {
            SourceKind::Api => Arc::new(HhApiSource::new(http, listing_url, query)),
            SourceKind::Html => Arc::new(
                HhHtmlSource::new(http, listing_url, query).with_pacing(config.html_pacing()),
            ),
        };
        Ok(Self::new(config, environment, topology, store, source).with_downloader(downloader))
    }

    /// Client used to fetch a missing registry archive.
    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn environment(&self) -> &EnvironmentConfig {
        &self.environment
    }

    pub fn graph(&self) -> TaskGraph {
        TaskGraph::for_environment(&self.environment, self.topology)
    }

    pub async fn run(self: &Arc<Self>) -> Result<PipelineRun, GraphError> {
        self.execute(self.graph()).await
    }

    /// Runs `job` after everything it depends on.
    pub async fn run_through(self: &Arc<Self>, job: JobId) -> Result<PipelineRun, GraphError> {
        self.execute(self.graph().with_prerequisites(job)?).await
    }

    async fn execute(self: &Arc<Self>, graph: TaskGraph) -> Result<PipelineRun, GraphError> {
        let runner: Arc<dyn JobRunner> = Arc::clone(self) as Arc<dyn JobRunner>;
        let summary = run_graph(&graph, runner, self.run_id).await?;

        let mut state = self.state.lock().await;
        Ok(PipelineRun {
            summary,
            ingest: state.ingest.take(),
            resolve: state.resolve.take(),
            registry: state.registry.take(),
            report: state.report.take(),
            report_files: state.report_files.take(),
        })
    }

    /// Creates the relations in both schemas of the environment.
    pub async fn migrate(&self) -> Result<(), JobError> {
        let schemas: BTreeSet<&str> = [
            self.environment.vacancies_schema.as_str(),
            self.environment.companies_schema.as_str(),
        ]
        .into_iter()
        .collect();
        for schema in schemas {
            self.store
                .migrate(schema)
                .await
                .with_context(|| format!("migrating schema {schema}"))
                .stage(Stage::Migrate)?;
            info!(schema, "schema ready");
        }
        Ok(())
    }

    async fn ingest_and_load(&self) -> Result<(), JobError> {
        let schema = &self.environment.vacancies_schema;
        let source = self.source.as_ref();

        let listing = crawl_listings(source)
            .await
            .context("crawling listing pages")
            .stage(Stage::Retrieve)?;
        let listed = listing.items.len();

        let mut cooldown = self.config.detail_cooldown();
        let details = fetch_details(
            source,
            listing.items,
            &mut cooldown,
            self.config.detail_failure_policy,
        )
        .await
        .context("fetching vacancy details")
        .stage(Stage::Retrieve)?;
        if !details.skipped.is_empty() {
            warn!(skipped = details.skipped.len(), "some vacancy details were skipped");
        }

        let detailed = details.vacancies.len();
        let batch = clean(details.vacancies, self.config.vacancies_limit);
        info!(
            kept = batch.vacancies.len(),
            dropped = batch.dropped,
            truncated = batch.truncated,
            "cleaned vacancies"
        );

        let inserted = load_vacancies(self.store.as_ref(), schema, &batch.vacancies)
            .await
            .with_context(|| format!("loading vacancies into {schema}"))
            .stage(Stage::Load)?;

        let summary = IngestSummary {
            pages_requested: listing.pages_requested,
            listed,
            duplicate_listings: listing.duplicates,
            detailed,
            skipped_details: details.skipped,
            cooldown_pauses: cooldown.pauses(),
            dropped: batch.dropped,
            truncated: batch.truncated,
            loaded: batch.vacancies.len(),
            inserted,
        };

        let resolved = match self.topology {
            Topology::Folded => Some(self.resolve(&batch.vacancies).await?),
            Topology::Split => None,
        };

        let mut state = self.state.lock().await;
        state.ingest = Some(summary);
        if resolved.is_some() {
            state.resolve = resolved;
        }
        state.cleaned = Some(batch.vacancies);
        Ok(())
    }

    async fn resolve(&self, batch: &[CleanVacancy]) -> Result<ResolveSummary, JobError> {
        let schema = &self.environment.vacancies_schema;
        resolve_skills(self.store.as_ref(), schema, batch)
            .await
            .with_context(|| format!("resolving key skills in {schema}"))
            .stage(Stage::Resolve)
    }

    async fn resolve_dimension(&self) -> Result<(), JobError> {
        let batch = self
            .state
            .lock()
            .await
            .cleaned
            .clone()
            .ok_or_else(|| anyhow!("no cleaned batch from ingest-and-load in this run"))
            .stage(Stage::Resolve)?;
        let summary = self.resolve(&batch).await?;
        self.state.lock().await.resolve = Some(summary);
        Ok(())
    }

    async fn load_reference(&self) -> Result<(), JobError> {
        let archive = self
            .environment
            .registry_archive_path(&self.config.workspace_root);
        if let Some(downloader) = &self.downloader {
            ensure_archive(
                downloader,
                &archive,
                self.environment.registry_download_url.as_deref(),
            )
            .await
            .stage(Stage::Download)?;
        }

        let options = RegistryLoadOptions {
            okved_code: self.environment.okved_code.clone(),
            workers: self.config.registry_workers,
            max_files: self.config.registry_max_files,
        };
        let summary = load_registry(
            Arc::clone(&self.store),
            &self.environment.companies_schema,
            &archive,
            &options,
        )
        .await
        .stage(Stage::ReadRegistry)?;

        self.state.lock().await.registry = Some(summary);
        Ok(())
    }

    async fn report(&self) -> Result<(), JobError> {
        let vacancies_schema = &self.environment.vacancies_schema;
        let companies_schema = &self.environment.companies_schema;

        let rows = self
            .store
            .vacancy_skills(vacancies_schema)
            .await
            .with_context(|| format!("reading vacancy skills from {vacancies_schema}"))
            .stage(Stage::Report)?;
        let companies = self
            .store
            .companies(companies_schema)
            .await
            .with_context(|| format!("reading companies from {companies_schema}"))
            .stage(Stage::Report)?;

        let report = compute_top_skills(&rows, &companies);
        if report.match_count == 0 {
            warn!(
                companies = companies.len(),
                "no vacancies matched a registry company, ranking is empty"
            );
        } else {
            info!(match_count = report.match_count, "vacancies matched registry companies");
            for matched in &report.matched_vacancies {
                info!(vacancy_id = %matched.vacancy_id, employer = %matched.employer, "matched vacancy");
            }
            for (rank, entry) in report.top_skills.iter().enumerate() {
                info!(rank = rank + 1, skill = %entry.skill, count = entry.count, "top key skill");
            }
        }

        let files = export_report(
            &self.config.workspace_root,
            &self.environment.name,
            self.run_id,
            Utc::now(),
            &report,
        )
        .await
        .stage(Stage::Export)?;
        info!(dir = %files.dir.display(), "report written");

        let mut state = self.state.lock().await;
        state.report = Some(report);
        state.report_files = Some(files);
        Ok(())
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run_job(&self, job: JobId) -> Result<(), JobError> {
        match job {
            JobId::LoadReference => self.load_reference().await,
            JobId::IngestAndLoad => self.ingest_and_load().await,
            JobId::ResolveDimension => self.resolve_dimension().await,
            JobId::Report => self.report().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tks_adapters::{ListingBatch, RetrievalError};
    use tks_core::{ListingItem, VacancyDetail};
    use tks_storage::MemoryStore;

    use super::*;
    use crate::config::EnvironmentRegistry;
    use crate::graph::JobOutcome;

    struct EmptySource;

    #[async_trait]
    impl VacancySource for EmptySource {
        fn kind(&self) -> SourceKind {
            SourceKind::Api
        }

        async fn fetch_page(&self, _page: u32) -> Result<ListingBatch, RetrievalError> {
            Ok(Vec::new())
        }

        async fn fetch_detail(&self, item: &ListingItem) -> Result<VacancyDetail, RetrievalError> {
            Err(RetrievalError::Http {
                url: item.detail_url.clone(),
                status: 500,
            })
        }
    }

    fn pipeline(topology: Topology, root: &std::path::Path) -> Arc<Pipeline> {
        let config = PipelineConfig {
            workspace_root: root.to_path_buf(),
            ..Default::default()
        };
        let environment = EnvironmentRegistry::builtin().get("test").unwrap().clone();
        Arc::new(Pipeline::new(
            config,
            environment,
            topology,
            Arc::new(MemoryStore::new()),
            Arc::new(EmptySource),
        ))
    }

    #[tokio::test]
    async fn resolve_job_alone_has_no_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(Topology::Split, tmp.path());

        let err = pipeline.resolve_dimension().await.unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);
    }

    #[tokio::test]
    async fn missing_registry_archive_fails_only_load_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(Topology::Folded, tmp.path());

        let run = pipeline.run().await.unwrap();

        assert!(run.summary.record(JobId::IngestAndLoad).unwrap().succeeded());
        assert!(matches!(
            run.summary.record(JobId::LoadReference).unwrap().outcome,
            JobOutcome::Failed { stage: Stage::ReadRegistry, .. }
        ));
        assert!(matches!(
            run.summary.record(JobId::Report).unwrap().outcome,
            JobOutcome::Skipped { .. }
        ));
        let ingest = run.ingest.unwrap();
        assert_eq!(ingest.pages_requested, 1);
        assert_eq!(ingest.loaded, 0);
    }

    #[tokio::test]
    async fn migrate_rejects_an_invalid_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(Topology::Folded, tmp.path());
        pipeline.migrate().await.unwrap();

        let bad = Pipeline {
            environment: EnvironmentConfig {
                vacancies_schema: "Bad Schema".into(),
                ..pipeline.environment().clone()
            },
            ..Pipeline::new(
                PipelineConfig::default(),
                pipeline.environment().clone(),
                Topology::Folded,
                Arc::new(MemoryStore::new()),
                Arc::new(EmptySource),
            )
        };
        let err = bad.migrate().await.unwrap_err();
        assert_eq!(err.stage, Stage::Migrate);
    }
}
