use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tks_adapters::{ListingBatch, RetrievalError, SourceKind, VacancySource};
use tks_core::{ListingItem, VacancyDetail, VacancyId};
use tks_storage::{MemoryStore, SkillStore};
use tks_sync::{EnvironmentRegistry, JobId, Pipeline, PipelineConfig, Topology};
use zip::write::SimpleFileOptions;

/// Two vacancies on the first page, nothing after.
struct TwoVacancies;

fn listing(id: &str, employer: &str) -> ListingItem {
    ListingItem {
        id: VacancyId::from(id),
        position: Some("Middle Python Developer".into()),
        employer: Some(employer.into()),
        city: Some("Москва".into()),
        detail_url: format!("https://api.hh.ru/vacancies/{id}"),
    }
}

#[async_trait]
impl VacancySource for TwoVacancies {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch_page(&self, page: u32) -> Result<ListingBatch, RetrievalError> {
        Ok(match page {
            0 => vec![listing("101", "МТС"), listing("102", "Софтлайн")],
            _ => Vec::new(),
        })
    }

    async fn fetch_detail(&self, item: &ListingItem) -> Result<VacancyDetail, RetrievalError> {
        let skills = match item.id.as_str() {
            "101" => "Go|Kubernetes",
            _ => "Go",
        };
        Ok(VacancyDetail {
            description: Some("<p>backend services</p>".into()),
            key_skills: Some(skills.into()),
        })
    }
}

fn write_registry(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let records = serde_json::json!([
        {
            "ogrn": 1027700149124u64,
            "inn": "7740000076",
            "kpp": 770901001,
            "name": "ПАО \"МТС\"",
            "data": {"СвОКВЭД": {"СвОКВЭДОсн": {"КодОКВЭД": "61.10"}}}
        },
        {
            "ogrn": 1027739009011u64,
            "inn": 7736227885u64,
            "kpp": 772801001,
            "name": "ООО \"Софтлайн\"",
            "data": {"СвОКВЭД": {"СвОКВЭДОсн": {"КодОКВЭД": "62.01"}}}
        }
    ]);
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    zip.start_file("egrul_0001.json", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(records.to_string().as_bytes()).unwrap();
    zip.finish().unwrap();
}

async fn run_topology(topology: Topology) {
    let tmp = tempfile::tempdir().unwrap();
    let environment = EnvironmentRegistry::builtin().get("test").unwrap().clone();
    write_registry(&environment.registry_archive_path(tmp.path()));

    let config = PipelineConfig {
        workspace_root: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(
        config,
        environment,
        topology,
        store.clone(),
        Arc::new(TwoVacancies),
    ));
    pipeline.migrate().await.unwrap();

    let run = pipeline.run().await.unwrap();

    assert!(run.summary.is_success(), "{:?}", run.summary.jobs);
    assert_eq!(run.summary.topology, topology);
    assert_eq!(store.vacancy_count("hw3_test").await, 2);
    assert_eq!(store.skills("hw3_test").await.len(), 2);
    assert_eq!(store.links("hw3_test").await.len(), 3);
    assert_eq!(store.companies("hw1").await.unwrap().len(), 1);

    let ingest = run.ingest.unwrap();
    assert_eq!(ingest.pages_requested, 2);
    assert_eq!(ingest.loaded, 2);

    let report = run.report.unwrap();
    assert_eq!(report.match_count, 1);
    assert_eq!(report.matched_vacancies[0].vacancy_id, VacancyId::from("101"));
    let ranked: Vec<&str> = report.top_skills.iter().map(|s| s.skill.as_str()).collect();
    assert_eq!(ranked, vec!["go", "kubernetes"]);

    let files = run.report_files.unwrap();
    assert!(files.markdown.exists());
    assert!(files.manifest.exists());
    assert!(files.dir.join("top_skills.parquet").exists());
}

#[tokio::test]
async fn folded_graph_builds_the_report() {
    run_topology(Topology::Folded).await;
}

#[tokio::test]
async fn split_graph_builds_the_same_report() {
    run_topology(Topology::Split).await;
}

#[tokio::test]
async fn report_target_pulls_in_its_prerequisites() {
    let tmp = tempfile::tempdir().unwrap();
    let environment = EnvironmentRegistry::builtin().get("test").unwrap().clone();
    write_registry(&environment.registry_archive_path(tmp.path()));
    let config = PipelineConfig {
        workspace_root: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let pipeline = Arc::new(Pipeline::new(
        config,
        environment,
        Topology::Split,
        Arc::new(MemoryStore::new()),
        Arc::new(TwoVacancies),
    ));

    let only_ingest = pipeline.run_through(JobId::IngestAndLoad).await.unwrap();
    let jobs: Vec<JobId> = only_ingest.summary.jobs.iter().map(|r| r.job).collect();
    assert_eq!(jobs, vec![JobId::IngestAndLoad]);

    let full = pipeline.run_through(JobId::Report).await.unwrap();
    assert_eq!(full.summary.jobs.len(), 4);
    assert!(full.summary.is_success());
}

#[tokio::test]
async fn rerun_against_the_same_store_adds_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let environment = EnvironmentRegistry::builtin().get("test").unwrap().clone();
    write_registry(&environment.registry_archive_path(tmp.path()));
    let store = Arc::new(MemoryStore::new());

    for _ in 0..2 {
        let config = PipelineConfig {
            workspace_root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = Arc::new(Pipeline::new(
            config,
            environment.clone(),
            Topology::Folded,
            store.clone(),
            Arc::new(TwoVacancies),
        ));
        assert!(pipeline.run().await.unwrap().summary.is_success());
    }

    assert_eq!(store.vacancy_count("hw3_test").await, 2);
    assert_eq!(store.skills("hw3_test").await.len(), 2);
    assert_eq!(store.links("hw3_test").await.len(), 3);
    assert_eq!(store.companies("hw1").await.unwrap().len(), 1);
}
