//! Turns the free-text skills of a cleaned batch into rows of the `key_skills`
//! dimension and the `vacancies_key_skills` junction.
//!
//! Surrogate keys are assigned by the store, so resolution is
//! write, read back, write: upsert the distinct skills, read their ids, then
//! upsert the links. Each write commits before the next step starts. Two
//! writers resolving overlapping skills at once must be serialized by the
//! caller; a run uses a single writer.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tks_core::{CleanVacancy, VacancyId, VacancySkillLink};
use tks_storage::{SkillStore, StoreError};
use tracing::{debug, info};

/// Skills that were upserted but not visible on read-back. The dimension
/// write did not commit before the read; never skipped.
#[derive(Debug, Error)]
#[error("{} skill(s) missing from {schema} after upsert: {}", .missing.len(), .missing.join(", "))]
pub struct ResolutionFault {
    pub schema: String,
    pub missing: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fault(#[from] ResolutionFault),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveSummary {
    /// Distinct (vacancy, normalized skill) pairs in the batch.
    pub pairs: usize,
    pub distinct_skills: usize,
    pub skills_inserted: u64,
    pub links_inserted: u64,
}

/// Trimmed and lower-cased; `None` for a blank token.
pub fn normalize_skill(token: &str) -> Option<String> {
    let normalized = token.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// One pair per (vacancy, skill token) with the token normalized. Exact
/// duplicates collapse; first occurrence order is kept.
pub fn explode(batch: &[CleanVacancy]) -> Vec<(VacancyId, String)> {
    let mut seen: HashSet<(VacancyId, String)> = HashSet::new();
    let mut pairs = Vec::new();
    for vacancy in batch {
        for token in &vacancy.key_skills {
            let Some(skill) = normalize_skill(token) else {
                continue;
            };
            let pair = (vacancy.id.clone(), skill);
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    }
    pairs
}

pub async fn resolve_skills(
    store: &dyn SkillStore,
    schema: &str,
    batch: &[CleanVacancy],
) -> Result<ResolveSummary, ResolveError> {
    let pairs = explode(batch);
    let distinct: Vec<String> = pairs
        .iter()
        .map(|(_, skill)| skill.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    debug!(schema, pairs = pairs.len(), distinct = distinct.len(), "exploded skills");

    let skills_inserted = store.upsert_skills(schema, &distinct).await?;

    let ids: HashMap<String, i64> = store
        .skill_ids(schema, &distinct)
        .await?
        .into_iter()
        .map(|row| (row.skill, row.id))
        .collect();

    let missing: Vec<String> = distinct
        .iter()
        .filter(|skill| !ids.contains_key(*skill))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ResolutionFault {
            schema: schema.to_string(),
            missing,
        }
        .into());
    }

    let links: Vec<VacancySkillLink> = pairs
        .iter()
        .filter_map(|(vacancy_id, skill)| {
            ids.get(skill).map(|id| VacancySkillLink {
                vacancy_id: vacancy_id.clone(),
                key_skill_id: *id,
            })
        })
        .collect();
    let links_inserted = store.upsert_vacancy_skills(schema, &links).await?;

    let summary = ResolveSummary {
        pairs: pairs.len(),
        distinct_skills: distinct.len(),
        skills_inserted,
        links_inserted,
    };
    info!(
        schema,
        pairs = summary.pairs,
        distinct_skills = summary.distinct_skills,
        skills_inserted,
        links_inserted,
        "resolved key skills"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tks_core::{Company, SkillRow, VacancyRow, VacancySkillRow};
    use tks_storage::MemoryStore;

    use super::*;
    use crate::loader::load_vacancies;

    fn vacancy(id: &str, skills: &[&str]) -> CleanVacancy {
        CleanVacancy {
            id: VacancyId::from(id),
            position: "Middle Python Developer".into(),
            employer: "Acme".into(),
            city: "Moscow".into(),
            description: "backend".into(),
            key_skills: skills.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn loaded(store: &MemoryStore, batch: &[CleanVacancy]) {
        load_vacancies(store, "s", batch).await.unwrap();
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_skill("  PostgreSQL "), Some("postgresql".into()));
        assert_eq!(normalize_skill("Ключевой НАВЫК"), Some("ключевой навык".into()));
        assert_eq!(normalize_skill("   "), None);
    }

    #[test]
    fn explode_collapses_exact_duplicates_per_vacancy() {
        let batch = vec![
            vacancy("1", &["Python", "python ", "SQL"]),
            vacancy("2", &["PYTHON"]),
        ];
        let pairs = explode(&batch);
        assert_eq!(
            pairs,
            vec![
                (VacancyId::from("1"), "python".to_string()),
                (VacancyId::from("1"), "sql".to_string()),
                (VacancyId::from("2"), "python".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn case_variants_share_one_dimension_row() {
        let store = MemoryStore::new();
        let batch = vec![
            vacancy("1", &["Python"]),
            vacancy("2", &["python "]),
            vacancy("3", &["PYTHON"]),
        ];
        loaded(&store, &batch).await;

        let summary = resolve_skills(&store, "s", &batch).await.unwrap();

        let skills = store.skills("s").await;
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].skill, "python");
        let links = store.links("s").await;
        assert_eq!(links.len(), 3);
        assert!(links.iter().all(|l| l.key_skill_id == skills[0].id));
        assert_eq!(summary.links_inserted, 3);
    }

    #[tokio::test]
    async fn rerun_creates_no_new_rows_and_keeps_ids() {
        let store = MemoryStore::new();
        let batch = vec![vacancy("1", &["Go", "Kubernetes"]), vacancy("2", &["Go"])];
        loaded(&store, &batch).await;

        resolve_skills(&store, "s", &batch).await.unwrap();
        let skills_before = store.skills("s").await;
        let second = resolve_skills(&store, "s", &batch).await.unwrap();

        assert_eq!(second.skills_inserted, 0);
        assert_eq!(second.links_inserted, 0);
        assert_eq!(store.skills("s").await, skills_before);
        assert_eq!(store.links("s").await.len(), 3);
    }

    #[tokio::test]
    async fn every_link_points_at_an_existing_skill() {
        let store = MemoryStore::new();
        let batch = vec![
            vacancy("1", &["Docker", "Linux", "docker"]),
            vacancy("2", &["Linux", "Bash"]),
            vacancy("3", &[]),
        ];
        loaded(&store, &batch).await;
        resolve_skills(&store, "s", &batch).await.unwrap();

        let skill_ids: HashSet<i64> = store.skills("s").await.into_iter().map(|s| s.id).collect();
        let links = store.links("s").await;
        assert_eq!(links.len(), 4);
        assert!(links.iter().all(|l| skill_ids.contains(&l.key_skill_id)));
    }

    /// Accepts skill writes but never shows them on read-back.
    struct InvisibleWrites(MemoryStore);

    #[async_trait]
    impl SkillStore for InvisibleWrites {
        async fn migrate(&self, schema: &str) -> Result<(), StoreError> {
            self.0.migrate(schema).await
        }
        async fn upsert_vacancies(&self, schema: &str, rows: &[VacancyRow]) -> Result<u64, StoreError> {
            self.0.upsert_vacancies(schema, rows).await
        }
        async fn upsert_skills(&self, _schema: &str, skills: &[String]) -> Result<u64, StoreError> {
            Ok(skills.len() as u64)
        }
        async fn skill_ids(&self, schema: &str, skills: &[String]) -> Result<Vec<SkillRow>, StoreError> {
            self.0.skill_ids(schema, skills).await
        }
        async fn upsert_vacancy_skills(
            &self,
            schema: &str,
            links: &[VacancySkillLink],
        ) -> Result<u64, StoreError> {
            self.0.upsert_vacancy_skills(schema, links).await
        }
        async fn vacancy_skills(&self, schema: &str) -> Result<Vec<VacancySkillRow>, StoreError> {
            self.0.vacancy_skills(schema).await
        }
        async fn companies(&self, schema: &str) -> Result<Vec<Company>, StoreError> {
            self.0.companies(schema).await
        }
        async fn insert_companies(&self, schema: &str, rows: &[Company]) -> Result<u64, StoreError> {
            self.0.insert_companies(schema, rows).await
        }
    }

    #[tokio::test]
    async fn read_back_miss_is_a_fault_and_writes_no_links() {
        let store = InvisibleWrites(MemoryStore::new());
        let batch = vec![vacancy("1", &["Rust"])];
        store.upsert_vacancies("s", &[batch[0].to_row()]).await.unwrap();

        let err = resolve_skills(&store, "s", &batch).await.unwrap_err();

        match err {
            ResolveError::Fault(fault) => assert_eq!(fault.missing, vec!["rust".to_string()]),
            other => panic!("expected resolution fault, got {other}"),
        }
        assert!(store.0.links("s").await.is_empty());
    }
}
