use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tks_core::{Company, SkillRow, VacancyId, VacancyRow, VacancySkillLink, VacancySkillRow};
use tokio::sync::Mutex;

use crate::store::{Ident, SkillStore, StoreError};

#[derive(Debug, Default)]
struct SchemaTables {
    vacancies: BTreeMap<VacancyId, VacancyRow>,
    key_skills: BTreeMap<String, i64>,
    next_skill_id: i64,
    vacancy_key_skills: BTreeSet<(VacancyId, i64)>,
    companies: BTreeMap<i64, Company>,
}

/// In-process store with the same uniqueness and foreign-key rules as the
/// Postgres schema. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    schemas: Mutex<HashMap<String, SchemaTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn vacancy_count(&self, schema: &str) -> usize {
        let schemas = self.schemas.lock().await;
        schemas.get(schema).map_or(0, |t| t.vacancies.len())
    }

    pub async fn vacancies(&self, schema: &str) -> Vec<VacancyRow> {
        let schemas = self.schemas.lock().await;
        schemas
            .get(schema)
            .map(|t| t.vacancies.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn skills(&self, schema: &str) -> Vec<SkillRow> {
        let schemas = self.schemas.lock().await;
        schemas
            .get(schema)
            .map(|t| {
                t.key_skills
                    .iter()
                    .map(|(skill, id)| SkillRow {
                        id: *id,
                        skill: skill.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn links(&self, schema: &str) -> Vec<VacancySkillLink> {
        let schemas = self.schemas.lock().await;
        schemas
            .get(schema)
            .map(|t| {
                t.vacancy_key_skills
                    .iter()
                    .map(|(vacancy_id, key_skill_id)| VacancySkillLink {
                        vacancy_id: vacancy_id.clone(),
                        key_skill_id: *key_skill_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SkillStore for MemoryStore {
    async fn migrate(&self, schema: &str) -> Result<(), StoreError> {
        Ident::parse(schema)?;
        self.schemas
            .lock()
            .await
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert_vacancies(&self, schema: &str, rows: &[VacancyRow]) -> Result<u64, StoreError> {
        Ident::parse(schema)?;
        let mut schemas = self.schemas.lock().await;
        let tables = schemas.entry(schema.to_string()).or_default();
        let mut inserted = 0;
        for row in rows {
            if !tables.vacancies.contains_key(&row.id) {
                tables.vacancies.insert(row.id.clone(), row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_skills(&self, schema: &str, skills: &[String]) -> Result<u64, StoreError> {
        Ident::parse(schema)?;
        let mut schemas = self.schemas.lock().await;
        let tables = schemas.entry(schema.to_string()).or_default();
        let mut inserted = 0;
        for skill in skills {
            if !tables.key_skills.contains_key(skill) {
                tables.next_skill_id += 1;
                tables.key_skills.insert(skill.clone(), tables.next_skill_id);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn skill_ids(&self, schema: &str, skills: &[String]) -> Result<Vec<SkillRow>, StoreError> {
        Ident::parse(schema)?;
        let schemas = self.schemas.lock().await;
        let Some(tables) = schemas.get(schema) else {
            return Ok(Vec::new());
        };
        let wanted: BTreeSet<&String> = skills.iter().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|skill| {
                tables.key_skills.get(skill).map(|id| SkillRow {
                    id: *id,
                    skill: skill.clone(),
                })
            })
            .collect())
    }

    async fn upsert_vacancy_skills(
        &self,
        schema: &str,
        links: &[VacancySkillLink],
    ) -> Result<u64, StoreError> {
        Ident::parse(schema)?;
        let mut schemas = self.schemas.lock().await;
        let tables = schemas.entry(schema.to_string()).or_default();

        // validate the whole batch first so a violation leaves nothing behind
        let known_skill_ids: BTreeSet<i64> = tables.key_skills.values().copied().collect();
        for link in links {
            if !tables.vacancies.contains_key(&link.vacancy_id) {
                return Err(StoreError::ForeignKey {
                    table: "vacancies_key_skills".to_string(),
                    detail: format!("vacancy {} does not exist", link.vacancy_id),
                });
            }
            if !known_skill_ids.contains(&link.key_skill_id) {
                return Err(StoreError::ForeignKey {
                    table: "vacancies_key_skills".to_string(),
                    detail: format!("key skill id {} does not exist", link.key_skill_id),
                });
            }
        }

        let mut inserted = 0;
        for link in links {
            if tables
                .vacancy_key_skills
                .insert((link.vacancy_id.clone(), link.key_skill_id))
            {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn vacancy_skills(&self, schema: &str) -> Result<Vec<VacancySkillRow>, StoreError> {
        Ident::parse(schema)?;
        let schemas = self.schemas.lock().await;
        let Some(tables) = schemas.get(schema) else {
            return Ok(Vec::new());
        };
        let skill_by_id: BTreeMap<i64, &String> =
            tables.key_skills.iter().map(|(skill, id)| (*id, skill)).collect();

        Ok(tables
            .vacancy_key_skills
            .iter()
            .filter_map(|(vacancy_id, skill_id)| {
                let vacancy = tables.vacancies.get(vacancy_id)?;
                let skill = skill_by_id.get(skill_id)?;
                Some(VacancySkillRow {
                    vacancy_id: vacancy_id.clone(),
                    employer: vacancy.employer.clone(),
                    skill: (*skill).clone(),
                })
            })
            .collect())
    }

    async fn companies(&self, schema: &str) -> Result<Vec<Company>, StoreError> {
        Ident::parse(schema)?;
        let schemas = self.schemas.lock().await;
        Ok(schemas
            .get(schema)
            .map(|t| t.companies.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_companies(&self, schema: &str, rows: &[Company]) -> Result<u64, StoreError> {
        Ident::parse(schema)?;
        let mut schemas = self.schemas.lock().await;
        let tables = schemas.entry(schema.to_string()).or_default();
        let mut inserted = 0;
        for row in rows {
            if !tables.companies.contains_key(&row.ogrn) {
                tables.companies.insert(row.ogrn, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
