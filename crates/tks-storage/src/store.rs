use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tks_core::{Company, SkillRow, VacancyRow, VacancySkillLink, VacancySkillRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("foreign key violation on {table}: {detail}")]
    ForeignKey { table: String, detail: String },
}

/// A schema or table name that is safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(String);

impl Ident {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut chars = raw.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid_head && valid_tail && raw.len() <= 63 {
            Ok(Self(raw.to_string()))
        } else {
            Err(StoreError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub vacancies: String,
    pub key_skills: String,
    pub vacancy_key_skills: String,
    pub companies: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            vacancies: "vacancies".to_string(),
            key_skills: "key_skills".to_string(),
            vacancy_key_skills: "vacancies_key_skills".to_string(),
            companies: "telecom_companies".to_string(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> Result<(), StoreError> {
        for name in [
            &self.vacancies,
            &self.key_skills,
            &self.vacancy_key_skills,
            &self.companies,
        ] {
            Ident::parse(name)?;
        }
        Ok(())
    }
}

/// The four relations the pipeline reads and writes, addressed by schema.
///
/// Every write is an upsert that skips rows violating a uniqueness constraint
/// and runs as one transaction: either the whole batch is visible or none of it.
#[async_trait]
pub trait SkillStore: Send + Sync {
    /// Create the schema and relations if missing.
    async fn migrate(&self, schema: &str) -> Result<(), StoreError>;

    /// `ON CONFLICT (id) DO NOTHING`. Returns the number of new rows.
    async fn upsert_vacancies(&self, schema: &str, rows: &[VacancyRow]) -> Result<u64, StoreError>;

    /// `ON CONFLICT (skill) DO NOTHING`; existing surrogate keys are never touched.
    async fn upsert_skills(&self, schema: &str, skills: &[String]) -> Result<u64, StoreError>;

    /// Reads back `(id, skill)` for the requested values that exist.
    async fn skill_ids(&self, schema: &str, skills: &[String]) -> Result<Vec<SkillRow>, StoreError>;

    /// `ON CONFLICT (vacancy_id, key_skill_id) DO NOTHING`.
    async fn upsert_vacancy_skills(
        &self,
        schema: &str,
        links: &[VacancySkillLink],
    ) -> Result<u64, StoreError>;

    /// Vacancies joined with their links and skill values.
    async fn vacancy_skills(&self, schema: &str) -> Result<Vec<VacancySkillRow>, StoreError>;

    async fn companies(&self, schema: &str) -> Result<Vec<Company>, StoreError>;

    /// Append registry companies, skipping already known `ogrn` values.
    async fn insert_companies(&self, schema: &str, rows: &[Company]) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_injection() {
        assert!(Ident::parse("hw3_prod").is_ok());
        assert!(Ident::parse("_scratch2").is_ok());
        assert!(Ident::parse("").is_err());
        assert!(Ident::parse("2fast").is_err());
        assert!(Ident::parse("Public").is_err());
        assert!(Ident::parse("x; DROP TABLE vacancies").is_err());
    }

    #[test]
    fn default_table_names_are_valid() {
        TableNames::default().validate().expect("defaults validate");
    }
}
