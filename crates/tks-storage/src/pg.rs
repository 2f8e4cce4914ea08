use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tks_core::{Company, SkillRow, VacancyId, VacancyRow, VacancySkillLink, VacancySkillRow};
use tracing::debug;

use crate::store::{Ident, SkillStore, StoreError, TableNames};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

/// Postgres-backed store. Batches are sent as parallel arrays through `UNNEST`
/// so each call is a single statement inside a single transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        tables: TableNames,
    ) -> Result<Self, StoreError> {
        tables.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool, tables })
    }

    fn qualified(&self, schema: &str, table: &str) -> Result<String, StoreError> {
        Ok(format!("{}.{}", Ident::parse(schema)?, Ident::parse(table)?))
    }
}

#[async_trait]
impl SkillStore for PgStore {
    async fn migrate(&self, schema: &str) -> Result<(), StoreError> {
        let schema = Ident::parse(schema)?;
        let ddl = SCHEMA_SQL
            .replace("{schema}", schema.as_str())
            .replace("{vacancies}", &self.tables.vacancies)
            .replace("{key_skills}", &self.tables.key_skills)
            .replace("{vacancy_key_skills}", &self.tables.vacancy_key_skills)
            .replace("{companies}", &self.tables.companies);
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_vacancies(&self, schema: &str, rows: &[VacancyRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = self.qualified(schema, &self.tables.vacancies)?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.as_str().to_string()).collect();
        let positions: Vec<String> = rows.iter().map(|r| r.position.clone()).collect();
        let employers: Vec<String> = rows.iter().map(|r| r.employer.clone()).collect();
        let cities: Vec<String> = rows.iter().map(|r| r.city.clone()).collect();
        let descriptions: Vec<String> = rows.iter().map(|r| r.description.clone()).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, position, employer, city, description)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[])
            ON CONFLICT (id) DO NOTHING
            "#
        ))
        .bind(&ids)
        .bind(&positions)
        .bind(&employers)
        .bind(&cities)
        .bind(&descriptions)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(%table, inserted = result.rows_affected(), "upserted vacancies");
        Ok(result.rows_affected())
    }

    async fn upsert_skills(&self, schema: &str, skills: &[String]) -> Result<u64, StoreError> {
        if skills.is_empty() {
            return Ok(0);
        }
        let table = self.qualified(schema, &self.tables.key_skills)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (skill)
            SELECT UNNEST($1::text[])
            ON CONFLICT (skill) DO NOTHING
            "#
        ))
        .bind(skills)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn skill_ids(&self, schema: &str, skills: &[String]) -> Result<Vec<SkillRow>, StoreError> {
        if skills.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.qualified(schema, &self.tables.key_skills)?;
        let rows = sqlx::query(&format!(
            "SELECT id, skill FROM {table} WHERE skill = ANY($1::text[])"
        ))
        .bind(skills)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, StoreError> {
                Ok(SkillRow {
                    id: row.try_get("id")?,
                    skill: row.try_get("skill")?,
                })
            })
            .collect()
    }

    async fn upsert_vacancy_skills(
        &self,
        schema: &str,
        links: &[VacancySkillLink],
    ) -> Result<u64, StoreError> {
        if links.is_empty() {
            return Ok(0);
        }
        let table = self.qualified(schema, &self.tables.vacancy_key_skills)?;
        let vacancy_ids: Vec<String> = links
            .iter()
            .map(|l| l.vacancy_id.as_str().to_string())
            .collect();
        let skill_ids: Vec<i64> = links.iter().map(|l| l.key_skill_id).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (vacancy_id, key_skill_id)
            SELECT * FROM UNNEST($1::text[], $2::int8[])
            ON CONFLICT (vacancy_id, key_skill_id) DO NOTHING
            "#
        ))
        .bind(&vacancy_ids)
        .bind(&skill_ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn vacancy_skills(&self, schema: &str) -> Result<Vec<VacancySkillRow>, StoreError> {
        let vacancies = self.qualified(schema, &self.tables.vacancies)?;
        let links = self.qualified(schema, &self.tables.vacancy_key_skills)?;
        let skills = self.qualified(schema, &self.tables.key_skills)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT v.id AS vacancy_id, v.employer, s.skill
            FROM {vacancies} v
                JOIN {links} vs ON v.id = vs.vacancy_id
                JOIN {skills} s ON vs.key_skill_id = s.id
            ORDER BY v.id, s.id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, StoreError> {
                let vacancy_id: String = row.try_get("vacancy_id")?;
                Ok(VacancySkillRow {
                    vacancy_id: VacancyId::new(vacancy_id),
                    employer: row.try_get("employer")?,
                    skill: row.try_get("skill")?,
                })
            })
            .collect()
    }

    async fn companies(&self, schema: &str) -> Result<Vec<Company>, StoreError> {
        let table = self.qualified(schema, &self.tables.companies)?;
        let rows = sqlx::query(&format!(
            "SELECT ogrn, inn, kpp, name, okved_code, source_filename FROM {table}"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, StoreError> {
                Ok(Company {
                    ogrn: row.try_get("ogrn")?,
                    inn: row.try_get("inn")?,
                    kpp: row.try_get("kpp")?,
                    name: row.try_get("name")?,
                    okved_code: row.try_get("okved_code")?,
                    source_filename: row.try_get("source_filename")?,
                })
            })
            .collect()
    }

    async fn insert_companies(&self, schema: &str, rows: &[Company]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = self.qualified(schema, &self.tables.companies)?;
        let ogrns: Vec<i64> = rows.iter().map(|r| r.ogrn).collect();
        let inns: Vec<i64> = rows.iter().map(|r| r.inn).collect();
        let kpps: Vec<i64> = rows.iter().map(|r| r.kpp).collect();
        let names: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();
        let codes: Vec<String> = rows.iter().map(|r| r.okved_code.clone()).collect();
        let files: Vec<String> = rows.iter().map(|r| r.source_filename.clone()).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (ogrn, inn, kpp, name, okved_code, source_filename)
            SELECT * FROM UNNEST($1::int8[], $2::int8[], $3::int8[], $4::text[], $5::text[], $6::text[])
            ON CONFLICT (ogrn) DO NOTHING
            "#
        ))
        .bind(&ogrns)
        .bind(&inns)
        .bind(&kpps)
        .bind(&names)
        .bind(&codes)
        .bind(&files)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }
}
