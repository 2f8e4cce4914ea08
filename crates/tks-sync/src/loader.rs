use tks_core::{CleanVacancy, VacancyRow};
use tks_storage::{SkillStore, StoreError};
use tracing::info;

/// Writes the batch's primary rows (skills stripped) in one transaction.
/// Ids already stored are left untouched.
pub async fn load_vacancies(
    store: &dyn SkillStore,
    schema: &str,
    batch: &[CleanVacancy],
) -> Result<u64, StoreError> {
    let rows: Vec<VacancyRow> = batch.iter().map(CleanVacancy::to_row).collect();
    let inserted = store.upsert_vacancies(schema, &rows).await?;
    info!(
        schema,
        batch = rows.len(),
        inserted,
        skipped = rows.len() as u64 - inserted,
        "loaded vacancies"
    );
    Ok(inserted)
}
