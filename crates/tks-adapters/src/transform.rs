use tks_core::{CleanVacancy, Vacancy, SKILL_DELIMITER};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CleanBatch {
    pub vacancies: Vec<CleanVacancy>,
    /// Records dropped for a missing required field.
    pub dropped: usize,
    /// Complete records cut off by the limit.
    pub truncated: usize,
}

/// Splits a raw `|`-joined skills string. Tokens are trimmed and empty ones
/// discarded; case is left alone.
pub fn split_skills(raw: &str) -> Vec<String> {
    raw.split(SKILL_DELIMITER)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn complete(vacancy: Vacancy) -> Option<CleanVacancy> {
    Some(CleanVacancy {
        position: vacancy.position?,
        employer: vacancy.employer?,
        city: vacancy.city?,
        description: vacancy.description?,
        key_skills: split_skills(&vacancy.key_skills?),
        id: vacancy.id,
    })
}

/// Drops records with any absent field, keeps the first `limit` survivors in
/// arrival order and splits their skills.
pub fn clean(vacancies: Vec<Vacancy>, limit: usize) -> CleanBatch {
    let total = vacancies.len();
    let complete: Vec<CleanVacancy> = vacancies.into_iter().filter_map(complete).collect();
    let dropped = total - complete.len();
    let truncated = complete.len().saturating_sub(limit);

    let vacancies: Vec<CleanVacancy> = complete.into_iter().take(limit).collect();
    debug!(kept = vacancies.len(), dropped, truncated, "cleaned vacancy batch");

    CleanBatch {
        vacancies,
        dropped,
        truncated,
    }
}
