//! Core domain model for the top-key-skills pipeline.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "tks-core";

/// Delimiter used for the raw multi-valued key skills string.
pub const SKILL_DELIMITER: char = '|';

/// Source-assigned vacancy id. The API sends strings, the HTML state sends integers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VacancyId(String);

impl VacancyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VacancyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VacancyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for VacancyId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for VacancyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(n) => Self(n.to_string()),
        })
    }
}

/// One entry of a listing page after field projection and flattening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    pub id: VacancyId,
    pub position: Option<String>,
    pub employer: Option<String>,
    pub city: Option<String>,
    /// Where the per-item detail payload is fetched from.
    pub detail_url: String,
}

/// Payload of the per-item detail round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyDetail {
    pub description: Option<String>,
    /// `|`-joined skill names, `None` when the vacancy lists none.
    pub key_skills: Option<String>,
}

/// A vacancy record as it moves through extraction. `description` and
/// `key_skills` stay empty until the detail fetch completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vacancy {
    pub id: VacancyId,
    pub position: Option<String>,
    pub employer: Option<String>,
    pub city: Option<String>,
    pub detail_url: String,
    pub description: Option<String>,
    pub key_skills: Option<String>,
}

impl From<ListingItem> for Vacancy {
    fn from(item: ListingItem) -> Self {
        Self {
            id: item.id,
            position: item.position,
            employer: item.employer,
            city: item.city,
            detail_url: item.detail_url,
            description: None,
            key_skills: None,
        }
    }
}

impl Vacancy {
    /// Returns a new record with the detail fields filled in.
    pub fn with_detail(self, detail: VacancyDetail) -> Self {
        Self {
            description: detail.description,
            key_skills: detail.key_skills,
            ..self
        }
    }
}

/// A vacancy accepted by the transformer: every required field present and the
/// raw skills string split into tokens (not yet normalized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanVacancy {
    pub id: VacancyId,
    pub position: String,
    pub employer: String,
    pub city: String,
    pub description: String,
    pub key_skills: Vec<String>,
}

impl CleanVacancy {
    pub fn to_row(&self) -> VacancyRow {
        VacancyRow {
            id: self.id.clone(),
            position: self.position.clone(),
            employer: self.employer.clone(),
            city: self.city.clone(),
            description: self.description.clone(),
        }
    }
}

/// Row of the primary `vacancies` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyRow {
    pub id: VacancyId,
    pub position: String,
    pub employer: String,
    pub city: String,
    pub description: String,
}

/// Row of the `key_skills` dimension: storage-assigned id plus normalized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRow {
    pub id: i64,
    pub skill: String,
}

/// Row of the `vacancies_key_skills` junction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VacancySkillLink {
    pub vacancy_id: VacancyId,
    pub key_skill_id: i64,
}

/// A company from the state registry, filtered by its primary activity code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub ogrn: i64,
    pub inn: i64,
    pub kpp: i64,
    pub name: String,
    pub okved_code: String,
    pub source_filename: String,
}

/// One (vacancy, employer, skill) triple read back for the report join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancySkillRow {
    pub vacancy_id: VacancyId,
    pub employer: String,
    pub skill: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedVacancy {
    pub vacancy_id: VacancyId,
    pub employer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCount {
    pub skill: String,
    pub count: u64,
}

/// Result of the report join: how many vacancies matched a registry company and
/// which skills they ask for most.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TopSkillsReport {
    pub match_count: usize,
    pub matched_vacancies: Vec<MatchedVacancy>,
    pub top_skills: Vec<SkillCount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vacancy_id_accepts_strings_and_numbers() {
        let from_text: VacancyId = serde_json::from_str("\"93353083\"").expect("text id");
        let from_number: VacancyId = serde_json::from_str("93353083").expect("numeric id");
        assert_eq!(from_text, from_number);
        assert_eq!(from_text.as_str(), "93353083");
    }

    #[test]
    fn detail_fill_keeps_listing_fields() {
        let vacancy = Vacancy::from(ListingItem {
            id: VacancyId::from("1"),
            position: Some("Middle Python Developer".into()),
            employer: Some("Acme".into()),
            city: Some("Moscow".into()),
            detail_url: "https://api.hh.ru/vacancies/1".into(),
        });
        assert!(vacancy.description.is_none());

        let filled = vacancy.with_detail(VacancyDetail {
            description: Some("<p>backend</p>".into()),
            key_skills: Some("Python|SQL".into()),
        });
        assert_eq!(filled.employer.as_deref(), Some("Acme"));
        assert_eq!(filled.key_skills.as_deref(), Some("Python|SQL"));
    }
}
