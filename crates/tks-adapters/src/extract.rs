//! Field projection for listing and detail payloads. Pure functions, no I/O.

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tks_core::{ListingItem, VacancyDetail, VacancyId, SKILL_DELIMITER};

use crate::{ListingBatch, RetrievalError, HTML_STATE_TEMPLATE_ID};

const HTML_DESCRIPTION_SELECTOR: &str = r#"div[data-qa="vacancy-description"]"#;
const HTML_SKILL_LIST_SELECTOR: &str = "div.bloko-tag-list";
const HTML_SKILL_TAG_QA: &str = "bloko-tag bloko-tag_inline skills-element";

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: Option<String>,
}

fn flatten_name(value: Option<NamedRef>) -> Option<String> {
    value.and_then(|v| v.name)
}

#[derive(Debug, Deserialize)]
struct ApiListingPage {
    items: Vec<ApiListingItem>,
}

#[derive(Debug, Deserialize)]
struct ApiListingItem {
    id: VacancyId,
    name: Option<String>,
    employer: Option<NamedRef>,
    area: Option<NamedRef>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiDetail {
    description: Option<String>,
    #[serde(default)]
    key_skills: Option<Vec<NamedRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HtmlInitialState {
    vacancy_search_result: HtmlSearchResult,
}

#[derive(Debug, Deserialize)]
struct HtmlSearchResult {
    #[serde(default)]
    vacancies: Vec<HtmlVacancy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HtmlVacancy {
    vacancy_id: VacancyId,
    name: Option<String>,
    company: Option<NamedRef>,
    area: Option<NamedRef>,
    links: Option<HtmlLinks>,
}

#[derive(Debug, Deserialize)]
struct HtmlLinks {
    desktop: Option<String>,
}

fn join_skills(names: impl IntoIterator<Item = String>) -> Option<String> {
    let names: Vec<String> = names.into_iter().collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(&SKILL_DELIMITER.to_string()))
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(raw: &str, url: &str) -> Result<Selector, RetrievalError> {
    Selector::parse(raw).map_err(|e| RetrievalError::malformed(url, e))
}

/// `items[]` of an API search page: `employer.name` and `area.name` are flattened.
pub fn parse_api_listing(body: &str, url: &str) -> Result<ListingBatch, RetrievalError> {
    let page: ApiListingPage =
        serde_json::from_str(body).map_err(|e| RetrievalError::malformed(url, e))?;
    Ok(page
        .items
        .into_iter()
        .map(|item| ListingItem {
            id: item.id,
            position: item.name,
            employer: flatten_name(item.employer),
            city: flatten_name(item.area),
            detail_url: item.url,
        })
        .collect())
}

pub fn parse_api_detail(body: &str, url: &str) -> Result<VacancyDetail, RetrievalError> {
    let detail: ApiDetail =
        serde_json::from_str(body).map_err(|e| RetrievalError::malformed(url, e))?;
    Ok(VacancyDetail {
        description: detail.description,
        key_skills: join_skills(
            detail
                .key_skills
                .unwrap_or_default()
                .into_iter()
                .filter_map(|s| s.name),
        ),
    })
}

/// Search page markup: the vacancies live in the JSON state of
/// `<template id="HH-Lux-InitialState">`.
pub fn parse_html_listing(body: &str, url: &str) -> Result<ListingBatch, RetrievalError> {
    let document = Html::parse_document(body);
    let template_sel = selector(&format!("template#{HTML_STATE_TEMPLATE_ID}"), url)?;
    let state_text = document
        .select(&template_sel)
        .next()
        .map(|n| n.text().collect::<String>())
        .ok_or_else(|| {
            RetrievalError::malformed(url, format!("no template#{HTML_STATE_TEMPLATE_ID}"))
        })?;

    let state: HtmlInitialState =
        serde_json::from_str(state_text.trim()).map_err(|e| RetrievalError::malformed(url, e))?;

    state
        .vacancy_search_result
        .vacancies
        .into_iter()
        .map(|v| -> Result<ListingItem, RetrievalError> {
            let detail_url = v.links.and_then(|l| l.desktop).ok_or_else(|| {
                RetrievalError::malformed(url, format!("vacancy {} has no desktop link", v.vacancy_id))
            })?;
            Ok(ListingItem {
                id: v.vacancy_id,
                position: v.name,
                employer: flatten_name(v.company),
                city: flatten_name(v.area),
                detail_url,
            })
        })
        .collect()
}

pub fn parse_html_detail(body: &str, url: &str) -> Result<VacancyDetail, RetrievalError> {
    let document = Html::parse_document(body);

    let description_sel = selector(HTML_DESCRIPTION_SELECTOR, url)?;
    let description = document
        .select(&description_sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()));

    // only direct children of the first tag list are skills
    let list_sel = selector(HTML_SKILL_LIST_SELECTOR, url)?;
    let skills = document
        .select(&list_sel)
        .next()
        .map(|list| {
            list.children()
                .filter_map(ElementRef::wrap)
                .filter(|el| {
                    el.value().name() == "div" && el.value().attr("data-qa") == Some(HTML_SKILL_TAG_QA)
                })
                .filter_map(|el| text_or_none(el.text().collect::<String>()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(VacancyDetail {
        description,
        key_skills: join_skills(skills),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_listing_flattens_nested_names() {
        let body = r#"{"items":[
            {"id":"101","name":"Middle Python Developer","employer":{"name":"Acme"},"area":{"name":"Moscow"},"url":"https://api.hh.ru/vacancies/101"},
            {"id":"102","name":"Python Engineer","employer":null,"area":{"name":"Kazan"},"url":"https://api.hh.ru/vacancies/102"}
        ],"found":2,"pages":1,"page":0}"#;

        let items = parse_api_listing(body, "https://api.hh.ru/vacancies").expect("parse");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].employer.as_deref(), Some("Acme"));
        assert_eq!(items[0].city.as_deref(), Some("Moscow"));
        assert_eq!(items[1].employer, None);
        assert_eq!(items[1].detail_url, "https://api.hh.ru/vacancies/102");
    }

    #[test]
    fn api_listing_without_items_is_malformed() {
        let err = parse_api_listing(r#"{"errors":[]}"#, "https://api.hh.ru/vacancies").unwrap_err();
        assert!(matches!(err, RetrievalError::Malformed { .. }));
    }

    #[test]
    fn api_detail_joins_skills_with_pipe() {
        let body = r#"{"description":"<p>Backend</p>","key_skills":[{"name":"Python"},{"name":"SQL"},{"name":"Docker"}]}"#;
        let detail = parse_api_detail(body, "u").expect("parse");
        assert_eq!(detail.key_skills.as_deref(), Some("Python|SQL|Docker"));
        assert_eq!(detail.description.as_deref(), Some("<p>Backend</p>"));
    }

    #[test]
    fn api_detail_with_no_skills_has_none() {
        let detail = parse_api_detail(r#"{"description":"x","key_skills":[]}"#, "u").expect("parse");
        assert_eq!(detail.key_skills, None);
        let detail = parse_api_detail(r#"{"description":"x","key_skills":null}"#, "u").expect("parse");
        assert_eq!(detail.key_skills, None);
    }

    #[test]
    fn html_listing_without_state_template_is_malformed() {
        let err = parse_html_listing("<html><body></body></html>", "u").unwrap_err();
        assert!(matches!(err, RetrievalError::Malformed { .. }));
    }

    #[test]
    fn html_detail_reads_only_skill_tags() {
        let body = r#"<html><body>
            <div data-qa="vacancy-description"><p>Build services</p></div>
            <div class="bloko-tag-list">
              <div data-qa="bloko-tag bloko-tag_inline skills-element">Python</div>
              <div data-qa="bloko-tag bloko-tag_inline">not a skill</div>
              <div data-qa="bloko-tag bloko-tag_inline skills-element"> Django </div>
            </div>
        </body></html>"#;
        let detail = parse_html_detail(body, "u").expect("parse");
        assert_eq!(detail.description.as_deref(), Some("Build services"));
        assert_eq!(detail.key_skills.as_deref(), Some("Python|Django"));
    }
}
