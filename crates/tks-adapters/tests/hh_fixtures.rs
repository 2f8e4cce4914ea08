use std::path::PathBuf;

use tks_adapters::{
    clean, parse_api_detail, parse_api_listing, parse_html_detail, parse_html_listing,
};
use tks_core::{Vacancy, VacancyId};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/hh")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn api_listing_fixture_projects_three_items() {
    let items = parse_api_listing(&fixture("api_listing.json"), "https://api.hh.ru/vacancies").unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].id, VacancyId::from("98765432"));
    assert_eq!(items[0].employer.as_deref(), Some("МТС"));
    assert_eq!(items[1].city.as_deref(), Some("Санкт-Петербург"));
    assert_eq!(items[2].employer, None);
    assert_eq!(
        items[0].detail_url,
        "https://api.hh.ru/vacancies/98765432?host=hh.ru"
    );
}

#[test]
fn api_detail_fixture_joins_skills_in_order() {
    let detail = parse_api_detail(
        &fixture("api_detail.json"),
        "https://api.hh.ru/vacancies/98765432",
    )
    .unwrap();

    assert_eq!(
        detail.key_skills.as_deref(),
        Some("Python|PostgreSQL|Django Framework|Docker")
    );
    assert!(detail.description.unwrap().starts_with("<p>"));
}

#[test]
fn html_listing_fixture_reads_embedded_state() {
    let items = parse_html_listing(&fixture("html_listing.html"), "https://hh.ru/search/vacancy").unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, VacancyId::from("98765432"));
    assert_eq!(items[1].employer.as_deref(), Some("Яндекс"));
    assert_eq!(items[1].detail_url, "https://hh.ru/vacancy/98765435");
}

#[test]
fn html_detail_fixture_takes_only_the_first_tag_list() {
    let detail = parse_html_detail(&fixture("html_detail.html"), "https://hh.ru/vacancy/98765432").unwrap();

    assert_eq!(detail.key_skills.as_deref(), Some("Python|PostgreSQL|Linux"));
    assert!(detail.description.unwrap().contains("Разработка сервисов биллинга."));
}

#[test]
fn fixture_listing_and_detail_clean_into_a_batch() {
    let items = parse_api_listing(&fixture("api_listing.json"), "https://api.hh.ru/vacancies").unwrap();
    let detail = parse_api_detail(&fixture("api_detail.json"), "https://api.hh.ru/vacancies/98765432").unwrap();

    let vacancies: Vec<Vacancy> = items
        .into_iter()
        .map(|item| Vacancy::from(item).with_detail(detail.clone()))
        .collect();
    let batch = clean(vacancies, 100);

    // the third item has no employer
    assert_eq!(batch.vacancies.len(), 2);
    assert_eq!(batch.dropped, 1);
    assert_eq!(batch.vacancies[0].key_skills.len(), 4);
}
