//! Company registry bulk load: a zip archive of JSON members, each an array
//! of company records. Members are independent, so they are read, filtered
//! and written by a bounded pool of workers.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tks_core::Company;
use tks_storage::{Downloader, SkillStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RegistryLoadOptions {
    /// Primary activity code to keep, e.g. `61` keeps `61` and `61.x`.
    pub okved_code: String,
    pub workers: usize,
    /// Read only the first `n` members.
    pub max_files: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryLoadSummary {
    pub files: usize,
    pub files_with_matches: usize,
    pub companies_matched: usize,
    pub companies_inserted: u64,
}

#[derive(Debug, Deserialize)]
struct RawCompany {
    ogrn: Option<Value>,
    inn: Option<Value>,
    kpp: Option<Value>,
    name: Option<String>,
    data: Option<RawCompanyData>,
}

#[derive(Debug, Deserialize)]
struct RawCompanyData {
    #[serde(rename = "СвОКВЭД")]
    okved: Option<RawOkved>,
}

#[derive(Debug, Deserialize)]
struct RawOkved {
    #[serde(rename = "СвОКВЭДОсн")]
    primary: Option<RawOkvedEntry>,
}

#[derive(Debug, Deserialize)]
struct RawOkvedEntry {
    #[serde(rename = "КодОКВЭД")]
    code: Option<String>,
}

/// Registry ids arrive as numbers or numeric strings; empty means absent.
fn registry_number(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn okved_matches(code: &str, primary: &str) -> bool {
    code == primary
        || code
            .strip_prefix(primary)
            .is_some_and(|rest| rest.starts_with('.'))
}

impl RawCompany {
    fn okved_code(&self) -> Option<String> {
        self.data
            .as_ref()?
            .okved
            .as_ref()?
            .primary
            .as_ref()?
            .code
            .clone()
    }

    fn into_company(self, okved_code: String, source_filename: &str) -> Option<Company> {
        Some(Company {
            ogrn: registry_number(self.ogrn.as_ref())?,
            inn: registry_number(self.inn.as_ref())?,
            kpp: registry_number(self.kpp.as_ref())?,
            name: non_empty(self.name)?,
            okved_code,
            source_filename: source_filename.to_string(),
        })
    }
}

/// Member names in archive order, truncated to `max_files`.
pub fn list_members(archive: &Path, max_files: Option<usize>) -> Result<Vec<String>> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let zip = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("reading zip directory of {}", archive.display()))?;
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    if let Some(max) = max_files {
        names.truncate(max);
    }
    Ok(names)
}

/// Companies of one member whose primary code matches and whose fields are
/// all present.
pub fn read_member(archive: &Path, member: &str, okved_code: &str) -> Result<Vec<Company>> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("reading zip directory of {}", archive.display()))?;
    let entry = zip
        .by_name(member)
        .with_context(|| format!("opening member {member}"))?;
    let records: Vec<RawCompany> = serde_json::from_reader(BufReader::new(entry))
        .with_context(|| format!("parsing member {member}"))?;

    Ok(records
        .into_iter()
        .filter_map(|record| {
            let code = record.okved_code().filter(|c| okved_matches(c, okved_code))?;
            record.into_company(code, member)
        })
        .collect())
}

/// Loads every member into `schema`. A failing member fails the load; rows
/// already written by other members stay, and a rerun skips them by `ogrn`.
pub async fn load_registry(
    store: Arc<dyn SkillStore>,
    schema: &str,
    archive: &Path,
    options: &RegistryLoadOptions,
) -> Result<RegistryLoadSummary> {
    let members = {
        let archive = archive.to_path_buf();
        let max_files = options.max_files;
        tokio::task::spawn_blocking(move || list_members(&archive, max_files))
            .await
            .context("listing registry members")??
    };
    info!(archive = %archive.display(), members = members.len(), "loading company registry");

    let limit = Arc::new(Semaphore::new(options.workers.max(1)));
    let mut workers = JoinSet::new();
    for member in members.iter().cloned() {
        let limit = Arc::clone(&limit);
        let store = Arc::clone(&store);
        let archive: PathBuf = archive.to_path_buf();
        let schema = schema.to_string();
        let okved_code = options.okved_code.clone();

        workers.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|e| anyhow!("worker pool closed: {e}"))?;
            load_member(store.as_ref(), &schema, archive, member, okved_code).await
        });
    }

    let mut summary = RegistryLoadSummary {
        files: members.len(),
        ..Default::default()
    };
    while let Some(joined) = workers.join_next().await {
        let (matched, inserted) = joined.context("registry worker panicked")??;
        if matched > 0 {
            summary.files_with_matches += 1;
        }
        summary.companies_matched += matched;
        summary.companies_inserted += inserted;
    }

    info!(
        files = summary.files,
        files_with_matches = summary.files_with_matches,
        companies_inserted = summary.companies_inserted,
        "company registry loaded"
    );
    Ok(summary)
}

async fn load_member(
    store: &dyn SkillStore,
    schema: &str,
    archive: PathBuf,
    member: String,
    okved_code: String,
) -> Result<(usize, u64)> {
    let read_name = member.clone();
    let companies = tokio::task::spawn_blocking(move || read_member(&archive, &read_name, &okved_code))
        .await
        .with_context(|| format!("reading member {member}"))??;

    if companies.is_empty() {
        debug!(%member, "no matching companies in member");
        return Ok((0, 0));
    }
    let inserted = store
        .insert_companies(schema, &companies)
        .await
        .with_context(|| format!("inserting companies from {member}"))?;
    info!(%member, matched = companies.len(), inserted, "loaded registry member");
    Ok((companies.len(), inserted))
}

/// Downloads the archive when it is missing and a URL is configured.
pub async fn ensure_archive(downloader: &Downloader, archive: &Path, url: Option<&str>) -> Result<()> {
    if archive.exists() {
        return Ok(());
    }
    let url = url.ok_or_else(|| {
        anyhow!(
            "registry archive {} is missing and no download url is configured",
            archive.display()
        )
    })?;

    info!(%url, path = %archive.display(), "downloading company registry");
    downloader
        .download_to(url, archive)
        .await
        .with_context(|| format!("downloading company registry from {url}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tks_storage::MemoryStore;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn company_json(ogrn: i64, name: &str, code: Option<&str>) -> Value {
        let data = match code {
            Some(code) => serde_json::json!({"СвОКВЭД": {"СвОКВЭДОсн": {"КодОКВЭД": code}}}),
            None => serde_json::json!({}),
        };
        serde_json::json!({
            "ogrn": ogrn,
            "inn": format!("77{ogrn}"),
            "kpp": 770101001,
            "name": name,
            "data": data,
        })
    }

    fn write_archive(path: &Path, members: &[(&str, Vec<Value>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, records) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(serde_json::to_string(records).unwrap().as_bytes())
                .unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn okved_prefix_requires_a_dot_boundary() {
        assert!(okved_matches("61", "61"));
        assert!(okved_matches("61.10", "61"));
        assert!(okved_matches("61.10.1", "61"));
        assert!(!okved_matches("611", "61"));
        assert!(!okved_matches("62.01", "61"));
    }

    #[test]
    fn member_filter_keeps_complete_telecom_companies() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("egrul.json.zip");
        write_archive(
            &archive,
            &[(
                "egrul_1.json",
                vec![
                    company_json(1027700000001, r#"ПАО "МТС""#, Some("61.10")),
                    company_json(1027700000002, r#"ООО "Софт""#, Some("62.01")),
                    company_json(1027700000003, "", Some("61")),
                    company_json(1027700000004, r#"ООО "Связь""#, None),
                    company_json(1027700000005, r#"АО "Линк""#, Some("61")),
                ],
            )],
        );

        let companies = read_member(&archive, "egrul_1.json", "61").unwrap();

        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].ogrn, 1027700000001);
        assert_eq!(companies[0].okved_code, "61.10");
        assert_eq!(companies[0].inn, 771027700000001);
        assert_eq!(companies[1].source_filename, "egrul_1.json");
    }

    #[tokio::test]
    async fn load_respects_max_files_and_skips_known_ogrn() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("egrul.json.zip");
        write_archive(
            &archive,
            &[
                ("a.json", vec![company_json(1, r#"ПАО "МТС""#, Some("61.10"))]),
                ("b.json", vec![company_json(2, r#"ООО "Софт""#, Some("62.01"))]),
                ("c.json", vec![company_json(3, r#"АО "Линк""#, Some("61"))]),
            ],
        );
        let store: Arc<dyn SkillStore> = Arc::new(MemoryStore::new());
        let options = RegistryLoadOptions {
            okved_code: "61".into(),
            workers: 2,
            max_files: Some(2),
        };

        let first = load_registry(Arc::clone(&store), "hw1", &archive, &options)
            .await
            .unwrap();
        assert_eq!(first.files, 2);
        assert_eq!(first.files_with_matches, 1);
        assert_eq!(first.companies_inserted, 1);

        let all = RegistryLoadOptions {
            max_files: None,
            ..options
        };
        let second = load_registry(Arc::clone(&store), "hw1", &archive, &all)
            .await
            .unwrap();
        assert_eq!(second.companies_matched, 2);
        assert_eq!(second.companies_inserted, 1);
        assert_eq!(store.companies("hw1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn present_archive_is_not_downloaded_again() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("egrul.json.zip");
        write_archive(&archive, &[("a.json", Vec::new())]);
        let before = std::fs::read(&archive).unwrap();
        let downloader = Downloader::new(&Default::default()).unwrap();

        ensure_archive(&downloader, &archive, Some("http://127.0.0.1:9/unreachable.zip"))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&archive).unwrap(), before);
    }

    #[tokio::test]
    async fn missing_archive_without_url_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("egrul.json.zip");
        let downloader = Downloader::new(&Default::default()).unwrap();

        let err = ensure_archive(&downloader, &archive, None).await.unwrap_err();

        assert!(err.to_string().contains("no download url"));
        assert!(!archive.exists());
    }

    #[test]
    fn missing_archive_is_reported() {
        let err = list_members(Path::new("/nonexistent/egrul.zip"), None).unwrap_err();
        assert!(err.to_string().contains("opening"));
    }
}
