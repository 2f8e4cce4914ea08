use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tks_core::{Company, MatchedVacancy, SkillCount, TopSkillsReport, VacancyId, VacancySkillRow};
use tokio::fs;
use uuid::Uuid;

pub const TOP_SKILLS_LIMIT: usize = 10;

/// Join key for a registry company: the lower-cased name's first
/// quote-delimited segment (`ООО "РОМАШКА"` → `ромашка`). Names without a
/// quoted part never match.
pub fn company_join_key(name: &str) -> Option<String> {
    name.to_lowercase()
        .split('"')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub fn employer_join_key(employer: &str) -> String {
    employer.to_lowercase()
}

/// Vacancies whose employer matches a registry company, and the skills those
/// vacancies ask for most. Ranking is count descending, then skill ascending.
pub fn compute_top_skills(rows: &[VacancySkillRow], companies: &[Company]) -> TopSkillsReport {
    let company_keys: HashSet<String> = companies
        .iter()
        .filter_map(|c| company_join_key(&c.name))
        .collect();

    let mut matched_ids: HashSet<&VacancyId> = HashSet::new();
    let mut matched_vacancies = Vec::new();
    for row in rows {
        if company_keys.contains(&employer_join_key(&row.employer))
            && matched_ids.insert(&row.vacancy_id)
        {
            matched_vacancies.push(MatchedVacancy {
                vacancy_id: row.vacancy_id.clone(),
                employer: row.employer.clone(),
            });
        }
    }

    let mut counts: HashMap<&str, u64> = HashMap::new();
    for row in rows.iter().filter(|r| matched_ids.contains(&r.vacancy_id)) {
        *counts.entry(row.skill.as_str()).or_default() += 1;
    }

    let mut top_skills: Vec<SkillCount> = counts
        .into_iter()
        .map(|(skill, count)| SkillCount {
            skill: skill.to_string(),
            count,
        })
        .collect();
    top_skills.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.skill.cmp(&b.skill)));
    top_skills.truncate(TOP_SKILLS_LIMIT);

    TopSkillsReport {
        match_count: matched_vacancies.len(),
        matched_vacancies,
        top_skills,
    }
}

pub fn render_markdown(
    environment: &str,
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    report: &TopSkillsReport,
) -> String {
    let mut lines = vec![
        "# Top Key Skills".to_string(),
        String::new(),
        format!("- Environment: `{environment}`"),
        format!("- Run ID: `{run_id}`"),
        format!("- Generated: {generated_at}"),
        format!("- Matched vacancies: {}", report.match_count),
        String::new(),
    ];

    if report.top_skills.is_empty() {
        lines.push("No vacancies matched a registry company.".to_string());
        lines.push(String::new());
        return lines.join("\n");
    }

    lines.push("## Ranking".to_string());
    lines.push(String::new());
    lines.push("| # | Skill | Vacancies |".to_string());
    lines.push("|---|---|---|".to_string());
    for (rank, entry) in report.top_skills.iter().enumerate() {
        lines.push(format!("| {} | {} | {} |", rank + 1, entry.skill, entry.count));
    }
    lines.push(String::new());
    lines.push("## Matched Vacancies".to_string());
    lines.push(String::new());
    for matched in &report.matched_vacancies {
        lines.push(format!("- {} ({})", matched.vacancy_id, matched.employer));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub dir: PathBuf,
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub manifest: PathBuf,
}

/// Writes `reports/<environment>/<run_id>/` under `workspace_root`: markdown,
/// JSON and Parquet snapshots with a checksum manifest.
pub async fn export_report(
    workspace_root: &Path,
    environment: &str,
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    report: &TopSkillsReport,
) -> Result<ReportFiles> {
    let dir = workspace_root
        .join("reports")
        .join(environment)
        .join(run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let markdown = dir.join("top_skills.md");
    fs::write(&markdown, render_markdown(environment, run_id, generated_at, report))
        .await
        .context("writing top_skills.md")?;

    let json = dir.join("top_skills.json");
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "environment": environment,
        "run_id": run_id,
        "generated_at": generated_at,
        "report": report,
    }))
    .context("serializing top skills report")?;
    fs::write(&json, body).await.context("writing top_skills.json")?;

    let top_path = dir.join("top_skills.parquet");
    let matched_path = dir.join("matched_vacancies.parquet");
    write_top_skills_parquet(&top_path, &report.top_skills)?;
    write_matched_parquet(&matched_path, &report.matched_vacancies)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("top_skills", &dir, &top_path)?,
            manifest_entry("matched_vacancies", &dir, &matched_path)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReportFiles {
        dir,
        markdown,
        json,
        manifest: manifest_path,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_top_skills_parquet(path: &Path, ranking: &[SkillCount]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("skill", DataType::Utf8, false),
        ArrowField::new("vacancies", DataType::UInt64, false),
    ]));
    let ranks = UInt32Array::from((1..=ranking.len() as u32).collect::<Vec<_>>());
    let skills = StringArray::from(ranking.iter().map(|s| s.skill.as_str()).collect::<Vec<_>>());
    let counts = UInt64Array::from(ranking.iter().map(|s| s.count).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(ranks), Arc::new(skills), Arc::new(counts)],
    )
    .context("building top_skills record batch")?;
    write_parquet(path, batch)
}

fn write_matched_parquet(path: &Path, matched: &[MatchedVacancy]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("vacancy_id", DataType::Utf8, false),
        ArrowField::new("employer", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(
        matched
            .iter()
            .map(|m| m.vacancy_id.as_str())
            .collect::<Vec<_>>(),
    );
    let employers = StringArray::from(matched.iter().map(|m| m.employer.as_str()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(employers)])
        .context("building matched_vacancies record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
