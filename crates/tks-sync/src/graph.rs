//! Static job graph per environment and a wave-by-wave executor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EnvironmentConfig;
use crate::error::{JobError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobId {
    LoadReference,
    IngestAndLoad,
    ResolveDimension,
    Report,
}

impl JobId {
    pub const ALL: [JobId; 4] = [
        JobId::LoadReference,
        JobId::IngestAndLoad,
        JobId::ResolveDimension,
        JobId::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadReference => "load-reference",
            Self::IngestAndLoad => "ingest-and-load",
            Self::ResolveDimension => "resolve-dimension",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|job| job.as_str() == s.trim())
            .ok_or_else(|| {
                format!(
                    "unknown job {s:?} (expected one of: {})",
                    Self::ALL.map(|j| j.as_str()).join(", ")
                )
            })
    }
}

/// Whether dimension resolution is its own job or part of ingest-and-load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Folded,
    Split,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Folded => f.write_str("folded"),
            Self::Split => f.write_str("split"),
        }
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folded" => Ok(Self::Folded),
            "split" => Ok(Self::Split),
            other => Err(format!("unknown topology {other:?} (expected folded or split)")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job {job} depends on {dependency}, which is not in the graph")]
    UnknownDependency { job: JobId, dependency: JobId },
    #[error("job {0} is declared twice")]
    DuplicateJob(JobId),
    #[error("dependency cycle through {}", .0.iter().map(JobId::as_str).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<JobId>),
    #[error("job {0} is not part of this graph")]
    UnknownJob(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub id: JobId,
    pub depends_on: BTreeSet<JobId>,
}

impl JobSpec {
    pub fn new(id: JobId, depends_on: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            id,
            depends_on: depends_on.into_iter().collect(),
        }
    }
}

/// Jobs and their "depends on" sets for one environment.
#[derive(Debug, Clone, Serialize)]
pub struct TaskGraph {
    pub environment: String,
    pub topology: Topology,
    jobs: Vec<JobSpec>,
}

impl TaskGraph {
    pub fn for_environment(environment: &EnvironmentConfig, topology: Topology) -> Self {
        let jobs = match topology {
            Topology::Folded => vec![
                JobSpec::new(JobId::LoadReference, []),
                JobSpec::new(JobId::IngestAndLoad, []),
                JobSpec::new(JobId::Report, [JobId::IngestAndLoad, JobId::LoadReference]),
            ],
            Topology::Split => vec![
                JobSpec::new(JobId::LoadReference, []),
                JobSpec::new(JobId::IngestAndLoad, []),
                JobSpec::new(JobId::ResolveDimension, [JobId::IngestAndLoad]),
                JobSpec::new(
                    JobId::Report,
                    [JobId::IngestAndLoad, JobId::ResolveDimension, JobId::LoadReference],
                ),
            ],
        };
        Self {
            environment: environment.name.clone(),
            topology,
            jobs,
        }
    }

    pub fn from_jobs(
        environment: impl Into<String>,
        topology: Topology,
        jobs: Vec<JobSpec>,
    ) -> Result<Self, GraphError> {
        let graph = Self {
            environment: environment.into(),
            topology,
            jobs,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = BTreeSet::new();
        for job in &self.jobs {
            if !ids.insert(job.id) {
                return Err(GraphError::DuplicateJob(job.id));
            }
        }
        for job in &self.jobs {
            if let Some(dependency) = job.depends_on.iter().find(|d| !ids.contains(*d)) {
                return Err(GraphError::UnknownDependency {
                    job: job.id,
                    dependency: *dependency,
                });
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn's order; ties resolve in declaration order.
    pub fn topological_order(&self) -> Result<Vec<JobId>, GraphError> {
        let mut remaining: BTreeMap<JobId, BTreeSet<JobId>> = self
            .jobs
            .iter()
            .map(|j| (j.id, j.depends_on.clone()))
            .collect();
        let mut order = Vec::with_capacity(self.jobs.len());

        while !remaining.is_empty() {
            let ready: Vec<JobId> = self
                .jobs
                .iter()
                .map(|j| j.id)
                .filter(|id| remaining.get(id).is_some_and(|deps| deps.is_empty()))
                .collect();
            if ready.is_empty() {
                return Err(GraphError::Cycle(remaining.keys().copied().collect()));
            }
            for id in ready {
                remaining.remove(&id);
                for deps in remaining.values_mut() {
                    deps.remove(&id);
                }
                order.push(id);
            }
        }
        Ok(order)
    }

    /// `target` plus everything it transitively depends on.
    pub fn with_prerequisites(&self, target: JobId) -> Result<Self, GraphError> {
        if self.job(target).is_none() {
            return Err(GraphError::UnknownJob(target));
        }
        let mut keep = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if keep.insert(id) {
                if let Some(job) = self.job(id) {
                    stack.extend(job.depends_on.iter().copied());
                }
            }
        }
        Ok(Self {
            environment: self.environment.clone(),
            topology: self.topology,
            jobs: self
                .jobs
                .iter()
                .filter(|j| keep.contains(&j.id))
                .cloned()
                .collect(),
        })
    }
}

/// Executes one job of the graph.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: JobId) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { stage: Stage, error: String },
    /// The job task panicked or was cancelled.
    Crashed { error: String },
    Skipped { blocked_by: Vec<JobId> },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job: JobId,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: JobOutcome,
}

impl JobRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphRunSummary {
    pub run_id: Uuid,
    pub environment: String,
    pub topology: Topology,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobRecord>,
}

impl GraphRunSummary {
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(JobRecord::succeeded)
    }

    pub fn record(&self, job: JobId) -> Option<&JobRecord> {
        self.jobs.iter().find(|r| r.job == job)
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs
            .iter()
            .filter(|r| matches!(r.outcome, JobOutcome::Failed { .. } | JobOutcome::Crashed { .. }))
    }
}

/// Start half of a job's instrumentation. Taken right before the job body
/// runs; [`JobTimer::finish`] logs the outcome and closes the record.
#[derive(Debug)]
pub struct JobTimer {
    job: JobId,
    environment: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl JobTimer {
    pub fn start(job: JobId, environment: &str, run_id: Uuid) -> Self {
        info!(%run_id, environment, job = %job, "job started");
        Self {
            job,
            environment: environment.to_string(),
            run_id,
            started_at: Utc::now(),
        }
    }

    pub fn finish(self, result: Result<(), JobError>) -> JobRecord {
        let Self {
            job,
            environment,
            run_id,
            started_at,
        } = self;
        let outcome = match result {
            Ok(()) => JobOutcome::Succeeded,
            Err(err) => JobOutcome::Failed {
                stage: err.stage,
                error: format!("{:#}", err.source),
            },
        };

        let finished_at = Utc::now();
        let elapsed_ms = (finished_at - started_at).num_milliseconds();
        match &outcome {
            JobOutcome::Failed { stage, error } => {
                error!(%run_id, %environment, job = %job, %stage, error = %error, elapsed_ms, "job failed")
            }
            _ => info!(%run_id, %environment, job = %job, elapsed_ms, "job succeeded"),
        }

        JobRecord {
            job,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            outcome,
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Runs the graph in waves: every job whose dependencies all succeeded runs
/// concurrently with the rest of its wave. A failed job skips its transitive
/// dependents; independent branches keep going.
pub async fn run_graph(
    graph: &TaskGraph,
    runner: Arc<dyn JobRunner>,
    run_id: Uuid,
) -> Result<GraphRunSummary, GraphError> {
    graph.validate()?;
    let started_at = Utc::now();
    let mut records: BTreeMap<JobId, JobRecord> = BTreeMap::new();

    loop {
        let pending: Vec<&JobSpec> = graph
            .jobs()
            .iter()
            .filter(|j| !records.contains_key(&j.id))
            .collect();
        if pending.is_empty() {
            break;
        }

        let mut wave = Vec::new();
        for job in pending {
            let blocked_by: Vec<JobId> = job
                .depends_on
                .iter()
                .filter(|dep| records.get(*dep).is_some_and(|r| !r.succeeded()))
                .copied()
                .collect();
            if !blocked_by.is_empty() {
                warn!(%run_id, job = %job.id, blocked_by = ?blocked_by, "job skipped");
                records.insert(
                    job.id,
                    JobRecord {
                        job: job.id,
                        started_at: None,
                        finished_at: None,
                        outcome: JobOutcome::Skipped { blocked_by },
                    },
                );
            } else if job
                .depends_on
                .iter()
                .all(|dep| records.get(dep).is_some_and(JobRecord::succeeded))
            {
                wave.push(job.id);
            }
        }

        let mut running = JoinSet::new();
        let mut task_jobs: HashMap<task::Id, JobId> = HashMap::new();
        for job in wave {
            let runner = Arc::clone(&runner);
            let environment = graph.environment.clone();
            let handle = running.spawn(async move {
                let timer = JobTimer::start(job, &environment, run_id);
                let result = runner.run_job(job).await;
                timer.finish(result)
            });
            task_jobs.insert(handle.id(), job);
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(record) => {
                    records.insert(record.job, record);
                }
                Err(err) => {
                    let Some(job) = task_jobs.get(&err.id()).copied() else {
                        error!(%run_id, error = %err, "unknown job task failed");
                        continue;
                    };
                    let error = panic_message(err);
                    error!(%run_id, job = %job, %error, "job crashed");
                    records.insert(
                        job,
                        JobRecord {
                            job,
                            started_at: None,
                            finished_at: Some(Utc::now()),
                            outcome: JobOutcome::Crashed { error },
                        },
                    );
                }
            }
        }
    }

    let jobs = graph
        .topological_order()?
        .into_iter()
        .filter_map(|id| records.remove(&id))
        .collect();
    Ok(GraphRunSummary {
        run_id,
        environment: graph.environment.clone(),
        topology: graph.topology,
        started_at,
        finished_at: Utc::now(),
        jobs,
    })
}
