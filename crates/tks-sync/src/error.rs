use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Where inside a job a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Migrate,
    Retrieve,
    Load,
    Resolve,
    Download,
    ReadRegistry,
    Report,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Migrate => "migrate",
            Self::Retrieve => "retrieve",
            Self::Load => "load",
            Self::Resolve => "resolve",
            Self::Download => "download",
            Self::ReadRegistry => "read_registry",
            Self::Report => "report",
            Self::Export => "export",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {source:#}")]
pub struct JobError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl JobError {
    pub fn new(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, JobError>;
}

impl<T, E> StageExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> Result<T, JobError> {
        self.map_err(|e| JobError::new(stage, e))
    }
}
