//! Catalog of correctable subjects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::CorrectionType;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading subject catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing subject catalog {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One subject eligible for a correction type, with the data the prompt
/// starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub key: String,
    pub payload: Value,
    pub priority: Option<i32>,
}

/// Read-only source of subjects. Implementations decide eligibility; the
/// backlog controller still applies the dedup gate and cooldown.
pub trait SubjectSource: Send + Sync {
    fn subjects(&self, correction_type: CorrectionType) -> Result<Vec<Subject>, SourceError>;
}

#[derive(Debug, Clone, Deserialize)]
struct SubjectRecord {
    key: String,
    #[serde(default)]
    priority: Option<i32>,
    /// Current data per correction type. A subject is eligible only for the
    /// types it has data for.
    #[serde(default)]
    data: BTreeMap<CorrectionType, Value>,
}

/// JSON array of `{"key", "priority"?, "data": {"<type>": {...}}}` records.
///
/// The file is re-read on every call so edits show up on the next backlog
/// pass.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> Result<Vec<SubjectRecord>, SourceError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| SourceError::Json {
            path: self.path.clone(),
            source,
        })
    }
}

impl SubjectSource for JsonFileSource {
    fn subjects(&self, correction_type: CorrectionType) -> Result<Vec<Subject>, SourceError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|mut r| {
                r.data.remove(&correction_type).map(|payload| Subject {
                    key: r.key,
                    payload,
                    priority: r.priority,
                })
            })
            .collect())
    }
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    subjects: BTreeMap<CorrectionType, Vec<Subject>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, correction_type: CorrectionType, key: &str, payload: Value) -> Self {
        self.subjects.entry(correction_type).or_default().push(Subject {
            key: key.to_string(),
            payload,
            priority: None,
        });
        self
    }
}

impl SubjectSource for StaticSource {
    fn subjects(&self, correction_type: CorrectionType) -> Result<Vec<Subject>, SourceError> {
        Ok(self.subjects.get(&correction_type).cloned().unwrap_or_default())
    }
}
