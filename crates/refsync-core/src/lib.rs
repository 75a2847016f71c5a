//! Core reconciliation data model for refsync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "refsync-core";

/// Natural key of a reference entity. Equality and hashing cover exactly these fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub domain: String,
    pub code: String,
    pub qualifier: String,
}

impl Identity {
    pub fn new(
        domain: impl Into<String>,
        code: impl Into<String>,
        qualifier: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            code: code.into(),
            qualifier: qualifier.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.code, self.qualifier)
    }
}

/// Mutable attribute payload. Ordered so comparisons and serialized output are stable.
pub type Attributes = BTreeMap<String, String>;

/// Transformed representation of one feed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub identity: Identity,
    pub attributes: Attributes,
    pub source_line: u64,
}

/// Durable representation owned by the persistence engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntity {
    pub identity: Identity,
    pub attributes: Attributes,
    pub stale: bool,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedEntity {
    pub fn from_candidate(candidate: CandidateEntity, now: DateTime<Utc>) -> Self {
        Self {
            identity: candidate.identity,
            attributes: candidate.attributes,
            stale: false,
            first_seen_at: now,
            updated_at: now,
        }
    }

    /// Merge a candidate onto this entity, keeping the persisted identity and first sighting.
    pub fn merged_with(&self, candidate: CandidateEntity, now: DateTime<Utc>) -> Self {
        Self {
            identity: self.identity.clone(),
            attributes: candidate.attributes,
            stale: false,
            first_seen_at: self.first_seen_at,
            updated_at: now,
        }
    }
}

/// Status accumulated per identity while a run applies candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedStatus {
    New,
    Updated,
    Untouched,
}

impl ObservedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Untouched => "untouched",
        }
    }
}

/// Progress marker written after each committed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_key: String,
    pub content_hash: String,
    pub rows_consumed: u64,
    pub chunks_committed: u64,
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub modified: u64,
    #[serde(default)]
    pub skipped: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn fresh(run_key: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            run_key: run_key.into(),
            content_hash: content_hash.into(),
            rows_consumed: 0,
            chunks_committed: 0,
            inserted: 0,
            updated: 0,
            modified: 0,
            skipped: 0,
            saved_at: Utc::now(),
        }
    }

    /// Whether this checkpoint was written against the given cache artifact.
    pub fn matches(&self, run_key: &str, content_hash: &str) -> bool {
        self.run_key == run_key && self.content_hash == content_hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    AbortedThreshold,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal run status transition {from:?} -> {to:?}")]
pub struct StatusTransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::AbortedThreshold)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), StatusTransitionError> {
        if !self.can_transition_to(next) {
            return Err(StatusTransitionError { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Download,
    Precheck,
    Process,
    Report,
    Cleanup,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Precheck => "precheck",
            Self::Process => "process",
            Self::Report => "report",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Completed,
    Failed,
    AbortedThreshold,
}

impl From<StepStatus> for RunStatus {
    fn from(value: StepStatus) -> Self {
        match value {
            StepStatus::Completed => RunStatus::Completed,
            StepStatus::Failed => RunStatus::Failed,
            StepStatus::AbortedThreshold => RunStatus::AbortedThreshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub inserted: u64,
    pub updated: u64,
    /// Updates whose attributes actually differed from the persisted state.
    pub modified: u64,
    pub untouched: u64,
    pub deleted_or_stale: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub rows_read: u64,
    pub chunks_committed: u64,
    pub skipped: u64,
    pub diff: DiffStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetrics {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            rows_read: 0,
            chunks_committed: 0,
            skipped: 0,
            diff: DiffStats::default(),
            started_at: at,
            finished_at: None,
        }
    }
}
