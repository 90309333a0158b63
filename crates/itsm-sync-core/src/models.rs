//! Core data models used throughout itsm-sync.
//!
//! These types describe the records pulled from the ITSM backend, the
//! artifacts derived from them, the persisted per-category sync state, and
//! the result of a pipeline run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A class of source record, synced independently with its own watermark
/// and lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Incident,
    WorkOrder,
    KnowledgeArticle,
    ChangeRequest,
}

impl Category {
    /// All categories, in the order the coordinator runs them.
    pub const ALL: [Category; 4] = [
        Category::Incident,
        Category::WorkOrder,
        Category::KnowledgeArticle,
        Category::ChangeRequest,
    ];

    /// Canonical name, also used as the `sync_state` key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Incident => "Incident",
            Category::WorkOrder => "WorkOrder",
            Category::KnowledgeArticle => "KnowledgeArticle",
            Category::ChangeRequest => "ChangeRequest",
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.as_str()).collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SyncError::UnknownCategory(s.to_string()))
    }
}

/// Run status stored in the `sync_state` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => anyhow::bail!("Unknown sync status: '{}'", other),
        }
    }
}

/// Persisted per-category synchronization state. Doubles as the lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub category: Category,
    /// Newest modification time (epoch seconds) fully reflected in the index.
    /// `0` means never synced.
    pub watermark: i64,
    pub status: SyncStatus,
    /// Time of the most recent transition into `running`.
    pub last_attempt_at: Option<i64>,
    /// Time the watermark was last written by a completed run.
    pub last_completed_at: Option<i64>,
    /// Record count of the most recent completed run.
    pub records_processed: u64,
    /// Diagnostic text, present only while `status == failed`.
    pub error_message: Option<String>,
}

impl SyncState {
    /// Fresh row as created on the first sync attempt for a category.
    pub fn new(category: Category) -> Self {
        Self {
            category,
            watermark: 0,
            status: SyncStatus::Idle,
            last_attempt_at: None,
            last_completed_at: None,
            records_processed: 0,
            error_message: None,
        }
    }
}

/// A work log entry attached to an incident, work order, or change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLogEntry {
    pub parent_id: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub text: String,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<i64>,
}

/// A record produced by an extractor before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub category: Category,
    /// Business identifier, e.g. `INC000000000001`.
    pub source_id: String,
    pub entry_id: Option<String>,
    pub title: String,
    pub description: String,
    pub resolution: Option<String>,
    pub status: Option<String>,
    pub assigned_group: Option<String>,
    pub created_at: Option<i64>,
    /// Last modification time in epoch seconds. Records without one are
    /// indexed but never move the watermark.
    pub modified_at: Option<i64>,
    pub work_logs: Vec<WorkLogEntry>,
}

/// Kind of text a chunk was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Summary,
    Description,
    Resolution,
    WorkLog,
    ArticleContent,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Summary => "summary",
            ChunkType::Description => "description",
            ChunkType::Resolution => "resolution",
            ChunkType::WorkLog => "work_log",
            ChunkType::ArticleContent => "article_content",
        }
    }
}

/// A chunk of record text ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// Deterministic id derived from category, source id, and sequence.
    pub chunk_id: String,
    pub category: Category,
    pub source_id: String,
    pub chunk_type: ChunkType,
    pub sequence: i64,
    pub content: String,
    /// SHA-256 of `content`.
    pub hash: String,
    pub metadata: BTreeMap<String, String>,
}

/// A chunk paired with its embedding vector. This is the artifact stored in
/// the index.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: TextChunk,
    pub vector: Vec<f32>,
    pub model: String,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    /// Lock held by another run; nothing was done.
    Skipped(String),
    Failed(String),
}

/// Result of one category run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub category: Category,
    pub records_processed: u64,
    pub artifacts_created: u64,
    pub outcome: RunOutcome,
}

impl SyncResult {
    pub fn completed(category: Category, records: u64, artifacts: u64) -> Self {
        Self {
            category,
            records_processed: records,
            artifacts_created: artifacts,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn skipped(category: Category) -> Self {
        Self {
            category,
            records_processed: 0,
            artifacts_created: 0,
            outcome: RunOutcome::Skipped(format!("Sync already in progress for {}", category)),
        }
    }

    pub fn failed(category: Category, records: u64, artifacts: u64, message: String) -> Self {
        Self {
            category,
            records_processed: records,
            artifacts_created: artifacts,
            outcome: RunOutcome::Failed(message),
        }
    }

    /// `None` only for a completed run.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed => None,
            RunOutcome::Skipped(msg) | RunOutcome::Failed(msg) => Some(msg),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, RunOutcome::Skipped(_))
    }
}
