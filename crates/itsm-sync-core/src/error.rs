use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// Failures inside a pipeline run never show up here: they are contained in
/// the run's [`SyncResult`](crate::models::SyncResult).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "unknown category: '{0}'. Valid categories: Incident, WorkOrder, KnowledgeArticle, ChangeRequest"
    )]
    UnknownCategory(String),

    #[error("category not configured for sync: {0}")]
    CategoryNotConfigured(String),

    #[error("sync state store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, SyncError>;
