//! Collaborator traits for the record side of a pipeline.
//!
//! An [`Extractor`] talks to the ITSM backend for one category; a
//! [`Chunker`] turns one record into text chunks. Both are external to the
//! engine: the pipeline only sequences their calls.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Category, Record, TextChunk, WorkLogEntry};

/// Pulls records of one category from the ticketing backend.
///
/// # Example
///
/// ```rust
/// use std::collections::HashSet;
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use itsm_sync_core::models::{Category, Record};
/// use itsm_sync_core::source::Extractor;
///
/// struct EmptyExtractor;
///
/// #[async_trait]
/// impl Extractor for EmptyExtractor {
///     fn category(&self) -> Category { Category::Incident }
///
///     async fn extract_modified_since(&self, _watermark: i64) -> Result<Vec<Record>> {
///         Ok(vec![])
///     }
///
///     async fn check_existence(&self, _ids: &[String]) -> Result<HashSet<String>> {
///         Ok(HashSet::new())
///     }
/// }
/// ```
#[async_trait]
pub trait Extractor: Send + Sync {
    /// The category this extractor serves.
    fn category(&self) -> Category;

    /// All records whose modification time is strictly greater than
    /// `watermark` (epoch seconds).
    async fn extract_modified_since(&self, watermark: i64) -> Result<Vec<Record>>;

    /// Work logs for the given parent ids, keyed by parent id.
    ///
    /// Categories without work logs keep the default empty map.
    async fn work_logs(&self, _parent_ids: &[String]) -> Result<HashMap<String, Vec<WorkLogEntry>>> {
        Ok(HashMap::new())
    }

    /// Which of `ids` still exist in the backend.
    async fn check_existence(&self, ids: &[String]) -> Result<HashSet<String>>;
}

/// Splits one record into text chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, record: &Record) -> Vec<TextChunk>;
}
