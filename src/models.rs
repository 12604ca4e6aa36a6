//! Data types shared by the indexer, the store and the operation layer.
//!
//! Everything that crosses the service boundary derives `Serialize` so the
//! CLI and the HTTP server emit the same JSON shapes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem facts the indexer compares against the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: PathBuf,
    pub size: i64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
    /// Lower-cased extension with a leading dot (`".pdf"`), empty if none.
    pub extension: String,
}

/// One chunk ready to be written. `seq` orders chunks within their file.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub seq: i64,
    pub pointer: String,
    pub content: String,
    pub hash: String,
}

/// A stored chunk together with its owning file's path.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: i64,
    pub path: String,
    pub pointer: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// Result of one `indexFolder` run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexReport {
    pub root: String,
    /// `completed` or `failed` (partial run; committed files stay indexed).
    pub state: String,
    pub indexed: u64,
    pub skipped: u64,
    pub removed: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    /// Extensions with a leading dot, lower case.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub years: Vec<i32>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty() && self.years.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    pub path: String,
    pub pointer: String,
    pub snippet: String,
    pub score: f64,
    pub extension: String,
    /// RFC 3339, UTC.
    pub modified_time: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Pagination {
    pub offset: usize,
    pub returned: usize,
    /// Approximate; capped by `retrieval.total_estimate_cap`. Do not use
    /// for exact-count logic.
    pub total_estimate: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AiEnhancement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_queries: Vec<String>,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
    pub pagination: Pagination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_enhancement: Option<AiEnhancement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub path: String,
    pub pointer: String,
    pub preview: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub tokens_used: u64,
    /// `ai` when the model produced it, `fallback` for the local digest.
    pub source: String,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteResponse {
    pub engine_query: String,
    pub filters: SearchFilters,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RootInfo {
    pub path: String,
    pub exists: bool,
    pub indexed_files: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageStats {
    pub day: String,
    pub today_usage: u64,
    pub daily_limit: u64,
    pub remaining: u64,
}

/// Number of result items an operation produced, for the audit record.
pub trait ResultCount {
    fn result_count(&self) -> usize;
}

impl ResultCount for SearchResponse {
    fn result_count(&self) -> usize {
        self.items.len()
    }
}

impl ResultCount for Preview {
    fn result_count(&self) -> usize {
        1
    }
}

impl ResultCount for IndexReport {
    fn result_count(&self) -> usize {
        self.indexed as usize
    }
}

impl ResultCount for SummaryResponse {
    fn result_count(&self) -> usize {
        usize::from(!self.summary.is_empty())
    }
}

impl ResultCount for RewriteResponse {
    fn result_count(&self) -> usize {
        1
    }
}

impl ResultCount for UsageStats {
    fn result_count(&self) -> usize {
        1
    }
}

impl<T> ResultCount for Vec<T> {
    fn result_count(&self) -> usize {
        self.len()
    }
}
