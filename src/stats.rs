//! Index statistics and health overview.
//!
//! Counts files, chunks and embeddings, breaks files down by extension,
//! lists the last index job per root and runs the chunk/FTS consistency
//! check. Used by `sfs stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::path::Path;

use crate::store::{Consistency, Store};

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStats {
    pub extension: String,
    pub files: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub root: String,
    pub state: String,
    pub finished_at: Option<i64>,
    pub indexed: i64,
    pub skipped: i64,
    pub removed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub files: i64,
    /// Files stored with no chunks (extraction failed or empty).
    pub empty_files: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub by_extension: Vec<ExtensionStats>,
    pub jobs: Vec<JobSummary>,
    pub index_entries: i64,
    pub consistent: bool,
}

/// Gather counts, per-extension totals, job states and the consistency check.
pub async fn collect(store: &Store) -> Result<Stats> {
    let pool = store.pool();

    let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;
    let empty_files: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM files f WHERE NOT EXISTS (SELECT 1 FROM chunks c WHERE c.file_id = f.id)",
    )
    .fetch_one(pool)
    .await?;
    let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT f.extension, COUNT(DISTINCT f.id) AS files, COUNT(c.id) AS chunks
        FROM files f
        LEFT JOIN chunks c ON c.file_id = f.id
        GROUP BY f.extension
        ORDER BY files DESC, f.extension
        "#,
    )
    .fetch_all(pool)
    .await?;
    let by_extension = rows
        .iter()
        .map(|r| ExtensionStats {
            extension: r.get("extension"),
            files: r.get("files"),
            chunks: r.get("chunks"),
        })
        .collect();

    let rows = sqlx::query(
        "SELECT root, state, finished_at, indexed, skipped, removed FROM index_jobs ORDER BY root",
    )
    .fetch_all(pool)
    .await?;
    let jobs = rows
        .iter()
        .map(|r| JobSummary {
            root: r.get("root"),
            state: r.get("state"),
            finished_at: r.get("finished_at"),
            indexed: r.get("indexed"),
            skipped: r.get("skipped"),
            removed: r.get("removed"),
        })
        .collect();

    let check: Consistency = store.consistency().await?;

    Ok(Stats {
        files,
        empty_files,
        chunks: check.chunks,
        embedded,
        by_extension,
        jobs,
        index_entries: check.index_entries,
        consistent: check.is_consistent(),
    })
}

pub fn print(stats: &Stats, db_path: &Path) {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("Smart File Search: Index Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Files:       {} ({} without text)", stats.files, stats.empty_files);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded * 100) / stats.chunks
        } else {
            0
        }
    );
    println!(
        "  FTS index:   {} entries ({})",
        stats.index_entries,
        if stats.consistent { "consistent" } else { "INCONSISTENT" }
    );

    if !stats.by_extension.is_empty() {
        println!();
        println!("  By extension:");
        println!("  {:<10} {:>8} {:>8}", "EXT", "FILES", "CHUNKS");
        println!("  {}", "-".repeat(28));
        for e in &stats.by_extension {
            println!("  {:<10} {:>8} {:>8}", e.extension, e.files, e.chunks);
        }
    }

    if !stats.jobs.is_empty() {
        println!();
        println!("  Index jobs:");
        println!(
            "  {:<40} {:<10} {:>8} {:>8} {:>8}   {}",
            "ROOT", "STATE", "INDEXED", "SKIPPED", "REMOVED", "FINISHED"
        );
        println!("  {}", "-".repeat(96));
        for j in &stats.jobs {
            let finished = match j.finished_at {
                Some(ts) => format_ts_relative(ts),
                None => "-".to_string(),
            };
            println!(
                "  {:<40} {:<10} {:>8} {:>8} {:>8}   {}",
                j.root, j.state, j.indexed, j.skipped, j.removed, finished
            );
        }
    }

    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style, falling back to a date after 30 days.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
