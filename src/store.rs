//! Persistent index: files, chunks, their FTS mirror and embeddings.
//!
//! Every chunk write goes through [`Store::replace_file`] or
//! [`Store::remove_file`], and both touch `chunks` and `chunks_fts` inside a
//! single transaction. That one code path is what keeps the search index a
//! 1:1 mirror of live chunks.

use anyhow::Result;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::embedding;
use crate::models::{FileMeta, NewChunk, StoredChunk};

/// Files, chunks, the FTS mirror and embeddings in one SQLite pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// A lexical hit before ranking and snippet windowing.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: i64,
    pub path: String,
    pub pointer: String,
    pub content: String,
    pub extension: String,
    pub mtime: i64,
    /// Negated bm25, so higher is better.
    pub lexical: f64,
}

/// Engine-level query: an FTS5 expression plus resolved filters.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub fts: String,
    pub extensions: Vec<String>,
    /// Half-open `[start, end)` mtime ranges in milliseconds.
    pub mtime_ranges: Vec<(i64, i64)>,
    /// Canonical roots; a hit must live under one of them. Never empty.
    pub roots: Vec<PathBuf>,
}

/// Row counts compared by [`Store::consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consistency {
    pub chunks: i64,
    pub index_entries: i64,
    pub chunks_missing_entry: i64,
    pub orphan_entries: i64,
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        self.chunks == self.index_entries
            && self.chunks_missing_entry == 0
            && self.orphan_entries == 0
    }
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored `(size, mtime)` for a path, if indexed.
    pub async fn file_state(&self, path: &str) -> Result<Option<(i64, i64)>> {
        let row = sqlx::query("SELECT size, mtime FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("size"), r.get("mtime"))))
    }

    /// Upsert the file row and swap its chunks and index entries atomically.
    /// Returns the new chunk ids in `seq` order.
    pub async fn replace_file(&self, meta: &FileMeta, chunks: &[NewChunk]) -> Result<Vec<i64>> {
        let now = chrono::Utc::now().timestamp();
        let path = meta.path.to_string_lossy().to_string();
        let mut tx = self.pool.begin().await?;

        let file_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO files (path, size, mtime, extension, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mtime = excluded.mtime,
                extension = excluded.extension,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&path)
        .bind(meta.size)
        .bind(meta.mtime)
        .bind(&meta.extension)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        delete_chunks(&mut tx, file_id).await?;

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let chunk_id: i64 = sqlx::query_scalar(
                "INSERT INTO chunks (file_id, seq, pointer, content, hash) VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(file_id)
            .bind(chunk.seq)
            .bind(&chunk.pointer)
            .bind(&chunk.content)
            .bind(&chunk.hash)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (rowid, content) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;

            ids.push(chunk_id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Delete a file with its chunks, index entries and embeddings.
    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let file_id: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(file_id) = file_id else {
            return Ok(false);
        };

        delete_chunks(&mut tx, file_id).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Paths of every stored file under `root`.
    pub async fn paths_under(&self, root: &Path) -> Result<Vec<String>> {
        let (lo, hi) = prefix_range(root);
        let rows = sqlx::query_scalar("SELECT path FROM files WHERE path >= ? AND path < ? ORDER BY path")
            .bind(lo)
            .bind(hi)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// `(size, mtime)` of every stored file under `root`, keyed by path.
    pub async fn file_states_under(&self, root: &Path) -> Result<HashMap<String, (i64, i64)>> {
        let (lo, hi) = prefix_range(root);
        let rows = sqlx::query("SELECT path, size, mtime FROM files WHERE path >= ? AND path < ?")
            .bind(lo)
            .bind(hi)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("path"), (r.get("size"), r.get("mtime"))))
            .collect())
    }

    /// Number of stored files below `root`.
    pub async fn count_files_under(&self, root: &Path) -> Result<i64> {
        let (lo, hi) = prefix_range(root);
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE path >= ? AND path < ?")
            .bind(lo)
            .bind(hi)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// One page of lexical hits ordered by bm25, ties broken by chunk id.
    pub async fn search_candidates(
        &self,
        query: &CandidateQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Candidate>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.id AS chunk_id, c.pointer, c.content, f.path, f.extension, f.mtime,
                   bm25(chunks_fts) AS lexical
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.rowid
            JOIN files f ON f.id = c.file_id
            WHERE chunks_fts MATCH "#,
        );
        qb.push_bind(query.fts.clone());
        push_filters(&mut qb, query);
        qb.push(" ORDER BY lexical, c.id LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let bm25: f64 = row.get("lexical");
                Candidate {
                    chunk_id: row.get("chunk_id"),
                    path: row.get("path"),
                    pointer: row.get("pointer"),
                    content: row.get("content"),
                    extension: row.get("extension"),
                    mtime: row.get("mtime"),
                    lexical: -bm25,
                }
            })
            .collect())
    }

    /// Number of matches, counting no further than `cap`.
    pub async fn estimate_matches(&self, query: &CandidateQuery, cap: usize) -> Result<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT COUNT(*) FROM (
                SELECT 1
                FROM chunks_fts
                JOIN chunks c ON c.id = chunks_fts.rowid
                JOIN files f ON f.id = c.file_id
                WHERE chunks_fts MATCH "#,
        );
        qb.push_bind(query.fts.clone());
        push_filters(&mut qb, query);
        qb.push(" LIMIT ").push_bind(cap as i64).push(")");

        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(n.max(0) as usize)
    }

    /// The chunk to preview: the one at `pointer`, or the file's first chunk.
    pub async fn chunk_for_preview(
        &self,
        path: &str,
        pointer: Option<&str>,
    ) -> Result<Option<StoredChunk>> {
        let row = match pointer {
            Some(p) => {
                sqlx::query(
                    r#"
                    SELECT c.id, f.path, c.pointer, c.content
                    FROM chunks c JOIN files f ON f.id = c.file_id
                    WHERE f.path = ? AND c.pointer = ?
                    ORDER BY c.seq LIMIT 1
                    "#,
                )
                .bind(path)
                .bind(p)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT c.id, f.path, c.pointer, c.content
                    FROM chunks c JOIN files f ON f.id = c.file_id
                    WHERE f.path = ?
                    ORDER BY c.seq LIMIT 1
                    "#,
                )
                .bind(path)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(|r| StoredChunk {
            id: r.get("id"),
            path: r.get("path"),
            pointer: r.get("pointer"),
            content: r.get("content"),
        }))
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, f.path, c.pointer, c.content
            FROM chunks c JOIN files f ON f.id = c.file_id
            WHERE f.path = ?
            ORDER BY c.seq
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| StoredChunk {
                id: r.get("id"),
                path: r.get("path"),
                pointer: r.get("pointer"),
                content: r.get("content"),
            })
            .collect())
    }

    /// Stored vectors for the given chunks; chunks without one are absent.
    pub async fn embeddings_for(&self, chunk_ids: &[i64]) -> Result<HashMap<i64, Vec<f32>>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT chunk_id, vector FROM embeddings WHERE chunk_id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                (row.get("chunk_id"), embedding::blob_to_vec(&blob))
            })
            .collect())
    }

    /// Compare `chunks` with `chunks_fts` in both directions.
    pub async fn consistency(&self) -> Result<Consistency> {
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let index_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        let chunks_missing_entry: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c WHERE NOT EXISTS (SELECT 1 FROM chunks_fts x WHERE x.rowid = c.id)",
        )
        .fetch_one(&self.pool)
        .await?;
        let orphan_entries: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks_fts x WHERE NOT EXISTS (SELECT 1 FROM chunks c WHERE c.id = x.rowid)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(Consistency {
            chunks,
            index_entries,
            chunks_missing_entry,
            orphan_entries,
        })
    }
}

async fn delete_chunks(tx: &mut sqlx::Transaction<'_, Sqlite>, file_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id = ?)")
        .bind(file_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)")
        .bind(file_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &CandidateQuery) {
    if !query.extensions.is_empty() {
        qb.push(" AND f.extension IN (");
        let mut exts = qb.separated(", ");
        for ext in &query.extensions {
            exts.push_bind(ext.clone());
        }
        exts.push_unseparated(")");
    }

    if !query.mtime_ranges.is_empty() {
        qb.push(" AND (");
        for (i, (start, end)) in query.mtime_ranges.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("(f.mtime >= ")
                .push_bind(*start)
                .push(" AND f.mtime < ")
                .push_bind(*end)
                .push(")");
        }
        qb.push(")");
    }

    // An empty root list must match nothing, not everything.
    qb.push(" AND (");
    if query.roots.is_empty() {
        qb.push("0");
    }
    for (i, root) in query.roots.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        let (lo, hi) = prefix_range(root);
        qb.push("(f.path >= ")
            .push_bind(lo)
            .push(" AND f.path < ")
            .push_bind(hi)
            .push(")");
    }
    qb.push(")");
}

/// `[root/, root0)`: every path strictly below `root` under byte ordering.
/// Trailing separators are dropped first, so the filesystem root `/` gives
/// `[/, 0)`.
fn prefix_range(root: &Path) -> (String, String) {
    let mut base = root.to_string_lossy().to_string();
    while base.ends_with(std::path::MAIN_SEPARATOR) {
        base.pop();
    }
    let sep = std::path::MAIN_SEPARATOR;
    let next = char::from(sep as u8 + 1);
    (format!("{}{}", base, sep), format!("{}{}", base, next))
}
