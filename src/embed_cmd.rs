//! Embedding backfill.
//!
//! Chunks get vectors inline while indexing when a provider is configured,
//! but a provider outage must never fail a run. Whatever was missed is
//! picked up later by `sfs embed pending`, which compares each chunk's
//! content hash with the hash stored next to its vector.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::embedding::{self, Embedder};

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct EmbedReport {
    pub pending: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// A chunk that needs a (fresh) vector.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub chunk_id: i64,
    pub content: String,
    pub hash: String,
}

/// Embed chunks that have no vector or whose stored hash is stale.
pub async fn run_embed_pending(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    batch_size: usize,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<EmbedReport> {
    let pending = find_pending_chunks(pool, embedder.model_name(), limit).await?;
    let mut report = EmbedReport {
        pending: pending.len() as u64,
        ..Default::default()
    };
    if dry_run || pending.is_empty() {
        return Ok(report);
    }

    let (embedded, failed) = embed_batches(pool, embedder, batch_size, &pending).await;
    report.embedded = embedded;
    report.failed = failed;
    Ok(report)
}

/// Embed freshly written chunks. Never fails; returns `(embedded, failed)`.
pub async fn embed_chunks_inline(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    batch_size: usize,
    chunks: &[PendingChunk],
) -> (u64, u64) {
    embed_batches(pool, embedder, batch_size, chunks).await
}

async fn embed_batches(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    batch_size: usize,
    chunks: &[PendingChunk],
) -> (u64, u64) {
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        match embedder.embed(&texts).await {
            Ok(vectors) => {
                for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                    match upsert_embedding(pool, chunk, embedder.model_name(), embedder.dims(), vector).await {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            tracing::warn!(chunk_id = chunk.chunk_id, error = %e, "failed to store embedding");
                            failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(batch = batch.len(), error = %e, "embedding batch failed");
                failed += batch.len() as u64;
            }
        }
    }

    (embedded, failed)
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(i64::MAX);

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.content, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.file_id, c.seq
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            content: row.get("content"),
            hash: row.get("hash"),
        })
        .collect())
}

async fn upsert_embedding(
    pool: &SqlitePool,
    chunk: &PendingChunk,
    model: &str,
    dims: usize,
    vector: &[f32],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    // The chunk may have been replaced while the request was in flight.
    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, hash, vector, created_at)
        SELECT ?, ?, ?, ?, ?, ?
        WHERE EXISTS (SELECT 1 FROM chunks WHERE id = ? AND hash = ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            vector = excluded.vector,
            created_at = excluded.created_at
        "#,
    )
    .bind(chunk.chunk_id)
    .bind(model)
    .bind(dims as i64)
    .bind(&chunk.hash)
    .bind(embedding::vec_to_blob(vector))
    .bind(now)
    .bind(chunk.chunk_id)
    .bind(&chunk.hash)
    .execute(pool)
    .await?;

    Ok(())
}
