//! Incremental indexing of one allow-listed root.
//!
//! A run walks the target directory, compares each file's `(size, mtime)`
//! with the stored row and extracts only what is new or changed. Extraction
//! runs on blocking threads, at most `indexing.workers` at a time, each with
//! its own timeout. Results come back to the calling task, which performs
//! the transactional replace one file at a time.
//!
//! A file that fails to extract is stored with zero chunks and counted as
//! skipped, so it is not retried until it changes. Stored files that were
//! not seen on disk are removed, but only after a complete walk that beat
//! the deadline; a partial run never deletes anything.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::config::IndexingConfig;
use crate::embed_cmd::{self, PendingChunk};
use crate::embedding::Embedder;
use crate::error::ApiResult;
use crate::extract;
use crate::jobs::JobRegistry;
use crate::models::{FileMeta, IndexReport, NewChunk, Priority};
use crate::scan;
use crate::store::Store;

/// Pause between files for `Priority::Low` runs.
const LOW_PRIORITY_PAUSE: Duration = Duration::from_millis(10);

enum Extracted {
    Chunks(Vec<NewChunk>),
    Failed(String),
}

/// Runs incremental indexing passes over allow-listed folders.
pub struct Indexer {
    store: Store,
    config: IndexingConfig,
    embedder: Option<Arc<dyn Embedder>>,
    embed_batch_size: usize,
    jobs: Arc<JobRegistry>,
}

impl Indexer {
    pub fn new(
        store: Store,
        config: IndexingConfig,
        embedder: Option<Arc<dyn Embedder>>,
        embed_batch_size: usize,
        jobs: Arc<JobRegistry>,
    ) -> Self {
        Self {
            store,
            config,
            embedder,
            embed_batch_size,
            jobs,
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Index `target`, holding the job slot of `job_root` (the configured
    /// root that owns it) for the duration of the run.
    pub async fn index_folder(
        &self,
        target: &Path,
        job_root: &Path,
        full: bool,
        priority: Priority,
    ) -> ApiResult<IndexReport> {
        let job = self.jobs.start(&job_root.to_string_lossy()).await?;
        tracing::info!(
            root = %target.display(),
            run_id = job.run_id(),
            full,
            ?priority,
            "index run started"
        );

        match self.run(target, full, priority).await {
            Ok(report) => {
                tracing::info!(
                    root = %report.root,
                    state = %report.state,
                    indexed = report.indexed,
                    skipped = report.skipped,
                    removed = report.removed,
                    errors = report.errors,
                    duration_ms = report.duration_ms,
                    "index run finished"
                );
                job.complete(&report).await?;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(root = %target.display(), error = %e, "index run aborted");
                if let Err(persist) = job.fail(&format!("{:#}", e)).await {
                    tracing::error!(error = %persist, "failed to record job failure");
                }
                Err(e.into())
            }
        }
    }

    async fn run(&self, target: &Path, full: bool, priority: Priority) -> Result<IndexReport> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.deadline_secs);

        let scan_root = target.to_path_buf();
        let scan_config = self.config.clone();
        let outcome = tokio::task::spawn_blocking(move || scan::scan_root(&scan_root, &scan_config))
            .await
            .context("directory walk panicked")??;

        let mut report = IndexReport {
            root: target.to_string_lossy().to_string(),
            state: "completed".to_string(),
            indexed: 0,
            skipped: 0,
            removed: 0,
            errors: outcome.errors,
            duration_ms: 0,
        };

        let known = self.store.file_states_under(target).await?;
        let seen: HashSet<String> = outcome
            .files
            .iter()
            .map(|f| f.path.to_string_lossy().to_string())
            .collect();

        let mut work = Vec::new();
        for meta in outcome.files {
            let path = meta.path.to_string_lossy();
            let unchanged = known.get(&*path) == Some(&(meta.size, meta.mtime));
            if unchanged && !full {
                report.skipped += 1;
            } else {
                work.push(meta);
            }
        }

        let partial = self.process(work, priority, deadline, &mut report).await?;

        if outcome.complete && !partial {
            for path in known.keys().filter(|p| !seen.contains(*p)) {
                if self.store.remove_file(path).await? {
                    tracing::debug!(path = %path, "removed vanished file");
                    report.removed += 1;
                }
            }
        } else {
            report.state = "failed".to_string();
            if !outcome.complete {
                tracing::warn!(root = %target.display(), "walk incomplete, keeping stored files");
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Extract and store `work`. Returns true if the deadline cut the run short.
    async fn process(
        &self,
        work: Vec<FileMeta>,
        priority: Priority,
        deadline: tokio::time::Instant,
        report: &mut IndexReport,
    ) -> Result<bool> {
        let workers = match priority {
            Priority::Low => 1,
            Priority::Normal | Priority::High => self.config.workers.max(1),
        };
        let timeout = Duration::from_secs(self.config.extract_timeout_secs);

        let mut pending = work.into_iter();
        let mut in_flight: JoinSet<(FileMeta, Extracted)> = JoinSet::new();

        loop {
            while in_flight.len() < workers {
                let Some(meta) = pending.next() else { break };
                in_flight.spawn(extract_one(meta, self.config.clone(), timeout));
            }

            let joined = match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => return Ok(false),
                Err(_) => {
                    tracing::warn!(
                        in_flight = in_flight.len(),
                        unprocessed = pending.len(),
                        "index deadline reached"
                    );
                    in_flight.abort_all();
                    return Ok(true);
                }
            };

            match joined {
                Ok((meta, Extracted::Chunks(chunks))) => {
                    let ids = self.store.replace_file(&meta, &chunks).await?;
                    report.indexed += 1;
                    self.embed_inline(&ids, chunks).await;
                }
                Ok((meta, Extracted::Failed(reason))) => {
                    tracing::warn!(path = %meta.path.display(), reason = %reason, "extraction failed");
                    self.store.replace_file(&meta, &[]).await?;
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "extraction task lost");
                    report.errors += 1;
                }
            }

            if priority == Priority::Low {
                tokio::time::sleep(LOW_PRIORITY_PAUSE).await;
            }
        }
    }

    async fn embed_inline(&self, ids: &[i64], chunks: Vec<NewChunk>) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        let pending: Vec<PendingChunk> = ids
            .iter()
            .zip(chunks)
            .map(|(id, c)| PendingChunk {
                chunk_id: *id,
                content: c.content,
                hash: c.hash,
            })
            .collect();
        let (embedded, failed) =
            embed_cmd::embed_chunks_inline(self.store.pool(), embedder.as_ref(), self.embed_batch_size, &pending)
                .await;
        if failed > 0 {
            tracing::warn!(embedded, failed, "some chunks left without embeddings");
        }
    }
}

async fn extract_one(meta: FileMeta, config: IndexingConfig, timeout: Duration) -> (FileMeta, Extracted) {
    let path: PathBuf = meta.path.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let extraction = extract::extract_file(&path, config.max_file_size)?;
        Ok::<_, extract::ExtractError>(
            extraction
                .chunks(config.max_chunk_chars, config.chunk_overlap_chars)
                .collect::<Vec<_>>(),
        )
    });

    // The blocking thread cannot be interrupted; on timeout it finishes in
    // the background and its result is dropped.
    let extracted = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(chunks))) => Extracted::Chunks(chunks),
        Ok(Ok(Err(e))) => Extracted::Failed(e.to_string()),
        Ok(Err(e)) => Extracted::Failed(format!("extractor crashed: {}", e)),
        Err(_) => Extracted::Failed(format!("timed out after {}s", timeout.as_secs())),
    };
    (meta, extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::SystemTime;

    async fn indexer(config: IndexingConfig) -> Indexer {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let jobs = JobRegistry::new(pool.clone());
        Indexer::new(Store::new(pool), config, None, 16, jobs)
    }

    fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    async fn run(ix: &Indexer, root: &Path) -> IndexReport {
        ix.index_folder(root, root, false, Priority::Normal).await.unwrap()
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("a.txt"), "alpha budget").unwrap();
        std::fs::write(root.join("b.md"), "# beta\n\nbudget notes").unwrap();
        let ix = indexer(IndexingConfig::default()).await;

        let first = run(&ix, &root).await;
        assert_eq!((first.indexed, first.skipped, first.removed), (2, 0, 0));
        let before = ix.store.chunks_for_path(&root.join("a.txt").to_string_lossy()).await.unwrap();

        let second = run(&ix, &root).await;
        assert_eq!((second.indexed, second.skipped, second.removed), (0, 2, 0));
        assert_eq!(second.state, "completed");
        let after = ix.store.chunks_for_path(&root.join("a.txt").to_string_lossy()).await.unwrap();
        assert_eq!(
            before.iter().map(|c| c.id).collect::<Vec<_>>(),
            after.iter().map(|c| c.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn touched_file_is_reindexed_and_deleted_file_removed() {
        let (_dir, root) = canonical_tempdir();
        let a = root.join("a.txt");
        let b = root.join("b.txt");
        std::fs::write(&a, "first file").unwrap();
        std::fs::write(&b, "second file").unwrap();
        set_mtime(&a, 1_600_000_000);
        set_mtime(&b, 1_600_000_000);
        let ix = indexer(IndexingConfig::default()).await;
        run(&ix, &root).await;

        set_mtime(&a, 1_700_000_000);
        let report = run(&ix, &root).await;
        assert_eq!((report.indexed, report.skipped, report.removed), (1, 1, 0));

        std::fs::remove_file(&b).unwrap();
        let report = run(&ix, &root).await;
        assert_eq!((report.indexed, report.skipped, report.removed), (0, 1, 1));
        assert!(ix.store.chunks_for_path(&b.to_string_lossy()).await.unwrap().is_empty());
        assert!(ix.store.consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn corrupt_pdf_is_isolated() {
        let (_dir, root) = canonical_tempdir();
        for i in 0..4 {
            std::fs::write(root.join(format!("ok{}.txt", i)), format!("document {}", i)).unwrap();
        }
        std::fs::write(root.join("broken.pdf"), b"%PDF-1.4\nthis is not a pdf").unwrap();
        let ix = indexer(IndexingConfig::default()).await;

        let report = run(&ix, &root).await;
        assert_eq!((report.indexed, report.skipped), (4, 1));
        assert_eq!(report.state, "completed");

        // Recorded with no chunks, so an unchanged file is not retried.
        let again = run(&ix, &root).await;
        assert_eq!((again.indexed, again.skipped), (0, 5));
    }

    #[tokio::test]
    async fn full_run_reprocesses_everything() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("a.txt"), "one").unwrap();
        let ix = indexer(IndexingConfig::default()).await;
        run(&ix, &root).await;

        let report = ix.index_folder(&root, &root, true, Priority::Low).await.unwrap();
        assert_eq!((report.indexed, report.skipped), (1, 0));
        assert!(ix.store.consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn subfolder_run_leaves_siblings_alone() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("top.txt"), "top").unwrap();
        std::fs::write(root.join("sub/inner.txt"), "inner").unwrap();
        let ix = indexer(IndexingConfig::default()).await;
        run(&ix, &root).await;

        std::fs::remove_file(root.join("top.txt")).unwrap();
        let report = ix
            .index_folder(&root.join("sub"), &root, false, Priority::Normal)
            .await
            .unwrap();
        assert_eq!(report.removed, 0);
        assert!(ix.store.file_exists(&root.join("top.txt").to_string_lossy()).await.unwrap());
    }

    #[tokio::test]
    async fn vanished_root_is_partial_and_keeps_rows() {
        let (dir, root) = canonical_tempdir();
        let target = root.join("docs");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("a.txt"), "kept").unwrap();
        let ix = indexer(IndexingConfig::default()).await;
        run(&ix, &target).await;

        std::fs::remove_dir_all(&target).unwrap();
        let report = run(&ix, &target).await;
        assert_eq!(report.state, "failed");
        assert_eq!(report.removed, 0);
        assert!(ix.store.file_exists(&target.join("a.txt").to_string_lossy()).await.unwrap());
        assert_eq!(ix.jobs().state(&target.to_string_lossy()).label(), "failed");
        drop(dir);
    }

    #[tokio::test]
    async fn concurrent_run_on_same_root_conflicts() {
        let (_dir, root) = canonical_tempdir();
        let ix = indexer(IndexingConfig::default()).await;
        let _held = ix.jobs().start(&root.to_string_lossy()).await.unwrap();

        let err = ix.index_folder(&root, &root, false, Priority::Normal).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("big.txt"), "x".repeat(4096)).unwrap();
        std::fs::write(root.join("small.txt"), "tiny").unwrap();
        let ix = indexer(IndexingConfig {
            max_file_size: 1024,
            ..IndexingConfig::default()
        })
        .await;

        let report = run(&ix, &root).await;
        assert_eq!((report.indexed, report.skipped), (1, 1));
    }

    #[tokio::test]
    async fn expired_deadline_is_partial_and_deletes_nothing() {
        let (_dir, root) = canonical_tempdir();
        std::fs::write(root.join("old.txt"), "old notes").unwrap();
        std::fs::write(root.join("gone.txt"), "soon deleted").unwrap();
        let ix = indexer(IndexingConfig::default()).await;
        run(&ix, &root).await;

        std::fs::remove_file(root.join("gone.txt")).unwrap();
        std::fs::write(root.join("new1.txt"), "fresh one").unwrap();
        std::fs::write(root.join("new2.txt"), "fresh two").unwrap();

        let pool = ix.store.pool().clone();
        let hurried = Indexer::new(
            Store::new(pool.clone()),
            IndexingConfig {
                deadline_secs: 0,
                ..IndexingConfig::default()
            },
            None,
            16,
            JobRegistry::new(pool),
        );
        let report = run(&hurried, &root).await;
        assert_eq!(report.state, "failed");
        assert_eq!((report.indexed, report.removed), (0, 0));
        assert_eq!(hurried.jobs().state(&root.to_string_lossy()).label(), "failed");
        assert!(ix.store.file_exists(&root.join("gone.txt").to_string_lossy()).await.unwrap());
        assert!(!ix.store.file_exists(&root.join("new1.txt").to_string_lossy()).await.unwrap());
        assert!(ix.store.consistency().await.unwrap().is_consistent());

        let report = run(&ix, &root).await;
        assert_eq!(report.state, "completed");
        assert_eq!((report.indexed, report.skipped, report.removed), (2, 1, 1));
    }

    #[tokio::test]
    async fn slow_extraction_times_out_as_failed() {
        let (_dir, root) = canonical_tempdir();
        let big = root.join("big.txt");
        std::fs::write(&big, "budget ".repeat(1_200_000)).unwrap();
        let meta = FileMeta {
            path: big.clone(),
            size: 8_400_000,
            mtime: 0,
            extension: ".txt".to_string(),
        };

        let (_, extracted) = extract_one(meta, IndexingConfig::default(), Duration::ZERO).await;
        match extracted {
            Extracted::Failed(reason) => assert!(reason.contains("timed out"), "{}", reason),
            Extracted::Chunks(_) => panic!("extraction should have timed out"),
        }
    }

    #[tokio::test]
    async fn timed_out_file_is_skipped_and_recorded_empty() {
        let (_dir, root) = canonical_tempdir();
        let big = root.join("big.txt");
        std::fs::write(&big, "budget ".repeat(1_200_000)).unwrap();
        let ix = indexer(IndexingConfig {
            extract_timeout_secs: 0,
            ..IndexingConfig::default()
        })
        .await;

        let report = run(&ix, &root).await;
        assert_eq!(report.state, "completed");
        assert_eq!((report.indexed, report.skipped), (0, 1));
        let path = big.to_string_lossy();
        assert!(ix.store.file_exists(&path).await.unwrap());
        assert!(ix.store.chunks_for_path(&path).await.unwrap().is_empty());
    }
}
