//! End-to-end scenarios against the guarded operations, on a real on-disk
//! database in WAL mode.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use smart_file_search::ai::{Completion, CompletionRequest, LlmClient};
use smart_file_search::config::{Config, RateLimitConfig};
use smart_file_search::error::ApiError;
use smart_file_search::service::{
    IndexRequest, OpenRequest, ResultRef, SearchRequest, Service, SummarizeRequest,
};
use smart_file_search::{db, migrate};

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().canonicalize().unwrap();
    let root = base.join("docs");
    fs::create_dir_all(&root).unwrap();

    let text = format!(
        "roots = [\"{}\"]\n\n[db]\npath = \"{}\"\n\n[server]\nbind = \"127.0.0.1:0\"\n",
        root.display(),
        base.join("data/sfs.sqlite").display()
    );
    let config: Config = toml::from_str(&text).unwrap();
    smart_file_search::config::validate(&config).unwrap();

    Env {
        _tmp: tmp,
        root,
        config,
    }
}

fn set_mtime(path: &Path, secs: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn index_req(root: &Path) -> IndexRequest {
    IndexRequest {
        root: root.to_string_lossy().to_string(),
        full: false,
        priority: None,
    }
}

fn search_req(query: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        ..Default::default()
    }
}

async fn chunk_rows(svc: &Service) -> Vec<(i64, i64, i64, String, String, String)> {
    sqlx::query_as("SELECT id, file_id, seq, pointer, content, hash FROM chunks ORDER BY id")
        .fetch_all(svc.store().pool())
        .await
        .unwrap()
}

async fn file_rows(svc: &Service) -> Vec<(i64, String, i64, i64, String, i64, i64)> {
    sqlx::query_as(
        "SELECT id, path, size, mtime, extension, created_at, updated_at FROM files ORDER BY id",
    )
    .fetch_all(svc.store().pool())
    .await
    .unwrap()
}

#[tokio::test]
async fn second_run_without_changes_is_a_no_op() {
    let env = setup();
    fs::write(env.root.join("a.txt"), "alpha budget notes").unwrap();
    fs::write(env.root.join("b.md"), "# Beta\n\nbeta budget notes").unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();

    let first = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!(first.indexed, 2);
    let files_before = file_rows(&svc).await;
    let chunks_before = chunk_rows(&svc).await;

    let second = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!((second.indexed, second.skipped, second.removed), (0, 2, 0));
    assert_eq!(second.state, "completed");
    assert_eq!(file_rows(&svc).await, files_before);
    assert_eq!(chunk_rows(&svc).await, chunks_before);
}

#[tokio::test]
async fn touched_and_deleted_files_are_picked_up() {
    let env = setup();
    let a = env.root.join("a.txt");
    let b = env.root.join("b.txt");
    fs::write(&a, "first file").unwrap();
    fs::write(&b, "second file").unwrap();
    set_mtime(&a, 1_700_000_000);
    set_mtime(&b, 1_700_000_000);
    let svc = Service::open(env.config.clone()).await.unwrap();
    svc.index_folder("t", index_req(&env.root)).await.unwrap();

    set_mtime(&a, 1_700_000_600);
    let report = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!((report.indexed, report.skipped, report.removed), (1, 1, 0));

    fs::remove_file(&b).unwrap();
    let report = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!((report.indexed, report.skipped, report.removed), (0, 1, 1));

    let left: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunks c JOIN files f ON f.id = c.file_id WHERE f.path = ?",
    )
    .bind(b.to_string_lossy().to_string())
    .fetch_one(svc.store().pool())
    .await
    .unwrap();
    assert_eq!(left, 0);
    assert!(svc.store().consistency().await.unwrap().is_consistent());
}

#[tokio::test]
async fn pages_through_many_matches() {
    let env = setup();
    for i in 0..25 {
        fs::write(
            env.root.join(format!("note-{:02}.txt", i)),
            format!("budget line item number {}", i),
        )
        .unwrap();
    }
    let svc = Service::open(env.config.clone()).await.unwrap();
    let report = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!(report.indexed, 25);

    let page = svc
        .search_files(
            "t",
            SearchRequest {
                k: Some(10),
                offset: Some(10),
                ..search_req("budget")
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.pagination.offset, 10);
    assert_eq!(page.pagination.returned, 10);
    assert!(page.pagination.total_estimate >= 20);

    let first = svc
        .search_files("t", SearchRequest { k: Some(10), ..search_req("budget") })
        .await
        .unwrap();
    for item in &page.items {
        assert!(first.items.iter().all(|f| f.path != item.path));
    }

    let tail = svc
        .search_files(
            "t",
            SearchRequest {
                k: Some(10),
                offset: Some(20),
                ..search_req("budget")
            },
        )
        .await
        .unwrap();
    assert_eq!(tail.items.len(), 5);
}

#[tokio::test]
async fn one_corrupt_pdf_does_not_fail_the_run() {
    let env = setup();
    for name in ["one.txt", "two.txt", "three.md", "four.csv"] {
        fs::write(env.root.join(name), format!("contents of {}", name)).unwrap();
    }
    fs::write(env.root.join("broken.pdf"), b"%PDF-1.4 this is not really a pdf").unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();

    let report = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!((report.indexed, report.skipped), (4, 1));
    assert_eq!(report.state, "completed");
}

#[tokio::test]
async fn traversal_is_denied_without_side_effects() {
    let env = setup();
    fs::write(env.root.join("a.txt"), "inside").unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();
    let escape = format!("{}/../../../../etc", env.root.display());

    let err = svc.index_folder("t", index_req(Path::new(&escape))).await.unwrap_err();
    assert!(matches!(err, ApiError::AccessDenied(_)));

    let err = svc
        .open_file(
            "t",
            OpenRequest {
                path: format!("{}/passwd", escape),
                pointer: None,
                before: None,
                after: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AccessDenied(_)));

    let err = svc
        .search_files(
            "t",
            SearchRequest {
                roots: vec![escape.clone()],
                ..search_req("root")
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AccessDenied(_)));

    let err = svc
        .summarize_results(
            "t",
            SummarizeRequest {
                query: "passwords".into(),
                results: vec![ResultRef {
                    path: format!("{}/passwd", escape),
                    snippet: String::new(),
                }],
                style: None,
                max_tokens: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AccessDenied(_)));

    assert!(file_rows(&svc).await.is_empty());
    assert!(svc.jobs().persisted().await.unwrap().is_empty());
}

#[tokio::test]
async fn preview_and_snippets_are_redacted() {
    let env = setup();
    fs::write(
        env.root.join("contacts.txt"),
        "Reach the owner at user@example.com about the invoice.\nCard on file: 4111111111111111 for invoice payments.",
    )
    .unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();
    svc.index_folder("t", index_req(&env.root)).await.unwrap();

    let preview = svc
        .open_file(
            "t",
            OpenRequest {
                path: env.root.join("contacts.txt").to_string_lossy().to_string(),
                pointer: None,
                before: None,
                after: None,
            },
        )
        .await
        .unwrap();
    assert!(!preview.preview.contains("user@example.com"));
    assert!(!preview.preview.contains("4111111111111111"));
    assert!(preview.preview.contains("invoice"));

    let res = svc.search_files("t", search_req("invoice")).await.unwrap();
    assert_eq!(res.items.len(), 1);
    assert!(!res.items[0].snippet.contains("user@example.com"));
    assert!(!res.items[0].snippet.contains("4111111111111111"));
}

#[tokio::test]
async fn unknown_pointer_is_not_found() {
    let env = setup();
    fs::write(env.root.join("a.txt"), "short text").unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();
    svc.index_folder("t", index_req(&env.root)).await.unwrap();

    let err = svc
        .open_file(
            "t",
            OpenRequest {
                path: env.root.join("a.txt").to_string_lossy().to_string(),
                pointer: Some("page 99".into()),
                before: None,
                after: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn index_stays_consistent_across_churn() {
    let env = setup();
    let svc = Service::open(env.config.clone()).await.unwrap();
    for round in 0..3u64 {
        for i in 0..5 {
            let path = env.root.join(format!("f{}.txt", i));
            if (i + round as usize) % 3 == 0 {
                let _ = fs::remove_file(&path);
            } else {
                fs::write(&path, format!("round {} file {} text", round, i)).unwrap();
                set_mtime(&path, 1_700_000_000 + round * 60);
            }
        }
        svc.index_folder("t", index_req(&env.root)).await.unwrap();
        let check = svc.store().consistency().await.unwrap();
        assert!(check.is_consistent(), "round {}: {:?}", round, check);
    }

    let full = svc
        .index_folder(
            "t",
            IndexRequest {
                full: true,
                ..index_req(&env.root)
            },
        )
        .await
        .unwrap();
    assert_eq!(full.skipped, 0);
    assert!(svc.store().consistency().await.unwrap().is_consistent());
}

#[tokio::test]
async fn concurrent_run_on_same_root_conflicts() {
    let env = setup();
    let svc = Service::open(env.config.clone()).await.unwrap();
    let root = env.root.to_string_lossy().to_string();

    let held = svc.jobs().start(&root).await.unwrap();
    let err = svc.index_folder("t", index_req(&env.root)).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));

    held.fail("released by test").await.unwrap();
    let report = svc.index_folder("t", index_req(&env.root)).await.unwrap();
    assert_eq!(report.state, "completed");
}

#[tokio::test]
async fn rate_limits_are_per_caller_and_class() {
    let mut env = setup();
    env.config.guardrails.rate_limits.insert(
        "search".into(),
        RateLimitConfig {
            capacity: 2,
            refill_per_sec: 0.0,
        },
    );
    fs::write(env.root.join("a.txt"), "budget").unwrap();
    let svc = Service::open(env.config.clone()).await.unwrap();

    svc.search_files("alice", search_req("budget")).await.unwrap();
    svc.search_files("alice", search_req("budget")).await.unwrap();
    let err = svc.search_files("alice", search_req("budget")).await.unwrap_err();
    assert!(matches!(err, ApiError::RateLimited(_)));

    svc.search_files("bob", search_req("budget")).await.unwrap();
    svc.list_roots("alice").await.unwrap();
}

struct CountingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for CountingClient {
    fn model_name(&self) -> &str {
        "counting"
    }

    async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: "{\"fts\": \"budget\"}".into(),
            tokens_used: 10,
        })
    }
}

#[tokio::test]
async fn exhausted_budget_skips_the_provider() {
    let mut env = setup();
    env.config.ai.enabled = true;
    env.config.ai.daily_token_limit = 100;
    fs::write(env.root.join("a.txt"), "annual budget review").unwrap();

    let pool = db::connect(&env.config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    sqlx::query("INSERT INTO token_usage (day, tokens_used, updated_at) VALUES (?, 95, 0)")
        .bind(chrono::Utc::now().format("%Y-%m-%d").to_string())
        .execute(&pool)
        .await
        .unwrap();

    let client = Arc::new(CountingClient {
        calls: AtomicUsize::new(0),
    });
    let svc = Service::with_components(
        env.config.clone(),
        pool,
        None,
        Some(client.clone() as Arc<dyn LlmClient>),
    )
    .await
    .unwrap();
    svc.index_folder("t", index_req(&env.root)).await.unwrap();

    let res = svc
        .search_files("t", SearchRequest { ai: true, ..search_req("budget") })
        .await
        .unwrap();
    assert_eq!(res.items.len(), 1);
    let ai = res.ai_enhancement.unwrap();
    assert!(ai.budget_exhausted);
    assert!(ai.enhanced_query.is_none());
    assert!(ai.summary.is_none());
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);

    let usage = svc.usage("t").await.unwrap();
    assert_eq!(usage.today_usage, 95);
    assert_eq!(usage.remaining, 5);
}

#[tokio::test]
async fn enough_lexical_results_make_no_provider_call() {
    let mut env = setup();
    env.config.ai.enabled = true;
    env.config.ai.good_results_threshold = 5;
    env.config.ai.min_results_for_summary = 3;
    for i in 0..8 {
        fs::write(env.root.join(format!("b{}.txt", i)), format!("budget line {}", i)).unwrap();
    }

    let pool = db::connect(&env.config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let client = Arc::new(CountingClient {
        calls: AtomicUsize::new(0),
    });
    let svc = Service::with_components(
        env.config.clone(),
        pool,
        None,
        Some(client.clone() as Arc<dyn LlmClient>),
    )
    .await
    .unwrap();
    svc.index_folder("t", index_req(&env.root)).await.unwrap();

    let res = svc
        .search_files("t", SearchRequest { ai: true, ..search_req("budget") })
        .await
        .unwrap();
    assert_eq!(res.items.len(), 8);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    let ai = res.ai_enhancement.unwrap();
    assert!(ai.enhanced_query.is_none());
    assert!(ai.summary.is_none());
    assert!(ai.related_queries.is_empty());
    assert!(!ai.budget_exhausted);

    let usage = svc.usage("t").await.unwrap();
    assert_eq!(usage.today_usage, 0);
}
