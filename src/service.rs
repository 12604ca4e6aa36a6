//! The guarded operations.
//!
//! [`Service`] is the only entry point the CLI and the HTTP server use. Each
//! public method runs the same envelope: rate-limit the caller for the
//! operation's class, validate inputs, do the work, then write exactly one
//! audit record whatever the outcome. Nothing below this layer knows who
//! the caller is.

use anyhow::Result;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::ai::{self, Enhancer, LlmClient, Outcome, SkipReason, TokenLedger};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder};
use crate::error::{ApiError, ApiResult};
use crate::guard::{allowlist, AuditRecord, Guardrails, OpClass};
use crate::indexer::Indexer;
use crate::jobs::JobRegistry;
use crate::migrate;
use crate::models::{
    AiEnhancement, IndexReport, Pagination, Preview, Priority, ResultCount, RewriteResponse,
    RootInfo, SearchFilters, SearchItem, SearchResponse, SummaryResponse, UsageStats,
};
use crate::planner::{self, QueryPlan};
use crate::search::{self, RankedHit, SearchPage};
use crate::store::Store;

const DEFAULT_CONTEXT_CHARS: usize = 200;
const MAX_OFFSET: usize = 10_000;
const DEFAULT_SUMMARY_TOKENS: u32 = 200;
const MAX_SUMMARY_TOKENS: u32 = 800;
const MAX_SUMMARY_RESULTS: usize = 100;
const SEARCH_SUMMARY_TOKENS: u32 = 150;

/// Parameters of `indexFolder`.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexRequest {
    pub root: String,
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Parameters of `searchFiles`. `k` defaults to `retrieval.default_k`;
/// `exts`, `years` and `roots` narrow the candidate set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub exts: Vec<String>,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub roots: Vec<String>,
    /// Caller opt-in for AI enrichment.
    #[serde(default)]
    pub ai: bool,
}

/// Parameters of `openFile`. Without a pointer the first chunk is shown.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenRequest {
    pub path: String,
    #[serde(default)]
    pub pointer: Option<String>,
    #[serde(default)]
    pub before: Option<usize>,
    #[serde(default)]
    pub after: Option<usize>,
}

/// A search result handed back for summarizing.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultRef {
    pub path: String,
    #[serde(default)]
    pub snippet: String,
}

/// Parameters of `summarizeResults`.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeRequest {
    pub query: String,
    #[serde(default)]
    pub results: Vec<ResultRef>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRequest {
    pub query: String,
}

/// The guarded operations, shared by the CLI and the HTTP server.
///
/// Each operation takes the caller identity used for rate limiting and
/// auditing. Errors are always [`ApiError`].
pub struct Service {
    config: Arc<Config>,
    store: Store,
    guard: Guardrails,
    indexer: Indexer,
    enhancer: Enhancer,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Service {
    /// Connect, migrate and build every component from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        let embedder = embedding::create_embedder(&config.embedding)?;
        let llm = ai::create_client(&config.ai)?;
        Self::with_components(config, pool, embedder, llm).await
    }

    /// Build on an existing pool with explicit providers. The pool must
    /// already be migrated.
    pub async fn with_components(
        config: Config,
        pool: SqlitePool,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let guard = Guardrails::from_config(&config)?;
        let ledger = Arc::new(TokenLedger::load(pool.clone(), &config.ai).await?);
        let enhancer = Enhancer::new(llm, ledger, config.ai.clone());

        let jobs = JobRegistry::new(pool.clone());
        jobs.recover().await?;

        let store = Store::new(pool);
        let indexer = Indexer::new(
            store.clone(),
            config.indexing.clone(),
            embedder.clone(),
            config.embedding.batch_size,
            jobs,
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            guard,
            indexer,
            enhancer,
            embedder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        self.indexer.jobs()
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    /// Configured roots, whether each exists, and how many files it has indexed.
    pub async fn list_roots(&self, caller: &str) -> ApiResult<Vec<RootInfo>> {
        self.guarded("listRoots", OpClass::Roots, caller, None, move || async move {
            let mut roots = Vec::new();
            for root in self.guard.allowlist.roots() {
                roots.push(RootInfo {
                    path: root.to_string_lossy().to_string(),
                    exists: root.is_dir(),
                    indexed_files: self.store.count_files_under(root).await?,
                });
            }
            Ok(roots)
        })
        .await
    }

    /// Index a folder inside an allow-listed root. Unchanged files are skipped;
    /// a second run on the same root while one is active is a `Conflict`.
    pub async fn index_folder(&self, caller: &str, req: IndexRequest) -> ApiResult<IndexReport> {
        self.guarded("indexFolder", OpClass::Index, caller, None, move || async move {
            let priority = match req.priority.as_deref() {
                None => Priority::Normal,
                Some(p) => Priority::parse(p).ok_or_else(|| {
                    ApiError::validation(format!("priority must be low, normal or high, got '{}'", p))
                })?,
            };
            let target = self.guard.allowlist.resolve(&req.root)?;
            if !target.is_dir() {
                return Err(ApiError::validation(format!(
                    "not a directory: {}",
                    target.display()
                )));
            }
            let job_root = self
                .guard
                .allowlist
                .owning_root(&target)
                .map(Path::to_path_buf)
                .ok_or_else(|| ApiError::denied("path is outside every configured root"))?;

            self.indexer
                .index_folder(&target, &job_root, req.full, priority)
                .await
        })
        .await
    }

    /// Ranked, redacted, paginated search. With `ai` set and AI enabled, the
    /// response carries an `ai_enhancement` block; the lexical results are
    /// returned regardless of what the provider does.
    pub async fn search_files(&self, caller: &str, req: SearchRequest) -> ApiResult<SearchResponse> {
        let query = req.query.clone();
        self.guarded("searchFiles", OpClass::Search, caller, Some(&query), move || async move {
            let retrieval = &self.config.retrieval;
            let k = req.k.unwrap_or(retrieval.default_k);
            if k == 0 || k > retrieval.max_k {
                return Err(ApiError::validation(format!(
                    "k must be between 1 and {}",
                    retrieval.max_k
                )));
            }
            let offset = req.offset.unwrap_or(0);
            if offset > MAX_OFFSET {
                return Err(ApiError::validation(format!("offset must be at most {}", MAX_OFFSET)));
            }

            let roots = self.guard.allowlist.restrict(&req.roots)?;
            let filters = SearchFilters {
                extensions: req.exts.clone(),
                years: req.years.clone(),
            };
            let base = planner::plan(&req.query, &filters)?;
            let page = self.run_search(&base, roots.clone(), k, offset).await?;

            if !req.ai {
                let items = self.render(&page.hits, &base.terms);
                return Ok(respond(items, offset, page.total_estimate, None));
            }

            let (page, items, enhancement) =
                self.enhance(&req.query, &base, page, &roots, k, offset).await;
            Ok(respond(items, offset, page.total_estimate, Some(enhancement)))
        })
        .await
    }

    /// Redacted preview of one chunk of an indexed file.
    pub async fn open_file(&self, caller: &str, req: OpenRequest) -> ApiResult<Preview> {
        self.guarded("openFile", OpClass::Preview, caller, None, move || async move {
            let path = self.guard.allowlist.resolve(&req.path)?;
            if path.is_dir() {
                return Err(ApiError::validation(format!("not a file: {}", path.display())));
            }
            let path_str = path.to_string_lossy();
            let chunk = self
                .store
                .chunk_for_preview(&path_str, req.pointer.as_deref())
                .await?
                .ok_or_else(|| match &req.pointer {
                    Some(p) => ApiError::NotFound(format!("no chunk '{}' in {}", p, path_str)),
                    None => ApiError::NotFound(format!("no indexed text for {}", path_str)),
                })?;

            let (preview, truncated) = self.guard.sanitize_preview(
                &chunk.content,
                req.before.unwrap_or(DEFAULT_CONTEXT_CHARS),
                req.after.unwrap_or(DEFAULT_CONTEXT_CHARS),
            );
            Ok(Preview {
                path: chunk.path,
                pointer: chunk.pointer,
                preview,
                truncated,
            })
        })
        .await
    }

    /// Summary of caller-supplied results. Falls back to a local digest when
    /// AI is off, over budget or failing.
    pub async fn summarize_results(
        &self,
        caller: &str,
        req: SummarizeRequest,
    ) -> ApiResult<SummaryResponse> {
        let query = req.query.clone();
        self.guarded("summarizeResults", OpClass::Summarize, caller, Some(&query), move || async move {
            if req.query.trim().is_empty() {
                return Err(ApiError::validation("query must not be empty"));
            }
            let max_tokens = req.max_tokens.unwrap_or(DEFAULT_SUMMARY_TOKENS);
            if max_tokens == 0 || max_tokens > MAX_SUMMARY_TOKENS {
                return Err(ApiError::validation(format!(
                    "max_tokens must be between 1 and {}",
                    MAX_SUMMARY_TOKENS
                )));
            }
            if req.results.len() > MAX_SUMMARY_RESULTS {
                return Err(ApiError::validation(format!(
                    "at most {} results can be summarized",
                    MAX_SUMMARY_RESULTS
                )));
            }
            for r in &req.results {
                self.check_result_path(&r.path)?;
            }

            let paths: Vec<String> = req.results.iter().map(|r| r.path.clone()).collect();
            let fallback = |budget_exhausted| SummaryResponse {
                summary: ai::fallback_summary(&paths),
                tokens_used: 0,
                source: "fallback".to_string(),
                budget_exhausted,
            };
            if req.results.is_empty() || !self.enhancer.is_enabled() {
                return Ok(fallback(false));
            }

            let pairs: Vec<(String, String)> = req
                .results
                .iter()
                .map(|r| (r.path.clone(), self.guard.redactor.redact(&r.snippet)))
                .collect();
            let style = req.style.as_deref().unwrap_or("brief");

            match self.enhancer.summarize(&req.query, &pairs, style, max_tokens).await {
                Outcome::Done { value, tokens } => Ok(SummaryResponse {
                    summary: self.guard.redactor.redact(&value),
                    tokens_used: tokens,
                    source: "ai".to_string(),
                    budget_exhausted: false,
                }),
                Outcome::Skipped(reason) => Ok(fallback(reason == SkipReason::BudgetExhausted)),
                Outcome::Failed(message) => Err(ApiError::UpstreamUnavailable(message)),
            }
        })
        .await
    }

    /// Natural language to engine query and filters. Without AI the literal
    /// plan is returned.
    pub async fn rewrite_query(&self, caller: &str, req: RewriteRequest) -> ApiResult<RewriteResponse> {
        let query = req.query.clone();
        self.guarded("rewriteQuery", OpClass::Rewrite, caller, Some(&query), move || async move {
            let base = planner::plan(&req.query, &SearchFilters::default())?;
            let literal = |notes: &str| RewriteResponse {
                engine_query: base.engine_query.clone(),
                filters: base.filters.clone(),
                notes: notes.to_string(),
            };
            if !self.enhancer.is_enabled() {
                return Ok(literal("AI rewrite is disabled; using the literal query"));
            }

            match self.enhancer.rewrite(&req.query).await {
                Outcome::Done { value, .. } => {
                    let plan = planner::plan_from_rewrite(&base, &value).ok_or_else(|| {
                        ApiError::UpstreamUnavailable("model returned no searchable query".into())
                    })?;
                    Ok(RewriteResponse {
                        engine_query: plan.engine_query,
                        filters: plan.filters,
                        notes: plan.notes,
                    })
                }
                Outcome::Skipped(SkipReason::BudgetExhausted) => {
                    Ok(literal("daily AI budget exhausted; using the literal query"))
                }
                Outcome::Skipped(_) => Ok(literal("AI rewrite skipped; using the literal query")),
                Outcome::Failed(message) => Err(ApiError::UpstreamUnavailable(message)),
            }
        })
        .await
    }

    /// Today's token usage against the daily limit.
    pub async fn usage(&self, caller: &str) -> ApiResult<UsageStats> {
        self.guarded("usage", OpClass::Roots, caller, None, move || async move {
            Ok(self.enhancer.ledger().usage().await?)
        })
        .await
    }

    /// Rate limit, run, audit. The record is written on every path,
    /// including a rejected rate-limit check.
    async fn guarded<T, F, Fut>(
        &self,
        operation: &str,
        class: OpClass,
        caller: &str,
        query: Option<&str>,
        op: F,
    ) -> ApiResult<T>
    where
        T: ResultCount,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let started = Instant::now();
        let result = match self.guard.limiter.check(caller, class) {
            Ok(()) => op().await,
            Err(e) => Err(e),
        };
        let counted = result.as_ref().map(|value| value.result_count());
        self.record(operation, caller, query, started, counted);
        result
    }

    /// Account for a call that failed before reaching its operation, such as
    /// undecodable parameters. It still takes a rate-limit token and leaves
    /// one audit record. Returns the error to report, which becomes the
    /// rate-limit error once the caller's bucket is empty.
    pub fn reject(&self, operation: &str, class: OpClass, caller: &str, err: ApiError) -> ApiError {
        let started = Instant::now();
        let err = match self.guard.limiter.check(caller, class) {
            Ok(()) => err,
            Err(limited) => limited,
        };
        self.record(operation, caller, None, started, Err(&err));
        err
    }

    fn record(
        &self,
        operation: &str,
        caller: &str,
        query: Option<&str>,
        started: Instant,
        result: Result<usize, &ApiError>,
    ) {
        let (outcome, result_count) = match result {
            Ok(count) => ("ok", count),
            Err(e) => (e.code(), 0),
        };
        match result {
            Err(ApiError::AccessDenied(message)) => {
                tracing::warn!(operation, caller, message = %message, "access denied")
            }
            Err(ApiError::Internal(message)) => {
                tracing::error!(operation, caller, message = %message, "operation failed")
            }
            _ => {}
        }

        self.guard.audit.record(&AuditRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            caller: caller.to_string(),
            outcome: outcome.to_string(),
            result_count,
            latency_ms: started.elapsed().as_millis() as u64,
            query: self.guard.audit_query(query),
        });
    }

    async fn run_search(
        &self,
        plan: &QueryPlan,
        roots: Vec<PathBuf>,
        k: usize,
        offset: usize,
    ) -> Result<SearchPage> {
        search::search(
            &self.store,
            &self.config.retrieval,
            self.embedder.as_deref(),
            plan,
            roots,
            k,
            offset,
        )
        .await
    }

    /// Search-time enrichment. Never fails: every AI problem leaves the
    /// lexical page in place and the corresponding field empty. When the
    /// quality gate says skip (including "enough results already"), no
    /// provider call is made at all.
    async fn enhance(
        &self,
        query: &str,
        base: &QueryPlan,
        page: SearchPage,
        roots: &[PathBuf],
        k: usize,
        offset: usize,
    ) -> (SearchPage, Vec<SearchItem>, AiEnhancement) {
        let mut enhancement = AiEnhancement::default();
        let mut page = page;
        let mut terms = base.terms.clone();

        match self.enhancer.gate(true, query, page.hits.len()) {
            None => {
                let rewrite = self.enhancer.rewrite(query).await;
                enhancement.budget_exhausted |= rewrite.budget_exhausted();
                if let Some(plan) = rewrite
                    .value()
                    .and_then(|r| planner::plan_from_rewrite(base, &r))
                    .filter(|p| p.engine_query != base.engine_query || p.filters != base.filters)
                {
                    match self.run_search(&plan, roots.to_vec(), k, offset).await {
                        Ok(better) if better.hits.len() > page.hits.len() => {
                            enhancement.enhanced_query = Some(plan.engine_query.clone());
                            page = better;
                            terms = plan.terms;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "rewritten query failed, keeping lexical results"),
                    }
                }
            }
            Some(reason) => {
                tracing::debug!(?reason, "AI enrichment skipped");
                let items = self.render(&page.hits, &terms);
                return (page, items, enhancement);
            }
        }

        let items = self.render(&page.hits, &terms);
        let ai_config = self.enhancer.config();

        if items.len() >= ai_config.min_results_for_summary {
            let pairs: Vec<(String, String)> = items
                .iter()
                .map(|i| (i.path.clone(), i.snippet.clone()))
                .collect();
            let summary = self
                .enhancer
                .summarize(query, &pairs, "brief", SEARCH_SUMMARY_TOKENS)
                .await;
            enhancement.budget_exhausted |= summary.budget_exhausted();
            enhancement.summary = summary.value().map(|s| self.guard.redactor.redact(&s));
        }

        if items.len() < ai_config.good_results_threshold {
            let mut extensions: Vec<String> = items.iter().map(|i| i.extension.clone()).collect();
            extensions.sort();
            extensions.dedup();
            let related = self.enhancer.related_queries(query, &extensions).await;
            enhancement.budget_exhausted |= related.budget_exhausted();
            enhancement.related_queries = related.value().unwrap_or_default();
        }

        (page, items, enhancement)
    }

    fn render(&self, hits: &[RankedHit], terms: &[String]) -> Vec<SearchItem> {
        hits.iter()
            .map(|hit| {
                let c = &hit.candidate;
                SearchItem {
                    path: c.path.clone(),
                    pointer: c.pointer.clone(),
                    snippet: self.guard.sanitize_snippet(&c.content, terms),
                    score: hit.score,
                    extension: c.extension.clone(),
                    modified_time: rfc3339_millis(c.mtime),
                }
            })
            .collect()
    }

    /// Caller-supplied result paths must sit under a root. The file itself
    /// may have gone since the search, so this is a lexical check only.
    fn check_result_path(&self, raw: &str) -> ApiResult<()> {
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(ApiError::denied(format!("result path must be absolute: {}", raw)));
        }
        let normalized = allowlist::normalize(path);
        if self.guard.allowlist.owning_root(&normalized).is_none() {
            return Err(ApiError::denied(format!("result path outside allowed roots: {}", raw)));
        }
        Ok(())
    }
}

fn respond(
    items: Vec<SearchItem>,
    offset: usize,
    total_estimate: usize,
    ai_enhancement: Option<AiEnhancement>,
) -> SearchResponse {
    SearchResponse {
        pagination: Pagination {
            offset,
            returned: items.len(),
            total_estimate,
        },
        items,
        ai_enhancement,
    }
}

fn rfc3339_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}
