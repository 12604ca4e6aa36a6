//! TOML configuration.
//!
//! One file configures the whole service: the allow-listed roots, the
//! database, indexing limits, retrieval weights, guardrails and the optional
//! AI adapter. Every optional key has a default so a minimal file only needs
//! `[db]`, `roots` and `[server]`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root configuration, loaded from `config/sfs.toml` by default.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    /// Allow-listed root directories. Nothing outside these is ever admitted.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub ai: AiConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// `[indexing]`: walk, extraction and chunking limits.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_chunk_overlap_chars")]
    pub chunk_overlap_chars: usize,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            workers: default_workers(),
            extract_timeout_secs: default_extract_timeout_secs(),
            deadline_secs: default_deadline_secs(),
            max_chunk_chars: default_max_chunk_chars(),
            chunk_overlap_chars: default_chunk_overlap_chars(),
            include_hidden: false,
            exclude_globs: Vec::new(),
            extensions: default_extensions(),
        }
    }
}

impl IndexingConfig {
    /// True when `ext` (without the dot, any case) is in the indexed set.
    pub fn accepts_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_workers() -> usize {
    4
}
fn default_extract_timeout_secs() -> u64 {
    30
}
fn default_deadline_secs() -> u64 {
    300
}
fn default_max_chunk_chars() -> usize {
    1000
}
fn default_chunk_overlap_chars() -> usize {
    100
}
fn default_extensions() -> Vec<String> {
    [
        "txt", "md", "docx", "pdf", "xlsx", "pptx", "csv", "json", "xml", "html", "htm", "py",
        "js", "ts", "css", "sql", "log", "ini", "cfg", "yaml", "yml", "zip",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `[retrieval]`: page sizes and ranking.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Weight of cosine similarity in the blended score; lexical gets `1 - alpha`.
    #[serde(default = "default_semantic_alpha")]
    pub semantic_alpha: f64,
    #[serde(default)]
    pub semantic_rerank: bool,
    /// Counting stops here; `total_estimate` never exceeds it.
    #[serde(default = "default_total_estimate_cap")]
    pub total_estimate_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            candidate_k: default_candidate_k(),
            semantic_alpha: default_semantic_alpha(),
            semantic_rerank: false,
            total_estimate_cap: default_total_estimate_cap(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}
fn default_candidate_k() -> usize {
    200
}
fn default_semantic_alpha() -> f64 {
    0.3
}
fn default_total_estimate_cap() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[guardrails]`: snippet caps, redaction, rate limits and audit.
#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    #[serde(default = "default_snippet_max_bytes")]
    pub snippet_max_bytes: usize,
    /// Upper bound for caller-supplied `before`/`after` preview context.
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    #[serde(default)]
    pub log_query_text: bool,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
    #[serde(default)]
    pub redaction_rules: Vec<RedactionRuleConfig>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            snippet_max_bytes: default_snippet_max_bytes(),
            context_max_chars: default_context_max_chars(),
            log_query_text: false,
            audit_log_path: None,
            redaction_rules: Vec::new(),
            rate_limits: HashMap::new(),
        }
    }
}

fn default_snippet_max_bytes() -> usize {
    1536
}
fn default_context_max_chars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedactionRuleConfig {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// `[ai]`: provider settings, budgets and the quality gate thresholds.
#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    /// Server-side master switch. Callers must still opt in per request.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_daily_token_limit")]
    pub daily_token_limit: u64,
    #[serde(default = "default_per_request_token_limit")]
    pub per_request_token_limit: u64,
    #[serde(default = "default_min_query_chars")]
    pub min_query_chars: usize,
    /// Lexical result count at or above which a rewrite is not attempted.
    #[serde(default = "default_good_results_threshold")]
    pub good_results_threshold: usize,
    #[serde(default = "default_min_results_for_summary")]
    pub min_results_for_summary: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_ai_provider(),
            model: default_ai_model(),
            api_base: default_api_base(),
            timeout_secs: default_ai_timeout_secs(),
            max_retries: default_ai_max_retries(),
            daily_token_limit: default_daily_token_limit(),
            per_request_token_limit: default_per_request_token_limit(),
            min_query_chars: default_min_query_chars(),
            good_results_threshold: default_good_results_threshold(),
            min_results_for_summary: default_min_results_for_summary(),
        }
    }
}

fn default_ai_provider() -> String {
    "disabled".to_string()
}
fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_ai_timeout_secs() -> u64 {
    10
}
fn default_ai_max_retries() -> u32 {
    1
}
fn default_daily_token_limit() -> u64 {
    5_000
}
fn default_per_request_token_limit() -> u64 {
    1_000
}
fn default_min_query_chars() -> usize {
    3
}
fn default_good_results_threshold() -> usize {
    5
}
fn default_min_results_for_summary() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Read, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Checks cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    for root in &config.roots {
        if !root.is_absolute() {
            anyhow::bail!("roots entry must be absolute: {}", root.display());
        }
    }

    let idx = &config.indexing;
    if idx.workers == 0 {
        anyhow::bail!("indexing.workers must be >= 1");
    }
    if idx.max_chunk_chars == 0 {
        anyhow::bail!("indexing.max_chunk_chars must be > 0");
    }
    if idx.chunk_overlap_chars >= idx.max_chunk_chars {
        anyhow::bail!("indexing.chunk_overlap_chars must be < indexing.max_chunk_chars");
    }
    for pattern in &idx.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("invalid indexing.exclude_globs pattern: {}", pattern))?;
    }

    let r = &config.retrieval;
    if r.max_k == 0 || r.default_k == 0 || r.default_k > r.max_k {
        anyhow::bail!("retrieval.default_k must be in 1..=retrieval.max_k");
    }
    if !(0.0..=1.0).contains(&r.semantic_alpha) {
        anyhow::bail!("retrieval.semantic_alpha must be in [0.0, 1.0]");
    }

    let g = &config.guardrails;
    if g.snippet_max_bytes == 0 || g.snippet_max_bytes > 8192 {
        anyhow::bail!("guardrails.snippet_max_bytes must be in 1..=8192");
    }
    for rule in &g.redaction_rules {
        regex::Regex::new(&rule.pattern)
            .with_context(|| format!("invalid redaction rule '{}'", rule.name))?;
    }
    for (class, limit) in &g.rate_limits {
        if crate::guard::OpClass::parse(class).is_none() {
            anyhow::bail!("unknown rate limit class: '{}'", class);
        }
        if limit.capacity == 0 || limit.refill_per_sec < 0.0 {
            anyhow::bail!("rate limit '{}' needs capacity >= 1 and refill_per_sec >= 0", class);
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.ai.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown ai provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
