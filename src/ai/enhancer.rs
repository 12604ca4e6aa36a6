//! Optional LLM enrichment: query rewrite, result summaries and related
//! queries.
//!
//! Nothing here can fail a request. Each call yields an [`Outcome`]: the
//! value, a skip reason (no network call was made), or a failure message.
//! The ledger is charged only after a call has fully completed; a call that
//! times out or errors costs nothing.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::client::{Completion, CompletionRequest, LlmClient};
use super::estimate_tokens;
use super::ledger::TokenLedger;
use crate::config::AiConfig;

/// Why an AI call was not made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRequested,
    Disabled,
    QueryTooShort,
    EnoughResults,
    BudgetExhausted,
}

/// Result of one AI call. Never an error: failures and skips are values.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done { value: T, tokens: u64 },
    Skipped(SkipReason),
    Failed(String),
}

impl<T> Outcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Done { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        matches!(self, Outcome::Skipped(SkipReason::BudgetExhausted))
    }
}

/// An engine query and filters derived by the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewritePlan {
    pub fts: String,
    pub extensions: Vec<String>,
    pub years: Vec<i32>,
    pub notes: String,
}

/// Budgeted, time-boxed AI calls behind a quality gate.
pub struct Enhancer {
    client: Option<Arc<dyn LlmClient>>,
    ledger: Arc<TokenLedger>,
    config: AiConfig,
}

const REWRITE_SYSTEM: &str = "You turn a user's file search request into a SQLite FTS5 query. \
Reply with JSON only: {\"fts\": \"...\", \"filters\": {\"exts\": [\".pdf\"], \"years\": [2023]}, \"notes\": \"...\"}. \
Use OR between synonyms and quote multi-word phrases. Leave filters empty unless the request names a file type or a year.";

const SUMMARY_SYSTEM: &str = "You summarize file search results for the user. \
Only use the snippets provided. Name files by their file name.";

const RELATED_SYSTEM: &str = "You suggest alternative file search queries. \
Reply with at most three queries, one per line, no numbering.";

const SUMMARY_RESULTS: usize = 8;
const SUMMARY_SNIPPET_CHARS: usize = 160;

impl Enhancer {
    pub fn new(client: Option<Arc<dyn LlmClient>>, ledger: Arc<TokenLedger>, config: AiConfig) -> Self {
        Self {
            client,
            ledger,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.client.is_some()
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    /// Quality gate for search-time enrichment. `None` means go ahead.
    pub fn gate(&self, requested: bool, query: &str, lexical_hits: usize) -> Option<SkipReason> {
        if !requested {
            return Some(SkipReason::NotRequested);
        }
        if !self.is_enabled() {
            return Some(SkipReason::Disabled);
        }
        if query.trim().chars().count() < self.config.min_query_chars {
            return Some(SkipReason::QueryTooShort);
        }
        if lexical_hits >= self.config.good_results_threshold {
            return Some(SkipReason::EnoughResults);
        }
        None
    }

    /// Ask the model for an engine query and filters.
    pub async fn rewrite(&self, query: &str) -> Outcome<RewritePlan> {
        let request = CompletionRequest {
            system: REWRITE_SYSTEM.to_string(),
            prompt: format!("Request: {}", truncate_chars(query, 200)),
            max_tokens: 120,
            temperature: 0.1,
        };
        match self.call(&request, "rewrite").await {
            Outcome::Done { value, tokens } => match parse_rewrite(&value.text) {
                Ok(plan) => Outcome::Done { value: plan, tokens },
                Err(e) => {
                    tracing::warn!(error = %e, "unusable rewrite response");
                    Outcome::Failed(format!("malformed rewrite response: {}", e))
                }
            },
            Outcome::Skipped(r) => Outcome::Skipped(r),
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    /// `results` are `(path, snippet)` pairs that have already been redacted.
    pub async fn summarize(
        &self,
        query: &str,
        results: &[(String, String)],
        style: &str,
        max_tokens: u32,
    ) -> Outcome<String> {
        let mut listing = String::new();
        for (i, (path, snippet)) in results.iter().take(SUMMARY_RESULTS).enumerate() {
            listing.push_str(&format!(
                "{}. {}\n   {}\n",
                i + 1,
                file_name(path),
                truncate_chars(snippet, SUMMARY_SNIPPET_CHARS).replace('\n', " ")
            ));
        }
        let request = CompletionRequest {
            system: SUMMARY_SYSTEM.to_string(),
            prompt: format!(
                "Query: {}\nStyle: {}\nResults:\n{}",
                truncate_chars(query, 200),
                style,
                listing
            ),
            max_tokens,
            temperature: 0.3,
        };
        match self.call(&request, "summarize").await {
            Outcome::Done { value, tokens } => Outcome::Done {
                value: value.text,
                tokens,
            },
            Outcome::Skipped(r) => Outcome::Skipped(r),
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    /// Up to three follow-up queries.
    pub async fn related_queries(&self, query: &str, extensions: &[String]) -> Outcome<Vec<String>> {
        let kinds = if extensions.is_empty() {
            "any".to_string()
        } else {
            extensions.join(", ")
        };
        let request = CompletionRequest {
            system: RELATED_SYSTEM.to_string(),
            prompt: format!(
                "Original query: {}\nFile types found: {}",
                truncate_chars(query, 100),
                kinds
            ),
            max_tokens: 60,
            temperature: 0.5,
        };
        match self.call(&request, "related").await {
            Outcome::Done { value, tokens } => Outcome::Done {
                value: parse_related(&value.text),
                tokens,
            },
            Outcome::Skipped(r) => Outcome::Skipped(r),
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    async fn call(&self, request: &CompletionRequest, purpose: &str) -> Outcome<Completion> {
        let Some(client) = self.client.as_ref().filter(|_| self.config.enabled) else {
            return Outcome::Skipped(SkipReason::Disabled);
        };

        let estimate = estimate_tokens(&request.system)
            + estimate_tokens(&request.prompt)
            + u64::from(request.max_tokens);
        match self.ledger.check(estimate).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(purpose, estimate, "token budget exhausted, skipping AI call");
                return Outcome::Skipped(SkipReason::BudgetExhausted);
            }
            Err(e) => return Outcome::Failed(format!("ledger unavailable: {:#}", e)),
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let completion = match tokio::time::timeout(timeout, client.complete(request)).await {
            Err(_) => {
                tracing::warn!(purpose, timeout_secs = self.config.timeout_secs, "AI call timed out");
                return Outcome::Failed("timed out".to_string());
            }
            Ok(Err(e)) => {
                tracing::warn!(purpose, error = %e, "AI call failed");
                return Outcome::Failed(format!("{:#}", e));
            }
            Ok(Ok(c)) => c,
        };

        if let Err(e) = self.ledger.charge(completion.tokens_used).await {
            tracing::error!(purpose, tokens = completion.tokens_used, error = %e, "failed to record token usage");
        }
        let tokens = completion.tokens_used;
        Outcome::Done {
            value: completion,
            tokens,
        }
    }
}

#[derive(Deserialize)]
struct RewriteJson {
    fts: String,
    #[serde(default)]
    filters: RewriteFilters,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize, Default)]
struct RewriteFilters {
    #[serde(default)]
    exts: Vec<String>,
    #[serde(default)]
    years: Vec<serde_json::Value>,
}

/// Accepts the JSON shape or `FTS:` / `Extensions:` / `Years:` / `Notes:` lines.
pub fn parse_rewrite(text: &str) -> Result<RewritePlan> {
    let trimmed = strip_code_fence(text.trim());

    let plan = if trimmed.starts_with('{') {
        let parsed: RewriteJson = serde_json::from_str(trimmed)?;
        RewritePlan {
            fts: parsed.fts.trim().to_string(),
            extensions: parsed.filters.exts,
            years: parsed
                .filters
                .years
                .iter()
                .filter_map(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
                .filter_map(|y| i32::try_from(y).ok())
                .collect(),
            notes: parsed.notes,
        }
    } else {
        let mut plan = RewritePlan::default();
        for line in trimmed.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("FTS:") {
                plan.fts = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("Extensions:") {
                plan.extensions = split_list(rest);
            } else if let Some(rest) = line.strip_prefix("Years:") {
                plan.years = split_list(rest).iter().filter_map(|y| y.parse().ok()).collect();
            } else if let Some(rest) = line.strip_prefix("Notes:") {
                plan.notes = rest.trim().to_string();
            }
        }
        plan
    };

    if plan.fts.is_empty() {
        bail!("no FTS query in response");
    }
    Ok(plan)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_related(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| strip_list_marker(l.trim()).trim_matches('"').to_string())
        .filter(|l| !l.is_empty())
        .take(3)
        .collect()
}

/// Drops `1.`, `2)`, `-`, `*` or `•` list markers.
fn strip_list_marker(line: &str) -> &str {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line.trim_start_matches(['-', '*', '•']).trim_start()
}

/// Local digest used whenever the model is unavailable.
pub fn fallback_summary(paths: &[String]) -> String {
    if paths.is_empty() {
        return "No results found.".to_string();
    }
    let mut by_ext: BTreeMap<String, usize> = BTreeMap::new();
    for path in paths {
        let ext = std::path::Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        *by_ext.entry(ext).or_default() += 1;
    }
    let mut summary = format!("Found {} files:", paths.len());
    for (ext, count) in by_ext.iter().filter(|(e, _)| !e.is_empty()) {
        summary.push_str(&format!("\n• {} {} files", count, ext.to_uppercase()));
    }
    summary
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
