//! Turns a user query plus filters into an engine query.
//!
//! Quoted phrases stay phrases; every other word becomes a quoted FTS5 term
//! and the terms are OR-joined. When phrases and terms are both present the
//! result is `"p1" AND "p2" AND ("t1" OR "t2")`. User input never reaches
//! MATCH unquoted, so FTS5 operators and column filters in the raw text are
//! inert.

use regex::Regex;
use std::sync::OnceLock;

use crate::ai::RewritePlan;
use crate::error::{ApiError, ApiResult};
use crate::models::SearchFilters;

/// A validated query: the FTS5 expression, the terms used for snippet
/// windows, and normalized filters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub engine_query: String,
    /// Words and phrases used to place snippet windows.
    pub terms: Vec<String>,
    pub filters: SearchFilters,
    pub notes: String,
}

fn phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]*)""#).expect("static regex"))
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("static regex"))
}

/// Deterministic plan: the raw query with the caller's filters only.
pub fn plan(query: &str, filters: &SearchFilters) -> ApiResult<QueryPlan> {
    let (engine_query, terms) = build_fts_query(query)?;
    Ok(QueryPlan {
        engine_query,
        terms,
        filters: normalize_filters(filters)?,
        notes: String::new(),
    })
}

/// Plan from a model rewrite. Caller filters win; the model's filters are
/// used only for the kinds the caller left empty. Returns `None` when the
/// rewrite yields nothing searchable.
pub fn plan_from_rewrite(
    original: &QueryPlan,
    rewrite: &RewritePlan,
) -> Option<QueryPlan> {
    let (engine_query, terms) = build_fts_query(&rewrite.fts).ok()?;

    let mut filters = original.filters.clone();
    if filters.extensions.is_empty() {
        filters.extensions = normalize_extensions(&rewrite.extensions).unwrap_or_default();
    }
    if filters.years.is_empty() {
        filters.years = rewrite
            .years
            .iter()
            .copied()
            .filter(|y| valid_year(*y))
            .collect();
    }

    Some(QueryPlan {
        engine_query,
        terms,
        filters,
        notes: rewrite.notes.clone(),
    })
}

/// Returns the FTS5 expression and the highlight terms.
pub fn build_fts_query(query: &str) -> ApiResult<(String, Vec<String>)> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ApiError::validation("query must not be empty"));
    }

    let mut phrases = Vec::new();
    for cap in phrase_re().captures_iter(query) {
        let words: Vec<&str> = word_re().find_iter(&cap[1]).map(|m| m.as_str()).collect();
        if !words.is_empty() {
            phrases.push(words.join(" "));
        }
    }

    let remaining = phrase_re().replace_all(query, " ");
    let mut words: Vec<String> = Vec::new();
    for m in word_re().find_iter(&remaining) {
        let w = m.as_str();
        if matches!(w, "AND" | "OR" | "NOT" | "NEAR") {
            continue;
        }
        if !words.iter().any(|x| x == w) {
            words.push(w.to_string());
        }
    }

    let quoted_phrases: Vec<String> = phrases.iter().map(|p| format!("\"{}\"", p)).collect();
    let quoted_words: Vec<String> = words.iter().map(|w| format!("\"{}\"", w)).collect();

    let expr = match (quoted_phrases.is_empty(), quoted_words.is_empty()) {
        (true, true) => {
            return Err(ApiError::validation(
                "query has no searchable words",
            ))
        }
        (false, true) => quoted_phrases.join(" AND "),
        (true, false) => quoted_words.join(" OR "),
        (false, false) if quoted_words.len() == 1 => {
            format!("{} AND {}", quoted_phrases.join(" AND "), quoted_words[0])
        }
        (false, false) => format!(
            "{} AND ({})",
            quoted_phrases.join(" AND "),
            quoted_words.join(" OR ")
        ),
    };

    let mut terms = phrases;
    terms.extend(words);
    Ok((expr, terms))
}

/// Validate years and normalize extensions. Duplicates are dropped.
pub fn normalize_filters(filters: &SearchFilters) -> ApiResult<SearchFilters> {
    let mut years = Vec::new();
    for &y in &filters.years {
        if !valid_year(y) {
            return Err(ApiError::validation(format!("year out of range: {}", y)));
        }
        if !years.contains(&y) {
            years.push(y);
        }
    }
    Ok(SearchFilters {
        extensions: normalize_extensions(&filters.extensions)?,
        years,
    })
}

/// `"PDF"`, `".pdf"` and `" .Pdf "` all become `".pdf"`.
pub fn normalize_extensions(exts: &[String]) -> ApiResult<Vec<String>> {
    let mut out = Vec::new();
    for raw in exts {
        let trimmed = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ApiError::validation(format!("invalid extension: {}", raw)));
        }
        let ext = format!(".{}", trimmed);
        if !out.contains(&ext) {
            out.push(ext);
        }
    }
    Ok(out)
}

fn valid_year(year: i32) -> bool {
    (1970..=9999).contains(&year)
}

/// `[Jan 1 year, Jan 1 year+1)` in UTC milliseconds, one range per year.
pub fn year_ranges(years: &[i32]) -> Vec<(i64, i64)> {
    years
        .iter()
        .filter_map(|&y| Some((jan_first_millis(y)?, jan_first_millis(y + 1)?)))
        .collect()
}

fn jan_first_millis(year: i32) -> Option<i64> {
    chrono::NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}
