//! Boundary checks wrapped around every operation.
//!
//! [`Guardrails`] bundles the allow-list, the redactor, the per-caller rate
//! limiter and the audit sink. The service layer consults it before doing
//! any work and passes every outgoing snippet or preview through
//! [`Guardrails::sanitize_snippet`] / [`Guardrails::sanitize_preview`].

pub mod allowlist;
pub mod audit;
pub mod ratelimit;
pub mod redact;
pub mod snippet;

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;

pub use allowlist::AllowList;
pub use audit::{AuditLog, AuditRecord};
pub use ratelimit::RateLimiter;
pub use redact::Redactor;

/// Rate-limit class. Each caller has an independent bucket per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpClass {
    Roots,
    Index,
    Search,
    Preview,
    Summarize,
    Rewrite,
}

impl OpClass {
    pub const ALL: [OpClass; 6] = [
        OpClass::Roots,
        OpClass::Index,
        OpClass::Search,
        OpClass::Preview,
        OpClass::Summarize,
        OpClass::Rewrite,
    ];

    /// Config key such as `"search"` to class.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "roots" => Some(OpClass::Roots),
            "index" => Some(OpClass::Index),
            "search" => Some(OpClass::Search),
            "preview" => Some(OpClass::Preview),
            "summarize" => Some(OpClass::Summarize),
            "rewrite" => Some(OpClass::Rewrite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Roots => "roots",
            OpClass::Index => "index",
            OpClass::Search => "search",
            OpClass::Preview => "preview",
            OpClass::Summarize => "summarize",
            OpClass::Rewrite => "rewrite",
        }
    }
}

/// Everything an operation passes through before and after it runs.
pub struct Guardrails {
    pub allowlist: AllowList,
    pub redactor: Redactor,
    pub limiter: RateLimiter,
    pub audit: AuditLog,
    snippet_max_bytes: usize,
    context_max_chars: usize,
    log_query_text: bool,
}

impl Guardrails {
    pub fn from_config(config: &Config) -> Result<Self> {
        let g = &config.guardrails;
        Ok(Self {
            allowlist: AllowList::new(&config.roots),
            redactor: Redactor::new(&g.redaction_rules)?,
            limiter: RateLimiter::new(&g.rate_limits),
            audit: AuditLog::open(g.audit_log_path.as_deref())?,
            snippet_max_bytes: g.snippet_max_bytes,
            context_max_chars: g.context_max_chars,
            log_query_text: g.log_query_text,
        })
    }

    /// Redact the whole chunk, then window it around the first term and cap
    /// the result. Redacting first means a window edge can never cut a
    /// secret in half and leak the remainder.
    pub fn sanitize_snippet(&self, content: &str, terms: &[String]) -> String {
        let clean = self.redactor.redact(content);
        let window = snippet::window_around(&clean, terms, self.snippet_max_bytes);
        snippet::cap_bytes(&window, self.snippet_max_bytes).0.to_string()
    }

    /// Redact, cut the `before`/`after` window (clamped) and cap. The flag is
    /// true when anything was dropped.
    pub fn sanitize_preview(&self, content: &str, before: usize, after: usize) -> (String, bool) {
        let before = before.min(self.context_max_chars);
        let after = after.min(self.context_max_chars);
        let clean = self.redactor.redact(content);
        let (window, cut) = snippet::centered_window(&clean, before, after);
        let (capped, capped_cut) = snippet::cap_bytes(window, self.snippet_max_bytes);
        (capped.to_string(), cut || capped_cut)
    }

    /// Query text for the audit record, or `None` when logging it is off.
    pub fn audit_query(&self, query: Option<&str>) -> Option<String> {
        if self.log_query_text {
            query.map(|q| q.to_string())
        } else {
            None
        }
    }

    pub fn snippet_max_bytes(&self) -> usize {
        self.snippet_max_bytes
    }
}
