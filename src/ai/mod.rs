//! AI enhancement adapter and its token budget.
//!
//! AI is opt-in twice over: the server must enable it in `[ai]`, and each
//! caller must ask for it per request. Everything in this module degrades to
//! "no enhancement" instead of failing.

pub mod client;
pub mod enhancer;
pub mod ledger;

pub use client::{create_client, Completion, CompletionRequest, LlmClient};
pub use enhancer::{fallback_summary, Enhancer, Outcome, RewritePlan, SkipReason};
pub use ledger::TokenLedger;

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
