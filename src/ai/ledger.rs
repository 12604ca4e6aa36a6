//! Daily token budget.
//!
//! The ledger is created once at startup, handed to the enhancer, and
//! mutated only under its mutex. Every charge is written through to the
//! `token_usage` table before the lock is released, so a restart resumes
//! from the persisted total.

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::AiConfig;
use crate::models::UsageStats;

const HISTORY_DAYS: i64 = 30;

#[derive(Debug)]
struct LedgerDay {
    day: String,
    used: u64,
}

/// Daily token budget. The current day's total is cached and every
/// charge is upserted into `token_usage`.
pub struct TokenLedger {
    pool: SqlitePool,
    daily_limit: u64,
    per_request_limit: u64,
    state: Mutex<LedgerDay>,
}

/// UTC calendar day, `YYYY-MM-DD`.
pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

impl TokenLedger {
    /// Load today's total from the database.
    pub async fn load(pool: SqlitePool, config: &AiConfig) -> Result<Self> {
        let day = today();
        let used = read_day(&pool, &day).await?;
        Ok(Self {
            pool,
            daily_limit: config.daily_token_limit,
            per_request_limit: config.per_request_token_limit,
            state: Mutex::new(LedgerDay { day, used }),
        })
    }

    /// True when a call estimated at `estimate` tokens fits both limits.
    pub async fn check(&self, estimate: u64) -> Result<bool> {
        self.check_on(&today(), estimate).await
    }

    /// Whether `estimate` more tokens fit both the per-request and the daily
    /// limit on `day`.
    pub async fn check_on(&self, day: &str, estimate: u64) -> Result<bool> {
        if estimate > self.per_request_limit {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, day).await?;
        Ok(state.used.saturating_add(estimate) <= self.daily_limit)
    }

    /// Add the tokens a completed call actually consumed. Returns the new
    /// total for the day.
    pub async fn charge(&self, tokens: u64) -> Result<u64> {
        self.charge_on(&today(), tokens).await
    }

    /// Add `tokens` to `day` and return the new total.
    pub async fn charge_on(&self, day: &str, tokens: u64) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, day).await?;

        let now = chrono::Utc::now().timestamp();
        let total: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO token_usage (day, tokens_used, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(day) DO UPDATE SET
                tokens_used = tokens_used + excluded.tokens_used,
                updated_at = excluded.updated_at
            RETURNING tokens_used
            "#,
        )
        .bind(day)
        .bind(tokens as i64)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        state.used = total.max(0) as u64;
        tracing::info!(day, tokens, total = state.used, "tokens charged");
        Ok(state.used)
    }

    pub async fn usage(&self) -> Result<UsageStats> {
        self.usage_on(&today()).await
    }

    pub async fn usage_on(&self, day: &str) -> Result<UsageStats> {
        let mut state = self.state.lock().await;
        self.roll_over(&mut state, day).await?;
        Ok(UsageStats {
            day: state.day.clone(),
            today_usage: state.used,
            daily_limit: self.daily_limit,
            remaining: self.daily_limit.saturating_sub(state.used),
        })
    }

    pub fn per_request_limit(&self) -> u64 {
        self.per_request_limit
    }

    async fn roll_over(&self, state: &mut LedgerDay, day: &str) -> Result<()> {
        if state.day == day {
            return Ok(());
        }
        state.used = read_day(&self.pool, day).await?;
        state.day = day.to_string();

        if let Ok(date) = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d") {
            let cutoff = (date - chrono::Duration::days(HISTORY_DAYS))
                .format("%Y-%m-%d")
                .to_string();
            let pruned = sqlx::query("DELETE FROM token_usage WHERE day < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if pruned > 0 {
                tracing::debug!(pruned, cutoff = %cutoff, "pruned token usage history");
            }
        }
        Ok(())
    }
}

async fn read_day(pool: &SqlitePool, day: &str) -> Result<u64> {
    let used: Option<i64> = sqlx::query_scalar("SELECT tokens_used FROM token_usage WHERE day = ?")
        .bind(day)
        .fetch_optional(pool)
        .await?;
    Ok(used.unwrap_or(0).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn ledger(daily: u64, per_request: u64) -> (SqlitePool, TokenLedger) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let config = AiConfig {
            daily_token_limit: daily,
            per_request_token_limit: per_request,
            ..AiConfig::default()
        };
        let ledger = TokenLedger::load(pool.clone(), &config).await.unwrap();
        (pool, ledger)
    }

    #[tokio::test]
    async fn daily_limit_blocks_overflowing_request() {
        let (_pool, ledger) = ledger(100, 50).await;
        ledger.charge_on("2024-03-01", 95).await.unwrap();
        assert!(!ledger.check_on("2024-03-01", 10).await.unwrap());
        assert!(ledger.check_on("2024-03-01", 5).await.unwrap());
    }

    #[tokio::test]
    async fn per_request_limit_is_independent() {
        let (_pool, ledger) = ledger(10_000, 50).await;
        assert!(!ledger.check_on("2024-03-01", 51).await.unwrap());
        assert!(ledger.check_on("2024-03-01", 50).await.unwrap());
    }

    #[tokio::test]
    async fn charges_persist_and_roll_over() {
        let (pool, ledger) = ledger(100, 100).await;
        ledger.charge_on("2024-03-01", 40).await.unwrap();
        assert_eq!(ledger.charge_on("2024-03-01", 2).await.unwrap(), 42);

        let reloaded = TokenLedger::load(pool.clone(), &AiConfig::default()).await.unwrap();
        assert_eq!(reloaded.usage_on("2024-03-01").await.unwrap().today_usage, 42);

        let next = ledger.usage_on("2024-03-02").await.unwrap();
        assert_eq!(next.today_usage, 0);
        assert_eq!(next.remaining, 100);
    }

    #[tokio::test]
    async fn old_history_is_pruned() {
        let (pool, ledger) = ledger(100, 100).await;
        ledger.charge_on("2024-01-01", 7).await.unwrap();
        ledger.charge_on("2024-03-15", 1).await.unwrap();
        let days: Vec<String> = sqlx::query_scalar("SELECT day FROM token_usage ORDER BY day")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(days, vec!["2024-03-15".to_string()]);
    }
}
