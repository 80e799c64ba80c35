//! Fixed-window rate limiting for shared-quota completion requests.
//!
//! The counter store must provide atomic increment-and-read; here that is
//! the `rate_limits` table's upsert (`count = count + 1 RETURNING count`),
//! which SQLite serializes, so concurrent requests from the same identity
//! within the same window cannot lose increments.
//!
//! Requests carrying a caller-supplied model API key bypass the limiter
//! entirely and are never counted — that gating happens at the call site.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;
use crate::server::db::DbHandle;

/// Machine-readable limit descriptor returned alongside a 429.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitInfo {
    pub amount: i64,
    pub remaining: i64,
    /// Unix timestamp at which the current window ends.
    pub reset: i64,
}

#[derive(Debug, Clone, Copy)]
pub enum RateDecision {
    Allowed { remaining: i64 },
    Limited(LimitInfo),
}

#[derive(Clone)]
pub struct RateLimiter {
    db: DbHandle,
    max_requests: i64,
    window_secs: i64,
}

impl RateLimiter {
    pub fn new(db: DbHandle, config: &RateLimitConfig) -> Self {
        Self {
            db,
            max_requests: config.max_requests,
            window_secs: config.window_secs,
        }
    }

    /// Count this request against the identity's current window and decide.
    pub async fn check(&self, identity: &str) -> Result<RateDecision> {
        self.check_at(identity, chrono::Utc::now().timestamp()).await
    }

    /// Same as `check` but with an injected clock, for tests.
    pub async fn check_at(&self, identity: &str, now: i64) -> Result<RateDecision> {
        let window_start = now - now.rem_euclid(self.window_secs);
        let identity = identity.to_string();
        let count = self
            .db
            .call(move |db| db.increment_rate_counter(&identity, window_start))
            .await?;

        if count > self.max_requests {
            Ok(RateDecision::Limited(LimitInfo {
                amount: self.max_requests,
                remaining: 0,
                reset: window_start + self.window_secs,
            }))
        } else {
            Ok(RateDecision::Allowed {
                remaining: self.max_requests - count,
            })
        }
    }
}
