//! Approximate usage counters
//!
//! Tokens are estimated from message length (four characters per token).
//! Counters roll over when the calendar day, ISO week or month changes.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Estimate the token count of a message of `len` characters
pub fn estimate_tokens(len: usize) -> u64 {
    len.div_ceil(4) as u64
}

/// Token and request counters for the current day, week and month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub tokens_today: u64,
    pub tokens_week: u64,
    pub tokens_month: u64,
    pub requests_today: u64,
    pub requests_week: u64,
    pub requests_month: u64,
    pub last_reset: DateTime<Utc>,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl UsageStats {
    /// Empty counters anchored at `now`
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            tokens_today: 0,
            tokens_week: 0,
            tokens_month: 0,
            requests_today: 0,
            requests_week: 0,
            requests_month: 0,
            last_reset: now,
        }
    }

    /// Count one request carrying a message of `message_len` characters
    pub fn record(&mut self, message_len: usize, now: DateTime<Utc>) {
        self.roll_over(now);
        let tokens = estimate_tokens(message_len);
        self.tokens_today += tokens;
        self.tokens_week += tokens;
        self.tokens_month += tokens;
        self.requests_today += 1;
        self.requests_week += 1;
        self.requests_month += 1;
    }

    /// Approximate monthly cost given a price per million tokens
    pub fn estimated_cost(&self, per_million: f64) -> f64 {
        (self.tokens_month as f64 / 1_000_000.0) * per_million
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        let last = self.last_reset;
        if now.date_naive() != last.date_naive() {
            self.tokens_today = 0;
            self.requests_today = 0;
        }
        if now.iso_week() != last.iso_week() {
            self.tokens_week = 0;
            self.requests_week = 0;
        }
        if (now.year(), now.month()) != (last.year(), last.month()) {
            self.tokens_month = 0;
            self.requests_month = 0;
        }
        self.last_reset = now;
    }
}
