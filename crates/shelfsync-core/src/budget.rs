//! Token-bucket accounting for the external API allowance, plus the operator-side usage planner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Locale;

/// Tokens older than this many minutes of refill are discarded by the API, which bounds the bucket.
pub const BUCKET_WINDOW_MINUTES: f64 = 60.0;

/// Read-only view handed to the scheduler and the shell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudgetSnapshot {
    pub available: f64,
    pub capacity: f64,
    pub refill_per_minute: f64,
    pub observed_at: DateTime<Utc>,
}

/// Refillable token bucket. Overwritten from the latest API response, refilled locally between observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    available: f64,
    capacity: f64,
    refill_per_minute: f64,
    last_observed_at: DateTime<Utc>,
    accounted_at: DateTime<Utc>,
}

impl RateBudget {
    pub const DEFAULT_CAPACITY: f64 = 3600.0;
    pub const DEFAULT_REFILL_PER_MINUTE: f64 = 60.0;

    pub fn new(available: f64, capacity: f64, refill_per_minute: f64, at: DateTime<Utc>) -> Self {
        Self {
            available: available.min(capacity),
            capacity,
            refill_per_minute: refill_per_minute.max(0.0),
            last_observed_at: at,
            accounted_at: at,
        }
    }

    pub fn full(at: DateTime<Utc>) -> Self {
        Self::new(
            Self::DEFAULT_CAPACITY,
            Self::DEFAULT_CAPACITY,
            Self::DEFAULT_REFILL_PER_MINUTE,
            at,
        )
    }

    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_minute(&self) -> f64 {
        self.refill_per_minute
    }

    pub fn last_observed_at(&self) -> DateTime<Utc> {
        self.last_observed_at
    }

    /// Replace local state with what the API just reported.
    pub fn observe(&mut self, tokens_left: f64, refill_per_minute: f64, at: DateTime<Utc>) {
        self.refill_per_minute = refill_per_minute.max(0.0);
        if self.refill_per_minute > 0.0 {
            self.capacity = self.refill_per_minute * BUCKET_WINDOW_MINUTES;
        }
        self.available = tokens_left;
        self.last_observed_at = at;
        self.accounted_at = at;
    }

    /// Balance projected to `now` without mutating state.
    pub fn projected(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = (now - self.accounted_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return self.available;
        }
        let minutes = elapsed_ms as f64 / 60_000.0;
        (self.available + minutes * self.refill_per_minute).min(self.capacity.max(self.available))
    }

    pub fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.accounted_at {
            return;
        }
        self.available = self.projected(now);
        self.accounted_at = now;
    }

    /// The API lets the balance go negative; so does this.
    pub fn debit(&mut self, cost: f64) {
        self.available -= cost.max(0.0);
    }

    pub fn can_admit(&self, cost: f64, now: DateTime<Utc>) -> bool {
        self.projected(now) >= cost
    }

    /// Time until `cost` can be admitted; `None` when it never can at the current rate and capacity.
    pub fn wait_for(&self, cost: f64, now: DateTime<Utc>) -> Option<Duration> {
        if self.can_admit(cost, now) {
            return Some(Duration::ZERO);
        }
        let projected = self.projected(now);
        if self.refill_per_minute <= 0.0 || cost > self.capacity {
            return None;
        }
        let minutes = (cost - projected) / self.refill_per_minute;
        Some(Duration::from_secs_f64(minutes * 60.0))
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TokenBudgetSnapshot {
        TokenBudgetSnapshot {
            available: self.projected(now),
            capacity: self.capacity,
            refill_per_minute: self.refill_per_minute,
            observed_at: self.last_observed_at,
        }
    }
}

/// Requested throughput for one locale in the planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocaleLoad {
    pub locale: Locale,
    pub products: u32,
    pub delay_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerSettings {
    pub capacity: f64,
    pub refill_per_minute: f64,
    pub tokens_per_product: f64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            capacity: RateBudget::DEFAULT_CAPACITY,
            refill_per_minute: RateBudget::DEFAULT_REFILL_PER_MINUTE,
            tokens_per_product: 11.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsagePlan {
    pub processes_per_minute: f64,
    pub tokens_used_per_minute: f64,
    pub net_change_per_minute: f64,
    pub total_minutes: f64,
    /// First simulated minute at which the balance goes negative.
    pub dips_below_zero_at: Option<u32>,
}

impl TokenUsagePlan {
    pub fn is_sustainable(&self) -> bool {
        self.dips_below_zero_at.is_none()
    }
}

/// Simulates running every load in parallel, paced by the slowest delay, minute by minute.
/// Returns `None` when there is nothing to plan.
pub fn plan_token_usage(
    current_tokens: f64,
    loads: &[LocaleLoad],
    settings: PlannerSettings,
) -> Option<TokenUsagePlan> {
    let total_products: u64 = loads.iter().map(|l| u64::from(l.products)).sum();
    let max_delay = loads
        .iter()
        .map(|l| l.delay_secs)
        .filter(|d| d.is_finite())
        .fold(0.0_f64, f64::max);
    if total_products == 0 || max_delay <= 0.0 {
        return None;
    }

    let processes_per_minute = (60.0 / max_delay) * loads.len() as f64;
    let tokens_used_per_minute = processes_per_minute * settings.tokens_per_product;
    let net_change_per_minute = settings.refill_per_minute - tokens_used_per_minute;
    let total_minutes = total_products as f64 / processes_per_minute;

    let mut tokens = current_tokens;
    let mut dips_below_zero_at = None;
    let mut minute = 0u32;
    while f64::from(minute) < total_minutes {
        tokens = (tokens + settings.refill_per_minute).min(settings.capacity) - tokens_used_per_minute;
        if tokens < 0.0 {
            dips_below_zero_at = Some(minute);
            break;
        }
        minute += 1;
    }

    Some(TokenUsagePlan {
        processes_per_minute,
        tokens_used_per_minute,
        net_change_per_minute,
        total_minutes,
        dips_below_zero_at,
    })
}
