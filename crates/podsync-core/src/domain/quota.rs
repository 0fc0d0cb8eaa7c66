//! Quota domain types
//!
//! The remote service meters calls per hour in two independent buckets:
//! ordinary reads ("general") and expensive operations such as file
//! listings, exports and downloads ("rate limited"). This module models
//! one bucket per category plus the suspension deadline that is active
//! once a bucket runs dry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Operation category, each with its own quota bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaCategory {
    /// Ordinary metadata reads
    Lightweight,
    /// Writes, exports, file listings and downloads
    Heavyweight,
}

impl QuotaCategory {
    /// All categories, in a stable order
    pub const ALL: [QuotaCategory; 2] = [QuotaCategory::Lightweight, QuotaCategory::Heavyweight];

    /// Name used by the remote service for this bucket
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaCategory::Lightweight => "general",
            QuotaCategory::Heavyweight => "rate_limited",
        }
    }
}

impl std::fmt::Display for QuotaCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuotaCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" | "lightweight" => Ok(QuotaCategory::Lightweight),
            "rate_limited" | "heavyweight" => Ok(QuotaCategory::Heavyweight),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown quota category: {other}"
            ))),
        }
    }
}

/// Quota figures reported by the server alongside a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaHeaders {
    /// Calls permitted per window
    pub limit: Option<u32>,
    /// Calls left in the current window
    pub remaining: Option<u32>,
}

impl QuotaHeaders {
    /// Returns true if the server reported nothing usable
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none()
    }
}

/// Remaining permitted calls for one category within a rolling window
///
/// `remaining` never leaves `[0, limit]`. The window is reset lazily:
/// the first access at or after `window_reset_at` refills the bucket and
/// starts a new window from that moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBucket {
    category: QuotaCategory,
    limit: u32,
    remaining: u32,
    window_reset_at: DateTime<Utc>,
}

impl QuotaBucket {
    /// Creates a full bucket whose first window starts at `now`
    pub fn new(category: QuotaCategory, limit: u32, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            category,
            limit,
            remaining: limit,
            window_reset_at: now + chrono_window(window),
        }
    }

    pub fn category(&self) -> QuotaCategory {
        self.category
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn window_reset_at(&self) -> DateTime<Utc> {
        self.window_reset_at
    }

    /// Refills the bucket if its window has elapsed
    ///
    /// # Returns
    /// `true` if a reset happened
    pub fn refresh(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        if now < self.window_reset_at {
            return false;
        }
        self.remaining = self.limit;
        self.window_reset_at = now + chrono_window(window);
        true
    }

    /// Takes one call from the bucket
    ///
    /// # Returns
    /// `false` (and leaves the bucket untouched) when nothing remains
    pub fn try_take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Applies server-reported figures; the server is authoritative
    pub fn apply_headers(&mut self, headers: &QuotaHeaders) {
        if let Some(limit) = headers.limit {
            self.limit = limit;
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = remaining;
        }
        self.remaining = self.remaining.min(self.limit);
    }
}

/// Suspension deadline for a category whose quota is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRateLimit {
    category: QuotaCategory,
    resume_at: DateTime<Utc>,
}

impl ActiveRateLimit {
    pub fn new(category: QuotaCategory, resume_at: DateTime<Utc>) -> Self {
        Self {
            category,
            resume_at,
        }
    }

    pub fn category(&self) -> QuotaCategory {
        self.category
    }

    pub fn resume_at(&self) -> DateTime<Utc> {
        self.resume_at
    }

    /// Returns true once `now` has reached the resume time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.resume_at
    }

    /// Time left until the limit lifts, zero if already expired
    pub fn remaining_wait(&self, now: DateTime<Utc>) -> Duration {
        (self.resume_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Merges another limit for the same category, keeping the later deadline
    pub fn merge(self, other: ActiveRateLimit) -> ActiveRateLimit {
        if other.resume_at > self.resume_at {
            other
        } else {
            self
        }
    }
}

fn chrono_window(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1))
}
