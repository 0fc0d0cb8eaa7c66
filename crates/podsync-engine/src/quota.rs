//! Per-category quota accounting
//!
//! The remote service allows a fixed number of calls per hour and per
//! category. [`QuotaTracker`] keeps one bucket per [`QuotaCategory`],
//! reconciles it with the figures the server reports, and records the
//! deadline at which an exhausted category may be used again.
//!
//! ## Architecture
//!
//! - Buckets reset lazily: the first access at or after a bucket's
//!   `window_reset_at` refills it.
//! - An [`ActiveRateLimit`] blocks its category until `resume_at`, or until
//!   an operator clears it. At most one limit exists per category.
//! - All state sits behind a single mutex; time comes from the injected
//!   [`Clock`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use podsync_core::domain::QuotaCategory;
//! use podsync_engine::{QuotaSettings, QuotaTracker, SystemClock};
//!
//! let tracker = QuotaTracker::new(QuotaSettings::default(), Arc::new(SystemClock));
//! match tracker.reserve(QuotaCategory::Lightweight) {
//!     Ok(()) => { /* issue the call */ }
//!     Err(exhausted) => { /* suspend until the reported resume time */ }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use podsync_core::config::QuotaConfig;
use podsync_core::domain::{ActiveRateLimit, QuotaBucket, QuotaCategory, QuotaHeaders, ScanError};

use crate::clock::Clock;

// ============================================================================
// QuotaSettings
// ============================================================================

/// Bucket sizes and window length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSettings {
    /// Lightweight calls per window
    pub general_limit: u32,
    /// Heavyweight calls per window
    pub heavy_limit: u32,
    /// Window length
    pub window: Duration,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            general_limit: 1000,
            heavy_limit: 250,
            window: Duration::from_secs(3600),
        }
    }
}

impl From<&QuotaConfig> for QuotaSettings {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            general_limit: config.general_per_hour,
            heavy_limit: config.heavy_per_hour,
            window: config.window(),
        }
    }
}

impl QuotaSettings {
    fn limit_for(&self, category: QuotaCategory) -> u32 {
        match category {
            QuotaCategory::Lightweight => self.general_limit,
            QuotaCategory::Heavyweight => self.heavy_limit,
        }
    }
}

// ============================================================================
// QuotaTracker
// ============================================================================

#[derive(Debug)]
struct TrackerState {
    buckets: HashMap<QuotaCategory, QuotaBucket>,
    active: HashMap<QuotaCategory, ActiveRateLimit>,
}

/// Owner of the quota buckets and active rate limits
pub struct QuotaTracker {
    settings: QuotaSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("settings", &self.settings)
            .finish()
    }
}

impl QuotaTracker {
    /// Creates a tracker with full buckets whose first window starts now
    pub fn new(settings: QuotaSettings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let buckets = QuotaCategory::ALL
            .iter()
            .map(|&category| {
                (
                    category,
                    QuotaBucket::new(category, settings.limit_for(category), now, settings.window),
                )
            })
            .collect();
        Self {
            settings,
            clock,
            state: Mutex::new(TrackerState {
                buckets,
                active: HashMap::new(),
            }),
        }
    }

    /// Returns the clock the tracker reads time from
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &QuotaSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refreshes the bucket window and drops an expired limit for `category`
    fn prune(&self, state: &mut TrackerState, category: QuotaCategory, now: DateTime<Utc>) {
        if let Some(bucket) = state.buckets.get_mut(&category) {
            if bucket.refresh(now, self.settings.window) {
                debug!(%category, limit = bucket.limit(), "Quota window reset");
            }
        }
        if let Some(limit) = state.active.get(&category) {
            if limit.is_expired(now) {
                info!(%category, "Rate limit expired, quota available again");
                state.active.remove(&category);
            }
        }
    }

    // ========================================================================
    // reserve()
    // ========================================================================

    /// Takes one call from the bucket of `category`
    ///
    /// # Errors
    /// Returns `ScanError::QuotaExhausted` without decrementing when a limit
    /// is active for the category, and sets a limit lasting until the end of
    /// the window when the bucket is empty.
    pub fn reserve(&self, category: QuotaCategory) -> Result<(), ScanError> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, category, now);

        if let Some(limit) = state.active.get(&category) {
            return Err(ScanError::QuotaExhausted {
                category,
                resume_at: limit.resume_at(),
            });
        }

        let Some(bucket) = state.buckets.get_mut(&category) else {
            return Ok(());
        };
        if bucket.try_take() {
            return Ok(());
        }

        let resume_at = bucket.window_reset_at();
        warn!(%category, %resume_at, "Local quota exhausted");
        state
            .active
            .insert(category, ActiveRateLimit::new(category, resume_at));
        Err(ScanError::QuotaExhausted {
            category,
            resume_at,
        })
    }

    // ========================================================================
    // observe()
    // ========================================================================

    /// Reconciles a bucket with server-reported figures
    pub fn observe(&self, category: QuotaCategory, headers: &QuotaHeaders) {
        if headers.is_empty() {
            return;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, category, now);
        if let Some(bucket) = state.buckets.get_mut(&category) {
            bucket.apply_headers(headers);
            debug!(
                %category,
                limit = bucket.limit(),
                remaining = bucket.remaining(),
                "Quota reconciled with server"
            );
        }
    }

    /// Records a server-imposed limit, keeping the later deadline if one exists
    pub fn set_active(&self, category: QuotaCategory, resume_at: DateTime<Utc>) -> ActiveRateLimit {
        let mut state = self.lock();
        let incoming = ActiveRateLimit::new(category, resume_at);
        let merged = match state.active.get(&category) {
            Some(existing) => existing.merge(incoming),
            None => incoming,
        };
        state.active.insert(category, merged);
        warn!(%category, resume_at = %merged.resume_at(), "Rate limit active");
        merged
    }

    // ========================================================================
    // Active limit queries
    // ========================================================================

    /// Returns the active limit with the latest deadline, if any
    pub fn active_limit(&self) -> Option<ActiveRateLimit> {
        self.active_limits()
            .into_iter()
            .max_by_key(|limit| limit.resume_at())
    }

    /// Returns the active limit of one category, if any
    pub fn active_limit_for(&self, category: QuotaCategory) -> Option<ActiveRateLimit> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.prune(&mut state, category, now);
        state.active.get(&category).copied()
    }

    /// Returns every unexpired active limit
    pub fn active_limits(&self) -> Vec<ActiveRateLimit> {
        let now = self.clock.now();
        let mut state = self.lock();
        for category in QuotaCategory::ALL {
            self.prune(&mut state, category, now);
        }
        QuotaCategory::ALL
            .iter()
            .filter_map(|c| state.active.get(c).copied())
            .collect()
    }

    // ========================================================================
    // Operator override and restore
    // ========================================================================

    /// Removes the active limit of `category` without waiting
    ///
    /// # Returns
    /// `true` if a limit was removed; clearing when none is set is a no-op.
    pub fn clear_override(&self, category: QuotaCategory) -> bool {
        let removed = self.lock().active.remove(&category).is_some();
        if removed {
            info!(%category, "Rate limit cleared by operator");
        }
        removed
    }

    /// Clears every active limit, returning how many were removed
    pub fn clear_all(&self) -> usize {
        QuotaCategory::ALL
            .iter()
            .filter(|&&c| self.clear_override(c))
            .count()
    }

    /// Re-installs limits persisted by an earlier process
    ///
    /// Limits whose deadline has passed are ignored.
    pub fn restore(&self, limits: impl IntoIterator<Item = ActiveRateLimit>) {
        let now = self.clock.now();
        for limit in limits {
            if limit.is_expired(now) {
                continue;
            }
            self.set_active(limit.category(), limit.resume_at());
        }
    }

    /// Returns a copy of both buckets
    pub fn snapshot(&self) -> Vec<QuotaBucket> {
        let now = self.clock.now();
        let mut state = self.lock();
        QuotaCategory::ALL
            .iter()
            .filter_map(|&c| {
                self.prune(&mut state, c, now);
                state.buckets.get(&c).cloned()
            })
            .collect()
    }
}

// ============================================================================
// Unit tests
// ============================================================================
