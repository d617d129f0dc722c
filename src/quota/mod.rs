//! API quota governor.
//!
//! Tracks consumption of the upstream market-data budget across two
//! independent rolling windows (per-minute and per-day) and decides whether
//! more calls are currently allowed. The governor keeps a safety buffer
//! below the provider's hard caps.
//!
//! One instance is constructed at startup and shared via `Arc` with every
//! call site. All state lives behind a single mutex: window rollover, the
//! capacity check and the increment happen in one critical section, so two
//! concurrent callers can never jointly exceed the buffered cap.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{QuotaWindow, ThubError, ThubResult};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const DAILY_WINDOW: Duration = Duration::from_secs(86_400);

/// Pacing tiers keyed on remaining minute quota.
const PACE_FREE_ABOVE: u32 = 100;
const PACE_SLOW_BELOW: u32 = 50;
const PACE_CRAWL_BELOW: u32 = 10;

/// Quota limits for the upstream data source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Provider's hard per-minute cap.
    pub minute_limit: u32,
    /// Provider's hard per-day cap.
    pub daily_limit: u32,
    /// Fraction of each hard cap the governor actually allows.
    pub safety_buffer: f64,
    /// Usage fraction (of the hard cap) that triggers the early warning.
    pub warning_ratio: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            minute_limit: 600,
            daily_limit: 100_000,
            safety_buffer: 0.95,
            warning_ratio: 0.80,
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry types
// ---------------------------------------------------------------------------

/// Usage snapshot for one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub used: u32,
    /// Calls still permitted under the buffered cap.
    pub remaining: u32,
    /// Provider's hard cap.
    pub limit: u32,
    /// `used / limit * 100`.
    pub percentage: f64,
    /// Milliseconds until this window resets.
    #[serde(rename = "resetIn")]
    pub reset_in_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub minute: WindowStats,
    pub daily: WindowStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Normal,
    Warning,
    Critical,
}

/// Telemetry contract exposed to health checks and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsage {
    pub minute: WindowStats,
    pub daily: WindowStats,
    pub approaching_limit: bool,
    pub warning_level: WarningLevel,
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Window {
    used: u32,
    started: Instant,
    duration: Duration,
    limit: u32,
    cap: u32,
}

impl Window {
    fn new(limit: u32, buffer: f64, duration: Duration, now: Instant) -> Self {
        Self {
            used: 0,
            started: now,
            duration,
            limit,
            cap: (limit as f64 * buffer).floor() as u32,
        }
    }

    /// Reset if the window has fully elapsed since its start.
    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= self.duration {
            self.used = 0;
            self.started = now;
        }
    }

    fn fits(&self, n: u32) -> bool {
        self.used.saturating_add(n) <= self.cap
    }

    fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.used)
    }

    fn reset_in(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.started))
    }

    fn percentage(&self) -> f64 {
        if self.limit == 0 {
            return 100.0;
        }
        self.used as f64 / self.limit as f64 * 100.0
    }

    fn stats(&self, now: Instant) -> WindowStats {
        WindowStats {
            used: self.used,
            remaining: self.remaining(),
            limit: self.limit,
            percentage: self.percentage(),
            reset_in_ms: self.reset_in(now).as_millis() as u64,
        }
    }
}

#[derive(Debug)]
struct QuotaState {
    minute: Window,
    daily: Window,
}

impl QuotaState {
    fn roll(&mut self, now: Instant) {
        self.minute.roll(now);
        self.daily.roll(now);
    }

    fn fits(&self, n: u32) -> bool {
        self.minute.fits(n) && self.daily.fits(n)
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Single authority on whether more upstream calls are permitted.
#[derive(Debug)]
pub struct QuotaGovernor {
    config: QuotaConfig,
    state: Mutex<QuotaState>,
}

impl QuotaGovernor {
    pub fn new(config: QuotaConfig) -> Self {
        let now = Instant::now();
        let buffer = config.safety_buffer.clamp(0.0, 1.0);
        let state = QuotaState {
            minute: Window::new(config.minute_limit, buffer, MINUTE_WINDOW, now),
            daily: Window::new(config.daily_limit, buffer, DAILY_WINDOW, now),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Whether `n` more calls fit in both windows right now.
    pub fn check_limit(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        state.roll(Instant::now());
        state.fits(n)
    }

    /// Atomically check and record `n` calls.
    ///
    /// On denial nothing is recorded and the error carries the time until
    /// the nearer window resets.
    pub fn consume(&self, n: u32) -> ThubResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.roll(now);

        if !state.fits(n) {
            let minute_reset = state.minute.reset_in(now);
            let daily_reset = state.daily.reset_in(now);
            let window = if !state.daily.fits(n) && state.minute.fits(n) {
                QuotaWindow::Daily
            } else {
                QuotaWindow::Minute
            };
            let retry_after = minute_reset.min(daily_reset);
            warn!(
                requested = n,
                minute_used = state.minute.used,
                daily_used = state.daily.used,
                window = %window,
                retry_after_ms = retry_after.as_millis() as u64,
                "Quota denied"
            );
            return Err(ThubError::QuotaExceeded {
                retry_after_ms: retry_after.as_millis() as u64,
                window,
            });
        }

        state.minute.used += n;
        state.daily.used += n;

        debug!(
            consumed = n,
            minute_remaining = state.minute.remaining(),
            daily_remaining = state.daily.remaining(),
            "Quota consumed"
        );
        Ok(())
    }

    /// Per-window usage after rolling any expired windows.
    pub fn stats(&self) -> QuotaStats {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.roll(now);
        QuotaStats {
            minute: state.minute.stats(now),
            daily: state.daily.stats(now),
        }
    }

    /// Tiered pacing hint for batch work, based on remaining minute quota.
    pub fn optimal_delay(&self) -> Duration {
        let remaining = self.stats().minute.remaining;
        let ms = if remaining > PACE_FREE_ABOVE {
            0
        } else if remaining < PACE_CRAWL_BELOW {
            5_000
        } else if remaining < PACE_SLOW_BELOW {
            1_000
        } else {
            100
        };
        Duration::from_millis(ms)
    }

    /// Either window above the warning ratio of its hard cap.
    pub fn is_approaching_limit(&self) -> bool {
        let stats = self.stats();
        let threshold = self.config.warning_ratio * 100.0;
        stats.minute.percentage > threshold || stats.daily.percentage > threshold
    }

    /// Stats plus early-warning flags, for callers and telemetry.
    pub fn usage(&self) -> ApiUsage {
        let stats = self.stats();
        let threshold = self.config.warning_ratio * 100.0;
        let critical = self.config.safety_buffer * 100.0;
        let peak = stats.minute.percentage.max(stats.daily.percentage);

        let approaching_limit = peak > threshold;
        let warning_level = if peak >= critical {
            WarningLevel::Critical
        } else if approaching_limit {
            WarningLevel::Warning
        } else {
            WarningLevel::Normal
        };

        ApiUsage {
            minute: stats.minute,
            daily: stats.daily,
            approaching_limit,
            warning_level,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
