//! Centralized configuration for Undertow.
//!
//! All tunable parameters of the network engine are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::network::TransportMode;

/// Errors raised while validating configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Central configuration for all Undertow components.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub rate_limit: RateLimitConfig,
    pub selector: SelectorConfig,
}

/// Tick scheduler configuration.
///
/// Controls the nominal tick period of registered peer instances and the
/// thresholds used to report scheduler overload.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Nominal interval between two ticks of the same instance
    pub schedule_period: Duration,
    /// Gap between consecutive ticks of one instance that counts as lag
    pub lag_threshold: Duration,
    /// Minimum interval between two lag reports
    pub lag_log_interval: Duration,
    /// Seed for registration jitter (None = seeded from the OS)
    pub jitter_seed: Option<u64>,
    /// Name of the dedicated scheduler thread
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_period: Duration::from_millis(100),
            lag_threshold: Duration::from_millis(1000),
            lag_log_interval: Duration::from_millis(1000),
            jitter_seed: None,
            thread_name: "undertow-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Schedule period in whole milliseconds (never zero after validation).
    pub fn period_millis(&self) -> u64 {
        self.schedule_period.as_millis() as u64
    }
}

/// Per-transport defaults.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Emit trace logs for readiness transitions
    pub trace: bool,
    /// Speed mode new transports start in
    pub default_mode: TransportMode,
}

/// Bandwidth limiting for the speed token dispenser.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Download bandwidth limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Burst capacity as multiple of the sustained rate
    pub burst_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            download_limit: None,
            burst_multiplier: 2.0,
        }
    }
}

/// Readiness selector (poll thread) configuration.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Upper bound on one poll call
    pub poll_timeout: Duration,
    /// Maximum events processed per poll
    pub max_events: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            max_events: 128,
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(period) = std::env::var("UNDERTOW_SCHEDULE_PERIOD_MS") {
            if let Ok(millis) = period.parse::<u64>() {
                config.scheduler.schedule_period = Duration::from_millis(millis);
            }
        }

        if let Ok(threshold) = std::env::var("UNDERTOW_LAG_THRESHOLD_MS") {
            if let Ok(millis) = threshold.parse::<u64>() {
                config.scheduler.lag_threshold = Duration::from_millis(millis);
            }
        }

        if let Ok(seed) = std::env::var("UNDERTOW_JITTER_SEED") {
            if let Ok(seed_value) = seed.parse::<u64>() {
                config.scheduler.jitter_seed = Some(seed_value);
            }
        }

        if let Ok(limit) = std::env::var("UNDERTOW_DOWNLOAD_LIMIT") {
            if let Ok(bytes_per_second) = limit.parse::<u64>() {
                config.rate_limit.download_limit = Some(bytes_per_second);
            }
        }

        if let Ok(trace) = std::env::var("UNDERTOW_TRANSPORT_TRACE") {
            config.transport.trace = trace.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.scheduler.schedule_period = Duration::from_millis(50);
        config.scheduler.jitter_seed = Some(42);
        config
    }

    /// Checks values that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - If the schedule period is below one
    ///   millisecond or the burst multiplier is below one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.period_millis() == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.schedule_period",
                reason: "must be at least 1ms".to_string(),
            });
        }

        if self.rate_limit.burst_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_limit.burst_multiplier",
                reason: format!("{} is below 1.0", self.rate_limit.burst_multiplier),
            });
        }

        Ok(())
    }
}
