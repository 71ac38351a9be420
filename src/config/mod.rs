//! Healing Policy Configuration
//!
//! Provides the interception/healing policy loaded from TOML files, replacing
//! hardcoded suppression and retry constants with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `SELFMEND_CONFIG` environment variable (path to TOML file)
//! 2. `selfmend.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! A malformed file logs a warning and falls back to the next source — a bad
//! policy file must never take the resilience layer down with it.
//!
//! ## Usage
//!
//! ```ignore
//! let config = HealConfig::load();
//! let interceptor = FaultInterceptor::initialize(config);
//! ```

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from explicit config-file loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("config parse error ({0}): {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// Interception and healing policy.
///
/// Every field has a default from [`defaults`], so a partial TOML file only
/// needs to name the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Duplicate suppression window (seconds)
    pub suppression_window_secs: u64,
    /// Leading trace lines contributing to the duplicate fingerprint
    pub fingerprint_trace_lines: usize,
    /// Retry attempts after the initial call in `guarded_retryable`
    pub max_retries: u32,
    /// Base delay between retry attempts (milliseconds, scales linearly)
    pub retry_delay_ms: u64,
    /// Broadcast channel capacity for fault publications
    pub channel_capacity: usize,
    /// Retention cap on the fault log; `None` keeps every admitted record
    pub log_cap: Option<usize>,
    /// Forward unhealed faults to the presenter; `None` follows the build
    /// profile (on for debug builds, off for release)
    pub forward_unhealed: Option<bool>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            suppression_window_secs: defaults::SUPPRESSION_WINDOW_SECS,
            fingerprint_trace_lines: defaults::FINGERPRINT_TRACE_LINES,
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            retry_delay_ms: defaults::DEFAULT_RETRY_DELAY_MS,
            channel_capacity: defaults::FAULT_CHANNEL_CAPACITY,
            log_cap: None,
            forward_unhealed: None,
        }
    }
}

impl HealConfig {
    /// Load configuration using the documented source order.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var("SELFMEND_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded healing policy from SELFMEND_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SELFMEND_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SELFMEND_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./selfmend.toml
        let local = PathBuf::from("selfmend.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded healing policy from ./selfmend.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./selfmend.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No selfmend.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        for warning in config.validate() {
            warn!("{}", warning);
        }
        Ok(config)
    }

    /// Sanity-check the policy, returning human-readable warnings.
    ///
    /// Warnings never reject a config — the layer runs with whatever the
    /// operator asked for, loudly.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.suppression_window_secs == 0 {
            warnings.push(
                "suppression_window_secs is 0 — duplicate faults will never be dropped".to_string(),
            );
        }
        if self.fingerprint_trace_lines == 0 {
            warnings.push(
                "fingerprint_trace_lines is 0 — fingerprints collapse to the error kind alone"
                    .to_string(),
            );
        }
        if self.channel_capacity == 0 {
            warnings.push("channel_capacity is 0 — raising to 1".to_string());
        }
        if let Some(0) = self.log_cap {
            warnings.push("log_cap is 0 — no fault records will be retained".to_string());
        }
        warnings
    }

    /// Duplicate suppression window as a [`Duration`].
    pub const fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }

    /// Base retry delay as a [`Duration`].
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether unhealed faults are forwarded to the presenter.
    pub fn forward_unhealed(&self) -> bool {
        self.forward_unhealed.unwrap_or(cfg!(debug_assertions))
    }

    /// Channel capacity, floored at 1 (the broadcast primitive rejects 0).
    pub fn effective_channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
