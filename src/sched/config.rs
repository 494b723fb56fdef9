/*!
 * Scheduler Configuration
 *
 * Tunables for quantum length, decay, fail-safe limits and wait queue
 * resources. Loaded from JSON and `SCHED_*` environment overrides; the live
 * copy is swapped atomically so running threads pick up changes at their next
 * quantum.
 */

use crate::core::errors::ConfigError;
use crate::core::types::{micros, AbsTime};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How `pri_shift` is chosen for foreground and background threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayPolicy {
    /// Background threads decay against background load, others against foreground load
    #[default]
    Normal,
    /// Every thread decays against the combined load
    CombinedFgbg,
}

/// Scheduler tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    pub std_quantum_us: u64,
    pub max_unsafe_computation_us: u64,
    pub safe_duration_us: u64,
    pub sched_tick_interval_us: u64,
    pub fixed_shift: u32,
    pub decay_policy: DecayPolicy,
    pub decay_usage_age_factor: u32,
    pub precise_accounting: bool,
    pub interlock_timeout_ms: u64,
    pub link_zone_limit: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            std_quantum_us: 10_000,
            max_unsafe_computation_us: 1_000_000,
            safe_duration_us: 2_000_000,
            sched_tick_interval_us: 125_000,
            fixed_shift: 24,
            decay_policy: DecayPolicy::Normal,
            decay_usage_age_factor: 1,
            precise_accounting: false,
            interlock_timeout_ms: 2_000,
            link_zone_limit: 65_536,
        }
    }
}

impl SchedConfig {
    /// Short quanta and a tight fail-safe window for interactive workloads
    pub fn low_latency() -> Self {
        Self {
            std_quantum_us: 2_500,
            max_unsafe_computation_us: 250_000,
            safe_duration_us: 500_000,
            sched_tick_interval_us: 31_250,
            precise_accounting: true,
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file named by `SCHED_CONFIG`, then `SCHED_*` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SCHED_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };

        override_from_env(&mut config.std_quantum_us, "SCHED_STD_QUANTUM_US")?;
        override_from_env(
            &mut config.max_unsafe_computation_us,
            "SCHED_MAX_UNSAFE_COMPUTATION_US",
        )?;
        override_from_env(&mut config.safe_duration_us, "SCHED_SAFE_DURATION_US")?;
        override_from_env(&mut config.sched_tick_interval_us, "SCHED_TICK_INTERVAL_US")?;
        override_from_env(&mut config.fixed_shift, "SCHED_FIXED_SHIFT")?;
        override_from_env(
            &mut config.decay_usage_age_factor,
            "SCHED_DECAY_USAGE_AGE_FACTOR",
        )?;
        override_from_env(&mut config.precise_accounting, "SCHED_PRECISE_ACCOUNTING")?;
        override_from_env(&mut config.interlock_timeout_ms, "SCHED_INTERLOCK_TIMEOUT_MS")?;
        override_from_env(&mut config.link_zone_limit, "SCHED_LINK_ZONE_LIMIT")?;

        if let Ok(policy) = std::env::var("SCHED_DECAY_POLICY") {
            config.decay_policy = match policy.as_str() {
                "normal" => DecayPolicy::Normal,
                "combined_fgbg" => DecayPolicy::CombinedFgbg,
                _ => {
                    return Err(ConfigError::Override {
                        key: "SCHED_DECAY_POLICY",
                        value: policy,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.std_quantum_us == 0 {
            return Err(ConfigError::Invalid("std_quantum_us must be non-zero".into()));
        }
        if self.sched_tick_interval_us == 0 {
            return Err(ConfigError::Invalid(
                "sched_tick_interval_us must be non-zero".into(),
            ));
        }
        if self.fixed_shift >= 64 {
            return Err(ConfigError::Invalid(format!(
                "fixed_shift {} exceeds the usage width",
                self.fixed_shift
            )));
        }
        if self.decay_usage_age_factor == 0 {
            return Err(ConfigError::Invalid(
                "decay_usage_age_factor must be at least 1".into(),
            ));
        }
        if self.interlock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "interlock_timeout_ms must be non-zero".into(),
            ));
        }
        if self.link_zone_limit == 0 {
            return Err(ConfigError::Invalid("link_zone_limit must be non-zero".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn std_quantum(&self) -> AbsTime {
        micros(self.std_quantum_us)
    }

    #[inline]
    pub fn max_unsafe_computation(&self) -> AbsTime {
        micros(self.max_unsafe_computation_us)
    }

    #[inline]
    pub fn safe_duration(&self) -> AbsTime {
        micros(self.safe_duration_us)
    }

    #[inline]
    pub fn tick_interval(&self) -> AbsTime {
        micros(self.sched_tick_interval_us)
    }

    pub fn interlock_timeout(&self) -> Duration {
        Duration::from_millis(self.interlock_timeout_ms)
    }
}

fn override_from_env<T>(slot: &mut T, key: &'static str) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(value) => {
            *slot = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Override { key, value })?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}
