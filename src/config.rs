//! Configuration loading using Figment.
//!
//! Strongly-typed settings loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DRIVETEST_`
//!
//! # Example
//! ```no_run
//! use drivetest_engine::config::Settings;
//!
//! let settings = Settings::load_from("config/drivetest.toml")?;
//! println!("fleet prefix: {}", settings.fleet.device_prefix);
//! # Ok::<(), drivetest_engine::error::EngineError>(())
//! ```

use crate::error::{EngineError, EngineResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub fleet: FleetSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    /// Exactly two operators; the fleet is partitioned between them.
    pub operators: Vec<OperatorSettings>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Serial fleet layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Serial device prefix; port N lives at `{device_prefix}{N}`.
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Modem slots per operator group.
    #[serde(default = "default_slots_per_group")]
    pub slots_per_group: usize,
}

/// Poll cadences and inter-command delays, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Port-session poll cycle re-issuing commands for unsatisfied flags.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delay between commands within one poll cycle.
    #[serde(default = "default_command_delay")]
    pub command_delay_ms: u64,
    /// Optional cap on discovery/arbitration barriers. Zero means wait
    /// forever, matching the "the physical device will eventually answer"
    /// operating assumption.
    #[serde(default)]
    pub barrier_timeout_ms: u64,
    #[serde(default = "default_gsm_query_interval")]
    pub gsm_query_interval_ms: u64,
    #[serde(default = "default_wcdma_query_interval")]
    pub wcdma_query_interval_ms: u64,
    #[serde(default = "default_lte_query_interval")]
    pub lte_query_interval_ms: u64,
    /// Independent long-call status poll.
    #[serde(default = "default_call_status_interval")]
    pub call_status_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            command_delay_ms: default_command_delay(),
            barrier_timeout_ms: 0,
            gsm_query_interval_ms: default_gsm_query_interval(),
            wcdma_query_interval_ms: default_wcdma_query_interval(),
            lte_query_interval_ms: default_lte_query_interval(),
            call_status_interval_ms: default_call_status_interval(),
        }
    }
}

impl TimingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    /// `None` when the configured cap is zero (wait forever).
    pub fn barrier_timeout(&self) -> Option<Duration> {
        (self.barrier_timeout_ms > 0).then(|| Duration::from_millis(self.barrier_timeout_ms))
    }

    pub fn call_status_interval(&self) -> Duration {
        Duration::from_millis(self.call_status_interval_ms)
    }
}

/// One mobile network operator the fleet tests against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSettings {
    pub name: String,
    /// IMSI prefix identifying this operator's SIMs, e.g. "43211".
    pub imsi_prefix: String,
    /// Numeric PLMN reported by `+COPS` when registered at home.
    pub home_plmn: String,
    /// Number dialed by the long-call loops.
    pub dial_number: String,
}

// Default value functions
fn default_device_prefix() -> String {
    "/dev/ttyUSB".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_slots_per_group() -> usize {
    6
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_command_delay() -> u64 {
    300
}

fn default_gsm_query_interval() -> u64 {
    700
}

fn default_wcdma_query_interval() -> u64 {
    900
}

fn default_lte_query_interval() -> u64 {
    1200
}

fn default_call_status_interval() -> u64 {
    1500
}

impl Settings {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables override the file with prefix `DRIVETEST_`,
    /// e.g. `DRIVETEST_APPLICATION_NAME=bench-rig`.
    pub fn load() -> EngineResult<Self> {
        Self::load_from("config/drivetest.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DRIVETEST_").split("_"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> EngineResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(EngineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.operators.len() != 2 {
            return Err(EngineError::Configuration(format!(
                "Exactly two operators are required, got {}",
                self.operators.len()
            )));
        }

        let mut names = std::collections::HashSet::new();
        for operator in &self.operators {
            if !names.insert(&operator.name) {
                return Err(EngineError::Configuration(format!(
                    "Duplicate operator name: {}",
                    operator.name
                )));
            }
            if operator.imsi_prefix.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "Operator {} has an empty IMSI prefix",
                    operator.name
                )));
            }
        }

        if self.fleet.slots_per_group == 0 {
            return Err(EngineError::Configuration(
                "slots_per_group must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Total number of modem slots across both operator groups.
    pub fn total_slots(&self) -> usize {
        self.fleet.slots_per_group * self.operators.len()
    }

    /// Resolve the operator owning a SIM by IMSI prefix.
    pub fn operator_for_imsi(&self, imsi: &str) -> Option<&OperatorSettings> {
        self.operators
            .iter()
            .find(|operator| imsi.starts_with(&operator.imsi_prefix))
    }
}
