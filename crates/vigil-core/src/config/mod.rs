//! Agent configuration.
//!
//! One immutable [`AgentConfig`] value is loaded at startup and handed to
//! each component at construction; registration of tunables is frozen
//! before the first worker starts. Durations are humantime-encoded in the
//! YAML (`"30s"`, `"5m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::policy::PolicyDescriptor;

/// Errors loading the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("could not read config file {path}: {source}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file did not parse.
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Stable host identifier reported in scope checks.
    pub machine_id: String,

    /// Customer identifier forwarded to the compliance module.
    pub customer_id: String,

    /// Run root holding shared-memory segments and capture files.
    pub run_root: PathBuf,

    /// Capture ring configuration.
    pub memdump: MemdumpConfig,

    /// Policy engine configuration.
    pub security: SecurityConfig,

    /// Compliance client configuration.
    pub compliance: ComplianceConfig,

    /// Egress serializer configuration.
    pub egress: EgressConfig,
}

impl AgentConfig {
    /// Parses a configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed YAML.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it does not parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }
}

/// Capture ring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemdumpConfig {
    /// Master switch for the capture ring.
    pub enabled: bool,

    /// Total ring budget in bytes; one third per segment, leaving room
    /// for the temporary third segment a concurrent reader can force.
    pub bufsize: u64,

    /// Disk budget for a single capture job's output file.
    pub max_disk_size: u64,

    /// Retries for the startup allocation probe.
    pub max_init_attempts: u64,

    /// Whether rotation-churn autodisable is armed.
    pub autodisable: bool,

    /// Sealed-header percentage of segment size that counts as a
    /// threshold hit.
    pub headers_pct_threshold: u64,

    /// Rotations closer together than this count as a threshold hit.
    #[serde(with = "humantime_serde")]
    pub min_time_between_rotations: Duration,

    /// How long after autodisable the ring re-enables itself.
    #[serde(with = "humantime_serde")]
    pub re_enable_interval: Duration,

    /// Chunk size used when draining a capture file to the sink.
    pub capture_chunk_size: usize,
}

impl Default for MemdumpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bufsize: 96 * 1024 * 1024,
            max_disk_size: 512 * 1024 * 1024,
            max_init_attempts: 10,
            autodisable: true,
            headers_pct_threshold: 10,
            min_time_between_rotations: Duration::from_millis(500),
            re_enable_interval: Duration::from_secs(10 * 60),
            capture_chunk_size: 256 * 1024,
        }
    }
}

impl MemdumpConfig {
    /// Per-segment capacity derived from the total budget.
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        self.bufsize / 3
    }
}

/// Policy engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch for policy evaluation.
    pub enabled: bool,

    /// Policy descriptors, in evaluation order.
    pub policies: Vec<PolicyDescriptor>,

    /// Interval between policy-event batch flushes and per-policy
    /// counter reports.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,

    /// Throttle refill rate in accepted events per second, per policy.
    pub throttle_rate: f64,

    /// Throttle bucket capacity, per policy.
    pub throttle_max_burst: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policies: Vec::new(),
            report_interval: Duration::from_secs(1),
            throttle_rate: 0.5,
            throttle_max_burst: 10,
        }
    }
}

/// Compliance client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Master switch for the compliance client.
    pub enabled: bool,

    /// How long after a stream failure the client retries.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Budget for the unary stop RPC during stream teardown.
    #[serde(with = "humantime_serde")]
    pub stop_budget: Duration,

    /// Forward task results to the collector.
    pub send_results: bool,

    /// Forward task events to the collector.
    pub send_events: bool,

    /// Keep a per-task ledger of initialization errors.
    pub save_errors: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_interval: Duration::from_secs(120),
            stop_budget: Duration::from_secs(10),
            send_results: true,
            send_events: false,
            save_errors: false,
        }
    }
}

/// Egress serializer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Negotiated payload compression.
    pub compression: CompressionConfig,

    /// Transport queue capacity, frames across all priorities.
    pub queue_capacity: usize,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::Gzip,
            queue_capacity: 256,
        }
    }
}

/// Negotiated compression for egress payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionConfig {
    /// Payloads are gzip-compressed.
    Gzip,
    /// Payloads are sent uncompressed.
    None,
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AgentConfig::default();
        assert!(config.memdump.enabled);
        assert_eq!(config.memdump.segment_size(), config.memdump.bufsize / 3);
        assert!(config.security.policies.is_empty());
        assert_eq!(config.compliance.stop_budget, Duration::from_secs(10));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
machine_id: "host-1"
run_root: "/var/run/vigil"
memdump:
  bufsize: 3145728
  min_time_between_rotations: "100ms"
  re_enable_interval: "5m"
security:
  throttle_max_burst: 5
egress:
  compression: none
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.machine_id, "host-1");
        assert_eq!(config.memdump.bufsize, 3_145_728);
        assert_eq!(
            config.memdump.min_time_between_rotations,
            Duration::from_millis(100)
        );
        assert_eq!(config.memdump.re_enable_interval, Duration::from_secs(300));
        assert_eq!(config.security.throttle_max_burst, 5);
        assert_eq!(config.egress.compression, CompressionConfig::None);
        // Unset sections keep their defaults.
        assert!(config.compliance.send_results);
    }
}
