//! Configuration loaded from `fanout.toml`.
//!
//! [`FanoutConfig`] holds every tunable of the orchestrator. Missing values
//! fall back to defaults, except the straggler policy, which must be chosen
//! explicitly. `FANOUT_STRAGGLER_POLICY` and `FANOUT_TICK_MS` take precedence
//! over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::anomaly::{DetectorConfig, StragglerPolicy};
use crate::cas::HashAlgorithm;
use crate::state_machine::RetryConfig;

/// Top-level configuration loaded from `fanout.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Queue poll period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Multiplier applied to the majority's mean run time.
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,

    /// Share of the cohort that must finish before the deadline is armed.
    #[serde(default = "default_majority_fraction")]
    pub majority_fraction: f64,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// What to do with stragglers. No default on purpose.
    #[serde(default)]
    pub straggler_policy: Option<StragglerPolicy>,

    /// Retries for a failing scheduler command.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Failed queue polls in a row after which the watcher gives up and
    /// fails every run waiting on it.
    #[serde(default = "default_max_failed_polls")]
    pub max_failed_polls: u32,

    /// Root directory of the content-addressable store.
    #[serde(default = "default_cas_root")]
    pub cas_root: PathBuf,

    /// JSON file holding task records. The CLI uses `.fanout/records.json`
    /// when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default)]
    pub slurm: SlurmConfig,
}

/// Names of the Slurm binaries; override to point at wrappers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmConfig {
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_scancel")]
    pub scancel: String,
    #[serde(default = "default_squeue")]
    pub squeue: String,
    #[serde(default = "default_scontrol")]
    pub scontrol: String,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_tolerance_factor() -> f64 {
    3.0
}

fn default_majority_fraction() -> f64 {
    0.8
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_failed_polls() -> u32 {
    crate::watcher::DEFAULT_FAILURE_LIMIT
}

fn default_cas_root() -> PathBuf {
    PathBuf::from(".fanout/cas")
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_scancel() -> String {
    "scancel".to_string()
}

fn default_squeue() -> String {
    "squeue".to_string()
}

fn default_scontrol() -> String {
    "scontrol".to_string()
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: default_sbatch(),
            scancel: default_scancel(),
            squeue: default_squeue(),
            scontrol: default_scontrol(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            tolerance_factor: default_tolerance_factor(),
            majority_fraction: default_majority_fraction(),
            hash_algorithm: HashAlgorithm::default(),
            straggler_policy: None,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_failed_polls: default_max_failed_polls(),
            cas_root: default_cas_root(),
            store_path: None,
            slurm: SlurmConfig::default(),
        }
    }
}

impl FanoutConfig {
    /// Loads `fanout.toml` from the current directory, or `path` when given.
    /// Uses defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("fanout.toml"));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<FanoutConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(policy) = std::env::var("FANOUT_STRAGGLER_POLICY")
            && !policy.is_empty()
        {
            config.straggler_policy = Some(policy.parse()?);
        }
        if let Ok(tick) = std::env::var("FANOUT_TICK_MS")
            && !tick.is_empty()
        {
            config.tick_ms = tick
                .parse()
                .with_context(|| format!("FANOUT_TICK_MS is not a number: {tick}"))?;
        }

        Ok(config)
    }

    /// Rejects values the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            bail!("tick_ms must be greater than zero");
        }
        if !(self.tolerance_factor > 0.0) {
            bail!("tolerance_factor must be positive, got {}", self.tolerance_factor);
        }
        if !(self.majority_fraction > 0.0 && self.majority_fraction <= 1.0) {
            bail!(
                "majority_fraction must be in (0, 1], got {}",
                self.majority_fraction
            );
        }
        if self.max_failed_polls == 0 {
            bail!("max_failed_polls must be at least 1");
        }
        Ok(())
    }

    /// The configured straggler policy, or an error telling the user to set one.
    pub fn require_policy(&self) -> Result<StragglerPolicy> {
        self.straggler_policy.context(
            "straggler_policy is required: set it in fanout.toml, FANOUT_STRAGGLER_POLICY or --policy \
             (accept-partial | fail-run)",
        )
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            tolerance_factor: self.tolerance_factor,
            majority_fraction: self.majority_fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = FanoutConfig::default();
        assert_eq!(config.tick_ms, 1000);
        assert_eq!(config.tolerance_factor, 3.0);
        assert_eq!(config.majority_fraction, 0.8);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_failed_polls, 3);
        assert!(config.straggler_policy.is_none());
        assert_eq!(config.slurm.squeue, "squeue");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            tick_ms = 250
            straggler_policy = "fail-run"
            hash_algorithm = "sha512"

            [slurm]
            sbatch = "/opt/slurm/bin/sbatch"
        "#;
        let config: FanoutConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tick_ms, 250);
        assert_eq!(config.straggler_policy, Some(StragglerPolicy::FailRun));
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(config.slurm.sbatch, "/opt/slurm/bin/sbatch");
        assert_eq!(config.slurm.scancel, "scancel");
        assert_eq!(config.tolerance_factor, 3.0);
    }

    #[test]
    fn policy_is_required() {
        let config = FanoutConfig::default();
        let err = config.require_policy().unwrap_err();
        assert!(err.to_string().contains("straggler_policy is required"));
    }

    #[test]
    fn validate_rejects_bad_fraction() {
        let config = FanoutConfig {
            majority_fraction: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FanoutConfig {
            tolerance_factor: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = FanoutConfig {
            max_failed_polls: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "tolerance_factor = 2.5\nmax_retries = 1\n").unwrap();
        let config = FanoutConfig::load(Some(&path)).unwrap();
        assert_eq!(config.tolerance_factor, 2.5);
        assert_eq!(config.retry().max_retries, 1);
        assert_eq!(config.detector().tolerance_factor, 2.5);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FanoutConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.max_retries, 3);
    }
}
