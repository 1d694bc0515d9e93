//! Kernel configuration.
//!
//! Settings live in the `[kernel]` table of a TOML file (by default
//! `config/default.toml`).  Every field has a default, so a missing file or
//! a partial table is never an error.
//!
//! ```toml
//! [kernel.scheduler]
//! initial_ratio = 0.5
//! rng_seed = 42
//! strict_transitions = false
//! ratio_interval = 50
//!
//! [kernel.modules]
//! enforce_dependencies = true
//!
//! [kernel.ipc]
//! capacity = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Default location of the configuration file, relative to the working
/// directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable that overrides [`SchedulerConfig::rng_seed`].
pub const RNG_SEED_ENV: &str = "CHIMERA_RNG_SEED";

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    pub modules: ModuleConfig,
    pub ipc: IpcConfig,
}

/// Tuning knobs for the hybrid task scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Guest ratio at construction time (clamped into the fairness band).
    pub initial_ratio: f64,
    /// Seed for the domain coin-flip.  `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
    /// Reject transitions outside the task state machine.
    pub strict_transitions: bool,
    /// Quantum applied to tasks registered without one.
    pub default_quantum_ms: Option<u64>,
    /// Host-loop ticks between automatic ratio adjustments.
    pub ratio_interval: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_ratio: 0.5,
            rng_seed: None,
            strict_transitions: false,
            default_quantum_ms: None,
            ratio_interval: 50,
        }
    }
}

/// Module manager settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Require dependencies to be registered before their dependants and
    /// `Active` before a dependant may load.
    pub enforce_dependencies: bool,
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Broadcast channel capacity.
    pub capacity: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    kernel: KernelConfig,
}

impl KernelConfig {
    /// Parse the `[kernel]` table out of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| KernelError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })?;
        Ok(file.kernel)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.  Environment overrides are applied afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| KernelError::Config {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            let config = Self::from_toml_str(&content)?;
            tracing::info!(path = %path.display(), "kernel configuration loaded");
            config
        } else {
            tracing::warn!(path = %path.display(), "configuration file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CHIMERA_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(RNG_SEED_ENV) {
            let seed = raw.trim().parse::<u64>().map_err(|_| KernelError::Config {
                reason: format!("{RNG_SEED_ENV} must be an unsigned integer, got `{raw}`"),
            })?;
            tracing::debug!(seed, "rng seed overridden from environment");
            self.scheduler.rng_seed = Some(seed);
        }
        Ok(())
    }
}
