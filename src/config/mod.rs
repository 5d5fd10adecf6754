//! Configuration system (layered: defaults > config file > env).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

const DEFAULT_MAX_STEPS: usize = 25;
const DEFAULT_HARD_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_STEP_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_SHELL_TIMEOUT_MS: u64 = 30_000;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TURNSTILE_CONFIG";

/// Runtime limits shared by every conversation driver.
///
/// Resolution order (later wins):
/// 1. Built-in defaults
/// 2. TOML file (`$TURNSTILE_CONFIG`, else `<config dir>/turnstile/config.toml`)
/// 3. `TURNSTILE_*` environment variables (a `.env` file is honoured)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnstileConfig {
    /// Steps a single run may take before it is failed.
    pub max_steps_per_run: usize,
    /// How long a hard-stopped step may keep running before the watchdog
    /// force-settles the run.
    pub hard_stop_grace_ms: u64,
    /// Upper bound for one model decision. `0` disables the bound.
    pub step_timeout_ms: u64,
    /// Upper bound for a `shell` tool command.
    pub shell_timeout_ms: u64,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: DEFAULT_MAX_STEPS,
            hard_stop_grace_ms: DEFAULT_HARD_STOP_GRACE_MS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            shell_timeout_ms: DEFAULT_SHELL_TIMEOUT_MS,
        }
    }
}

impl TurnstileConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Load the fully layered configuration for this process.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Resolve the config file location.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(explicit));
        }
        directories::ProjectDirs::from("", "", "turnstile")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Overlay `TURNSTILE_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay `TURNSTILE_*` variables from an arbitrary lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup("TURNSTILE_MAX_STEPS") {
            self.max_steps_per_run = parse_env("TURNSTILE_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("TURNSTILE_HARD_STOP_GRACE_MS") {
            self.hard_stop_grace_ms = parse_env("TURNSTILE_HARD_STOP_GRACE_MS", &raw)?;
        }
        if let Some(raw) = lookup("TURNSTILE_STEP_TIMEOUT_MS") {
            self.step_timeout_ms = parse_env("TURNSTILE_STEP_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("TURNSTILE_SHELL_TIMEOUT_MS") {
            self.shell_timeout_ms = parse_env("TURNSTILE_SHELL_TIMEOUT_MS", &raw)?;
        }
        self.validate()
    }

    pub fn hard_stop_grace(&self) -> Duration {
        Duration::from_millis(self.hard_stop_grace_ms)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_ms > 0).then(|| Duration::from_millis(self.step_timeout_ms))
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_millis(self.shell_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps_per_run == 0 {
            return Err(TurnstileError::Configuration(
                "max_steps_per_run must be at least 1".into(),
            ));
        }
        if self.shell_timeout_ms == 0 {
            return Err(TurnstileError::Configuration(
                "shell_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TurnstileError::Configuration(format!("{key}: invalid value '{raw}'")))
}
