use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::Quorum;
use crate::{Error, Result};

/// When a dispatched task moves from `assigned` to `in_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Wait for the agent to report that it started.
    #[default]
    Acknowledged,
    /// Fire-and-forget: start on dispatch.
    Immediate,
}

/// Agreement function used by consensus collaboration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPolicyKind {
    #[default]
    MajorityVote,
    HighestConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Automatic retries before a failure is terminal.
    pub max_retries: u32,
    pub start_mode: StartMode,
    pub tick_interval_ms: u64,
    /// EMA smoothing factor for agent durations, in `(0, 1]`.
    pub duration_smoothing: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            start_mode: StartMode::Acknowledged,
            tick_interval_ms: 1_000,
            duration_smoothing: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    pub high_water_pct: f64,
    pub low_water_pct: f64,
    /// Utilization samples kept per agent.
    pub window: usize,
    pub auto_rebalance: bool,
    pub interval_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            high_water_pct: 80.0,
            low_water_pct: 20.0,
            window: 3,
            auto_rebalance: false,
            interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollaborationConfig {
    pub default_quorum: Quorum,
    /// Minimum agreement score in `[0, 1]`.
    pub consensus_threshold: f64,
    pub consensus_rounds: u32,
    pub consensus_policy: ConsensusPolicyKind,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            default_quorum: Quorum::Majority,
            consensus_threshold: 0.6,
            consensus_rounds: 3,
            consensus_policy: ConsensusPolicyKind::MajorityVote,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub command_buffer: usize,
    pub drain_timeout_ms: u64,
    /// Where unfinished work is written on shutdown. `None` disables it.
    pub state_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_buffer: 256,
            drain_timeout_ms: 30_000,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub collaboration: CollaborationConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.log"))
    }

    /// Resolved snapshot location, if persistence is enabled.
    pub fn state_path(&self) -> Option<PathBuf> {
        self.runtime.state_path.as_deref().map(expand_tilde)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms.max(1))
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.balancer.interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.drain_timeout_ms)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_retries = config.scheduler.max_retries,
            start_mode = ?config.scheduler.start_mode,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tracing::debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if !(s.duration_smoothing > 0.0 && s.duration_smoothing <= 1.0) {
            return Err(Error::Validation(format!(
                "scheduler.duration_smoothing must be in (0, 1], got {}",
                s.duration_smoothing
            )));
        }

        let b = &self.balancer;
        if !(0.0..=100.0).contains(&b.low_water_pct) || !(0.0..=100.0).contains(&b.high_water_pct)
        {
            return Err(Error::Validation(
                "balancer water marks must be percentages".to_string(),
            ));
        }
        if b.low_water_pct >= b.high_water_pct {
            return Err(Error::Validation(format!(
                "balancer.low_water_pct ({}) must be below high_water_pct ({})",
                b.low_water_pct, b.high_water_pct
            )));
        }
        if b.window == 0 {
            return Err(Error::Validation(
                "balancer.window must be at least 1".to_string(),
            ));
        }

        let c = &self.collaboration;
        if !(0.0..=1.0).contains(&c.consensus_threshold) {
            return Err(Error::Validation(format!(
                "collaboration.consensus_threshold must be in [0, 1], got {}",
                c.consensus_threshold
            )));
        }
        if c.consensus_rounds == 0 {
            return Err(Error::Validation(
                "collaboration.consensus_rounds must be at least 1".to_string(),
            ));
        }
        if let Quorum::AtLeast(0) = c.default_quorum {
            return Err(Error::Validation(
                "collaboration.default_quorum at_least must be positive".to_string(),
            ));
        }

        if self.runtime.command_buffer == 0 || self.events.capacity == 0 {
            return Err(Error::Validation(
                "channel capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
