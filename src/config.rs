//! # Roof Controller Configuration
//!
//! Settings for the serial link, the roof's device-side targets and timing,
//! the operator action slots, and the simulated controller.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! simulation = false
//!
//! [serial]
//! port = "/dev/ttyACM0"
//! baud = 38400
//!
//! [roof]
//! timeout_secs = 40
//! lock_enabled = true
//!
//! [roof.switches]
//! opened = "OPENED"
//! closed = "CLOSED"
//!
//! [[actions]]
//! label = "Dew heater"
//! ```
//!
//! - Every field is optional and falls back to the controller firmware's defaults.
//! - Target names must be non-empty, at most 15 characters, and free of `(`, `)` and `:`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{CommandTargets, SwitchTargets};
use crate::motion::MotionTiming;
use crate::protocol::handshake::MAX_ACTIONS;
use crate::protocol::Target;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub simulation: bool,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub roof: RoofConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_byte_timeout_secs")]
    pub byte_timeout_secs: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            byte_timeout_secs: default_byte_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoofConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_press_delay_ms")]
    pub press_delay_ms: u64,
    #[serde(default)]
    pub lock_enabled: bool,
    #[serde(default)]
    pub aux_enabled: bool,
    #[serde(default = "default_moving_poll_ms")]
    pub moving_poll_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default)]
    pub switches: SwitchConfig,
    #[serde(default)]
    pub commands: CommandConfig,
}

impl Default for RoofConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            press_delay_ms: default_press_delay_ms(),
            lock_enabled: false,
            aux_enabled: false,
            moving_poll_ms: default_moving_poll_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            switches: SwitchConfig::default(),
            commands: CommandConfig::default(),
        }
    }
}

/// `GET` targets of the four status switches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwitchConfig {
    #[serde(default = "default_opened")]
    pub opened: String,
    #[serde(default = "default_closed")]
    pub closed: String,
    #[serde(default = "default_locked")]
    pub locked: String,
    #[serde(default = "default_aux_state")]
    pub aux: String,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            opened: default_opened(),
            closed: default_closed(),
            locked: default_locked(),
            aux: default_aux_state(),
        }
    }
}

/// `SET` targets of the roof buttons.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    #[serde(default = "default_open")]
    pub open: String,
    #[serde(default = "default_close")]
    pub close: String,
    #[serde(default = "default_abort")]
    pub abort: String,
    #[serde(default = "default_lock")]
    pub lock: String,
    #[serde(default = "default_aux_set")]
    pub aux: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            open: default_open(),
            close: default_close(),
            abort: default_abort(),
            lock: default_lock(),
            aux: default_aux_set(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_travel_secs")]
    pub travel_secs: u64,
    #[serde(default)]
    pub action_count: usize,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            travel_secs: default_travel_secs(),
            action_count: 0,
            version: default_version(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.roof.timeout_secs;
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
            return Err(ConfigError::Invalid(format!(
                "roof.timeout_secs must be between {} and {}, got {}",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS, timeout
            )));
        }
        if self.actions.len() > MAX_ACTIONS {
            return Err(ConfigError::Invalid(format!(
                "At most {} actions can be configured, got {}",
                MAX_ACTIONS,
                self.actions.len()
            )));
        }
        if self.simulator.action_count > MAX_ACTIONS {
            return Err(ConfigError::Invalid(format!(
                "simulator.action_count must be at most {}",
                MAX_ACTIONS
            )));
        }
        self.switch_targets()?;
        self.command_targets()?;
        Ok(())
    }

    pub fn switch_targets(&self) -> Result<SwitchTargets, ConfigError> {
        let s = &self.roof.switches;
        Ok(SwitchTargets {
            opened: target("roof.switches.opened", &s.opened)?,
            closed: target("roof.switches.closed", &s.closed)?,
            locked: target("roof.switches.locked", &s.locked)?,
            aux: target("roof.switches.aux", &s.aux)?,
        })
    }

    pub fn command_targets(&self) -> Result<CommandTargets, ConfigError> {
        let c = &self.roof.commands;
        Ok(CommandTargets {
            open: target("roof.commands.open", &c.open)?,
            close: target("roof.commands.close", &c.close)?,
            abort: target("roof.commands.abort", &c.abort)?,
            lock: target("roof.commands.lock", &c.lock)?,
            aux: target("roof.commands.aux", &c.aux)?,
        })
    }

    pub fn motion_timing(&self) -> MotionTiming {
        MotionTiming {
            timeout: Duration::from_secs(self.roof.timeout_secs),
            moving_poll: Duration::from_millis(self.roof.moving_poll_ms),
            idle_poll: Duration::from_millis(self.roof.idle_poll_ms),
        }
    }

    pub fn press_delay(&self) -> Duration {
        Duration::from_millis(self.roof.press_delay_ms)
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_secs(self.serial.byte_timeout_secs)
    }

    pub fn action_labels(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.label.as_str()).collect()
    }

    pub fn action_enabled(&self) -> Vec<bool> {
        self.actions.iter().map(|a| a.enabled).collect()
    }
}

fn target(key: &str, name: &str) -> Result<Target, ConfigError> {
    Target::new(name).map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))
}

fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud() -> u32 { 38400 }
fn default_byte_timeout_secs() -> u64 { 3 }
fn default_timeout_secs() -> u64 { 40 }
fn default_press_delay_ms() -> u64 { 1000 }
fn default_moving_poll_ms() -> u64 { 1000 }
fn default_idle_poll_ms() -> u64 { 4000 }
fn default_opened() -> String { "OPENED".to_string() }
fn default_closed() -> String { "CLOSED".to_string() }
fn default_locked() -> String { "LOCKED".to_string() }
fn default_aux_state() -> String { "AUXSTATE".to_string() }
fn default_open() -> String { "OPEN".to_string() }
fn default_close() -> String { "CLOSE".to_string() }
fn default_abort() -> String { "ABORT".to_string() }
fn default_lock() -> String { "LOCK".to_string() }
fn default_aux_set() -> String { "AUXSET".to_string() }
fn default_travel_secs() -> u64 { 35 }
fn default_version() -> String { "V1.3-0".to_string() }

/// Reads, parses and validates a configuration file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to parse config TOML: {}", e);
            return Err(ConfigError::Toml(e));
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e);
    }
    Ok(config)
}
