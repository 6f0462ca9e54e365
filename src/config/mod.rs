//! Configuration loading for llama-relay.
//!
//! The config file is JSON, by default at `~/.llama-relay/config.json`. It
//! declares the runtimes (llama-server style executables), the model catalog,
//! which proxy listeners are enabled, and the lifecycle timeouts.

// region:    --- Modules

mod catalog;

// -- Flatten
pub use catalog::*;

// endregion: --- Modules

use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "~/.llama-relay/config.json";

/// Fully loaded and validated application configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub catalog: Catalog,
	pub proxies: ProxiesConfig,
	pub timeouts: TimeoutsConfig,
}

impl Config {
	/// Load from `path`, or from the default location when `path` is `None`.
	pub fn load(path: Option<&str>) -> Result<Config> {
		let path = shellexpand::tilde(path.unwrap_or(DEFAULT_CONFIG_PATH)).into_owned();
		let content = std::fs::read_to_string(&path)
			.map_err(|err| Error::config(format!("cannot read '{path}': {err}")))?;
		Self::from_json_str(&content)
	}

	pub fn from_json_str(content: &str) -> Result<Config> {
		let file: ConfigFile =
			serde_json::from_str(content).map_err(|err| Error::config(format!("invalid config JSON: {err}")))?;
		Self::from_file(file)
	}

	pub fn from_file(file: ConfigFile) -> Result<Config> {
		let catalog = Catalog::from_file(&file)?;
		Ok(Config {
			catalog,
			proxies: file.proxies,
			timeouts: file.timeouts,
		})
	}
}

// region:    --- Config File Shape

/// Raw deserialized shape of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
	#[serde(default = "default_runtime_command")]
	pub default_runtime: String,

	#[serde(default, rename = "llama-runtimes")]
	pub llama_runtimes: HashMap<String, RuntimeEntry>,

	#[serde(default)]
	pub models: Map<String, Value>,

	#[serde(default)]
	pub proxies: ProxiesConfig,

	#[serde(default)]
	pub timeouts: TimeoutsConfig,
}

fn default_runtime_command() -> String {
	"llama-server".to_string()
}

/// A runtime may be declared as a bare command string (legacy form) or as a
/// full object carrying capability and port information.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuntimeEntry {
	Command(String),
	Full {
		runtime: String,
		#[serde(default = "default_true")]
		supports_tools: bool,
		#[serde(default)]
		port: Option<u16>,
	},
}

fn default_true() -> bool {
	true
}

impl RuntimeEntry {
	pub fn normalize(&self) -> RuntimeConfig {
		match self {
			RuntimeEntry::Command(command) => RuntimeConfig {
				command: command.clone(),
				supports_tools: true,
				port: None,
			},
			RuntimeEntry::Full {
				runtime,
				supports_tools,
				port,
			} => RuntimeConfig {
				command: runtime.clone(),
				supports_tools: *supports_tools,
				port: *port,
			},
		}
	}
}

/// Normalized runtime description.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	pub command: String,
	pub supports_tools: bool,
	pub port: Option<u16>,
}

/// Per-model entry under `models`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
	#[serde(default)]
	pub model_id: Option<String>,

	pub model_path: String,

	#[serde(default)]
	pub llama_cpp_runtime: Option<String>,

	/// Extra launch flags, passed through in declaration order.
	#[serde(default)]
	pub parameters: Map<String, Value>,

	#[serde(default)]
	pub mmproj: Option<String>,

	#[serde(default)]
	pub port: Option<u16>,
}

// endregion: --- Config File Shape

// region:    --- Proxies & Timeouts

pub const DEFAULT_LMSTUDIO_PORT: u16 = 1234;
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
	pub lmstudio: ProxyListenerConfig,
	pub ollama: ProxyListenerConfig,
}

impl ProxiesConfig {
	pub fn lmstudio_port(&self) -> u16 {
		self.lmstudio.port.unwrap_or(DEFAULT_LMSTUDIO_PORT)
	}

	pub fn ollama_port(&self) -> u16 {
		self.ollama.port.unwrap_or(DEFAULT_OLLAMA_PORT)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyListenerConfig {
	pub enabled: bool,
	pub port: Option<u16>,
}

impl Default for ProxyListenerConfig {
	fn default() -> Self {
		ProxyListenerConfig { enabled: true, port: None }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
	pub startup_secs: u64,
	pub stop_grace_secs: u64,
	pub health_poll_ms: u64,
}

impl Default for TimeoutsConfig {
	fn default() -> Self {
		TimeoutsConfig {
			startup_secs: 240,
			stop_grace_secs: 15,
			health_poll_ms: 500,
		}
	}
}

impl TimeoutsConfig {
	pub fn startup(&self) -> Duration {
		Duration::from_secs(self.startup_secs)
	}

	pub fn stop_grace(&self) -> Duration {
		Duration::from_secs(self.stop_grace_secs)
	}

	pub fn health_poll(&self) -> Duration {
		Duration::from_millis(self.health_poll_ms)
	}
}

// endregion: --- Proxies & Timeouts
