//! The model catalog: validated view over the configured runtimes and models,
//! with display-name and public-id resolution for incoming requests.

use crate::config::{ConfigFile, ModelEntry, RuntimeConfig};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the runtime synthesized from the top-level `default_runtime` when
/// the config does not declare one itself.
pub const DEFAULT_RUNTIME_NAME: &str = "default";

/// One fully resolved model, ready to be launched.
#[derive(Debug, Clone)]
pub struct ModelSpec {
	/// Config key, also the display name.
	pub name: String,
	/// Public id exposed on the API surfaces (`model_id`, falling back to the name).
	pub public_id: String,
	/// Tilde-expanded path to the model file.
	pub model_path: String,
	pub runtime_name: String,
	pub runtime: RuntimeConfig,
	/// Extra launch flags, in declaration order.
	pub parameters: Map<String, Value>,
	pub mmproj: Option<String>,
	/// Port pinned by the model or its runtime. `None` means a dynamic port.
	pub fixed_port: Option<u16>,
}

impl ModelSpec {
	pub fn supports_tools(&self) -> bool {
		self.runtime.supports_tools
	}
}

/// Validated, immutable model catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
	specs: Vec<Arc<ModelSpec>>,
	// Keyed by both display name and public id.
	by_key: HashMap<String, usize>,
}

impl Catalog {
	pub fn from_file(file: &ConfigFile) -> Result<Catalog> {
		let mut runtimes: HashMap<String, RuntimeConfig> = file
			.llama_runtimes
			.iter()
			.map(|(name, entry)| (name.clone(), entry.normalize()))
			.collect();

		runtimes.entry(DEFAULT_RUNTIME_NAME.to_string()).or_insert(RuntimeConfig {
			command: file.default_runtime.clone(),
			supports_tools: true,
			port: None,
		});

		let mut specs: Vec<Arc<ModelSpec>> = Vec::with_capacity(file.models.len());
		let mut by_key: HashMap<String, usize> = HashMap::new();

		for (name, raw_entry) in file.models.iter() {
			let entry: ModelEntry = serde_json::from_value(raw_entry.clone())
				.map_err(|err| Error::config(format!("invalid model entry '{name}': {err}")))?;

			let runtime_name = entry
				.llama_cpp_runtime
				.clone()
				.unwrap_or_else(|| DEFAULT_RUNTIME_NAME.to_string());
			let runtime = runtimes
				.get(&runtime_name)
				.cloned()
				.ok_or_else(|| Error::config(format!("model '{name}' references unknown runtime '{runtime_name}'")))?;

			let public_id = entry.model_id.clone().unwrap_or_else(|| name.clone());
			let fixed_port = entry.port.or(runtime.port);

			let spec = Arc::new(ModelSpec {
				name: name.clone(),
				public_id,
				model_path: shellexpand::tilde(&entry.model_path).into_owned(),
				runtime_name,
				runtime,
				parameters: entry.parameters,
				mmproj: entry.mmproj.map(|p| shellexpand::tilde(&p).into_owned()),
				fixed_port,
			});

			let idx = specs.len();
			for key in [spec.name.clone(), spec.public_id.clone()] {
				if let Some(prev) = by_key.insert(key.clone(), idx) {
					// Re-inserting a model's own name as its id is fine.
					if prev != idx {
						return Err(Error::config(format!("duplicate model name or id '{key}'")));
					}
				}
			}
			specs.push(spec);
		}

		Ok(Catalog { specs, by_key })
	}

	/// Resolve a display name or public id to its spec.
	pub fn resolve(&self, name_or_id: &str) -> Option<&Arc<ModelSpec>> {
		self.by_key.get(name_or_id).map(|&idx| &self.specs[idx])
	}

	/// All specs, in config declaration order.
	pub fn specs(&self) -> impl Iterator<Item = &Arc<ModelSpec>> {
		self.specs.iter()
	}

	pub fn len(&self) -> usize {
		self.specs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.specs.is_empty()
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	const SAMPLE: &str = r#"{
		"default_runtime": "llama-server",
		"llama-runtimes": {
			"ik": { "runtime": "/opt/ik/llama-server", "supports_tools": false, "port": 8111 },
			"plain": "llama-server-plain"
		},
		"models": {
			"Qwen3 32B": {
				"model_id": "qwen3-32b",
				"model_path": "~/models/qwen3.gguf",
				"llama_cpp_runtime": "ik",
				"parameters": { "ctx_size": 16384, "flash_attn": true }
			},
			"Tiny": {
				"model_path": "/models/tiny.gguf",
				"port": 9001
			}
		}
	}"#;

	#[test]
	fn test_catalog_resolve_name_and_id() -> Result<()> {
		let config = Config::from_json_str(SAMPLE)?;
		let catalog = &config.catalog;

		let by_name = catalog.resolve("Qwen3 32B").ok_or("should resolve by name")?;
		let by_id = catalog.resolve("qwen3-32b").ok_or("should resolve by id")?;
		assert_eq!(by_name.name, by_id.name);
		assert_eq!(by_name.public_id, "qwen3-32b");
		assert!(catalog.resolve("nope").is_none());

		Ok(())
	}

	#[test]
	fn test_catalog_runtime_normalization() -> Result<()> {
		let config = Config::from_json_str(SAMPLE)?;
		let spec = config.catalog.resolve("qwen3-32b").ok_or("should resolve")?;

		assert_eq!(spec.runtime.command, "/opt/ik/llama-server");
		assert!(!spec.supports_tools());
		// Runtime port applies when the model does not pin one.
		assert_eq!(spec.fixed_port, Some(8111));
		// Tilde gets expanded.
		assert!(!spec.model_path.starts_with('~'));

		Ok(())
	}

	#[test]
	fn test_catalog_default_runtime_synthesized() -> Result<()> {
		let config = Config::from_json_str(SAMPLE)?;
		let spec = config.catalog.resolve("Tiny").ok_or("should resolve")?;

		assert_eq!(spec.runtime_name, DEFAULT_RUNTIME_NAME);
		assert_eq!(spec.runtime.command, "llama-server");
		assert!(spec.supports_tools());
		// Model port wins over the (absent) runtime port.
		assert_eq!(spec.fixed_port, Some(9001));

		Ok(())
	}

	#[test]
	fn test_catalog_unknown_runtime_rejected() {
		let res = Config::from_json_str(
			r#"{ "models": { "m": { "model_path": "/m.gguf", "llama_cpp_runtime": "missing" } } }"#,
		);
		assert!(matches!(res, Err(Error::Config { .. })));
	}

	#[test]
	fn test_catalog_duplicate_id_rejected() {
		let res = Config::from_json_str(
			r#"{ "models": {
				"A": { "model_path": "/a.gguf", "model_id": "same" },
				"B": { "model_path": "/b.gguf", "model_id": "same" }
			} }"#,
		);
		assert!(matches!(res, Err(Error::Config { .. })));
	}

	type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;
}

// endregion: --- Tests
