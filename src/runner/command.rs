//! Launch-command rendering for a model spec.

use crate::config::ModelSpec;
use serde_json::Value;

/// Render the argument vector for launching `spec` on `port`.
///
/// Parameters from the config are passed through in declaration order. Keys
/// map `snake_case` to `--kebab-case` flags. A boolean `true` renders as a
/// bare flag, `false` and `null` are omitted. A `port` parameter is ignored:
/// the supervisor owns port assignment.
pub fn build_launch_args(spec: &ModelSpec, port: u16) -> Vec<String> {
	let mut args: Vec<String> = vec![
		"--model".to_string(),
		spec.model_path.clone(),
		"--alias".to_string(),
		spec.public_id.clone(),
		"--host".to_string(),
		"127.0.0.1".to_string(),
		"--port".to_string(),
		port.to_string(),
	];

	if let Some(mmproj) = &spec.mmproj {
		args.push("--mmproj".to_string());
		args.push(mmproj.clone());
	}

	for (key, value) in spec.parameters.iter() {
		if key == "port" {
			continue;
		}
		let flag = format!("--{}", key.replace('_', "-"));
		match value {
			Value::Bool(true) => args.push(flag),
			Value::Bool(false) | Value::Null => (),
			Value::String(s) => {
				args.push(flag);
				args.push(s.clone());
			}
			other => {
				args.push(flag);
				args.push(other.to_string());
			}
		}
	}

	args
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn spec_for(config_json: &str, name: &str) -> ModelSpec {
		let config = Config::from_json_str(config_json).unwrap();
		config.catalog.resolve(name).unwrap().as_ref().clone()
	}

	#[test]
	fn test_build_launch_args_core_flags() {
		let spec = spec_for(
			r#"{ "models": { "m": { "model_path": "/m.gguf", "model_id": "m-id" } } }"#,
			"m",
		);

		let args = build_launch_args(&spec, 8123);
		assert_eq!(
			args,
			vec!["--model", "/m.gguf", "--alias", "m-id", "--host", "127.0.0.1", "--port", "8123"]
		);
	}

	#[test]
	fn test_build_launch_args_parameters() {
		let spec = spec_for(
			r#"{ "models": { "m": {
				"model_path": "/m.gguf",
				"mmproj": "/m.mmproj",
				"parameters": {
					"ctx_size": 16384,
					"flash_attn": true,
					"no_mmap": false,
					"chat_template": "chatml",
					"port": 9999
				}
			} } }"#,
			"m",
		);

		let args = build_launch_args(&spec, 8123);
		let rendered = args.join(" ");

		assert!(rendered.contains("--mmproj /m.mmproj"));
		assert!(rendered.contains("--ctx-size 16384"));
		assert!(rendered.contains("--flash-attn"));
		assert!(!rendered.contains("no-mmap"));
		assert!(rendered.contains("--chat-template chatml"));
		// The port parameter never overrides the supervisor's assignment.
		assert!(!rendered.contains("9999"));
		assert!(rendered.contains("--port 8123"));
	}
}

// endregion: --- Tests
