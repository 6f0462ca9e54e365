//! Capability filter for runtimes that cannot handle tool calling.
//!
//! Some llama.cpp forks crash or misbehave when a request carries `tools`.
//! When a model's runtime declares `supports_tools: false`, the request-side
//! filter removes the tool fields before forwarding, and the response-side
//! scrub drops any `tool_calls` fragments the backend still hallucinates.
//! Both functions are pure and idempotent.

use serde_json::Value;

/// Remove `tools` and `tool_choice` from a request body.
/// Returns whether anything was removed.
pub fn strip_tool_fields(body: &mut Value) -> bool {
	let Some(obj) = body.as_object_mut() else {
		return false;
	};
	let mut stripped = false;
	for key in ["tools", "tool_choice"] {
		stripped |= obj.remove(key).is_some();
	}
	stripped
}

/// Remove `tool_calls` from response messages and stream deltas.
pub fn scrub_tool_fragments(body: &mut Value) {
	let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) else {
		return;
	};
	for choice in choices {
		for key in ["message", "delta"] {
			if let Some(obj) = choice.get_mut(key).and_then(Value::as_object_mut) {
				obj.remove("tool_calls");
			}
		}
	}
}

// region:    --- Tests


// endregion: --- Tests
