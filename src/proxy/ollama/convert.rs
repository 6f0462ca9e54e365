//! Translations between the Ollama wire format and the OpenAI dialect the
//! runners speak.

use crate::config::{Catalog, ModelSpec};
use crate::Result;
use serde_json::{json, Value};
use value_ext::JsonValueExt;

/// `options` keys copied through under the same name.
const PASSTHROUGH_OPTIONS: &[&str] = &["temperature", "top_p", "top_k", "min_p", "seed", "stop"];

pub fn now_rfc3339() -> String {
	chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

// region:    --- Requests

/// `/api/chat` body to an OpenAI `/v1/chat/completions` body.
pub fn chat_to_openai(body: &Value, public_id: &str, stream: bool) -> Result<Value> {
	let mut openai = json!({
		"model": public_id,
		"messages": body.get("messages").cloned().unwrap_or_else(|| json!([])),
		"stream": stream,
	});

	if let Some(tools) = body.get("tools") {
		openai.x_insert("tools", tools.clone())?;
	}
	if body.get("format").and_then(Value::as_str) == Some("json") {
		openai.x_insert("response_format", json!({"type": "json_object"}))?;
	}
	apply_options(&mut openai, body.get("options"))?;

	Ok(openai)
}

/// `/api/generate` body to an OpenAI `/v1/completions` body.
/// An Ollama `system` field is folded into the prompt.
pub fn generate_to_openai(body: &Value, public_id: &str, stream: bool) -> Result<Value> {
	let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or("");
	let prompt = match body.get("system").and_then(Value::as_str) {
		Some(system) if !system.is_empty() => format!("{system}\n\n{prompt}"),
		_ => prompt.to_string(),
	};

	let mut openai = json!({
		"model": public_id,
		"prompt": prompt,
		"stream": stream,
	});
	apply_options(&mut openai, body.get("options"))?;

	Ok(openai)
}

/// `/api/embeddings` body to an OpenAI `/v1/embeddings` body.
pub fn embeddings_to_openai(body: &Value, public_id: &str) -> Value {
	json!({
		"model": public_id,
		"input": body.get("prompt").cloned().unwrap_or_else(|| json!("")),
	})
}

fn apply_options(openai: &mut Value, options: Option<&Value>) -> Result<()> {
	let Some(options) = options.and_then(Value::as_object) else {
		return Ok(());
	};

	if let Some(num_predict) = options.get("num_predict") {
		openai.x_insert("max_tokens", num_predict.clone())?;
	}
	for key in PASSTHROUGH_OPTIONS.iter().copied() {
		if let Some(value) = options.get(key) {
			openai.x_insert(key, value.clone())?;
		}
	}

	Ok(())
}

// endregion: --- Requests

// region:    --- Responses

pub fn done_reason(finish_reason: Option<&str>) -> &'static str {
	match finish_reason {
		Some("length") => "length",
		Some("tool_calls") => "tool_calls",
		_ => "stop",
	}
}

/// Non-streaming `/api/chat` response from an OpenAI chat completion.
pub fn chat_from_openai(resp: &Value, model: &str, total_duration_ns: u64) -> Value {
	let message = &resp["choices"][0]["message"];
	let content = message["content"].as_str().unwrap_or("");
	let finish = resp["choices"][0]["finish_reason"].as_str();

	let mut out = json!({
		"model": model,
		"created_at": now_rfc3339(),
		"message": {"role": "assistant", "content": content},
		"done": true,
		"done_reason": done_reason(finish),
	});
	if let Some(calls) = tool_calls_from_openai(&message["tool_calls"]) {
		out["message"]["tool_calls"] = calls;
	}
	insert_usage(&mut out, resp.get("usage"), total_duration_ns, 0);
	out
}

/// OpenAI tool call list in Ollama's shape. OpenAI carries `arguments` as a
/// JSON string; Ollama wants the object.
pub fn tool_calls_from_openai(calls: &Value) -> Option<Value> {
	let calls = calls.as_array().filter(|calls| !calls.is_empty())?;
	let converted: Vec<Value> = calls
		.iter()
		.map(|call| {
			let name = call["function"]["name"].as_str().unwrap_or("");
			let arguments = call["function"]["arguments"]
				.as_str()
				.and_then(|args| serde_json::from_str::<Value>(args).ok())
				.unwrap_or_else(|| json!({}));
			json!({"function": {"name": name, "arguments": arguments}})
		})
		.collect();
	Some(json!(converted))
}

/// Reassembles tool calls from OpenAI streaming deltas, where the function
/// name arrives first and the arguments trickle in as string fragments.
#[derive(Debug, Default)]
pub struct ToolCallBuilder {
	calls: Vec<(String, String)>,
}

impl ToolCallBuilder {
	pub fn push_delta(&mut self, deltas: &Value) {
		let Some(deltas) = deltas.as_array() else { return };
		for delta in deltas {
			let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
			while self.calls.len() <= index {
				self.calls.push((String::new(), String::new()));
			}
			if let Some(name) = delta["function"]["name"].as_str() {
				self.calls[index].0.push_str(name);
			}
			if let Some(args) = delta["function"]["arguments"].as_str() {
				self.calls[index].1.push_str(args);
			}
		}
	}

	pub fn finish(self) -> Option<Value> {
		if self.calls.is_empty() {
			return None;
		}
		let calls: Vec<Value> = self
			.calls
			.into_iter()
			.map(|(name, args)| {
				let arguments = serde_json::from_str::<Value>(&args).unwrap_or_else(|_| json!({}));
				json!({"function": {"name": name, "arguments": arguments}})
			})
			.collect();
		Some(json!(calls))
	}
}

/// Non-streaming `/api/generate` response from an OpenAI completion.
pub fn generate_from_openai(resp: &Value, model: &str, total_duration_ns: u64) -> Value {
	let text = resp["choices"][0]["text"].as_str().unwrap_or("");
	let finish = resp["choices"][0]["finish_reason"].as_str();

	let mut out = json!({
		"model": model,
		"created_at": now_rfc3339(),
		"response": text,
		"done": true,
		"done_reason": done_reason(finish),
	});
	insert_usage(&mut out, resp.get("usage"), total_duration_ns, 0);
	out
}

/// `/api/embeddings` response from an OpenAI embeddings response.
pub fn embeddings_from_openai(resp: &Value) -> Value {
	json!({
		"embedding": resp["data"][0]["embedding"].clone(),
	})
}

/// Intermediate streaming chunk (`done: false`).
pub fn stream_chunk(model: &str, content: &str, chat: bool) -> Value {
	if chat {
		json!({
			"model": model,
			"created_at": now_rfc3339(),
			"message": {"role": "assistant", "content": content},
			"done": false,
		})
	} else {
		json!({
			"model": model,
			"created_at": now_rfc3339(),
			"response": content,
			"done": false,
		})
	}
}

/// Streaming chat chunk carrying assembled tool calls (`done: false`).
pub fn stream_tool_call_chunk(model: &str, tool_calls: Value) -> Value {
	json!({
		"model": model,
		"created_at": now_rfc3339(),
		"message": {"role": "assistant", "content": "", "tool_calls": tool_calls},
		"done": false,
	})
}

/// Final streaming chunk (`done: true`) with the timing and token counters.
pub fn stream_final_chunk(
	model: &str,
	chat: bool,
	finish_reason: Option<&str>,
	usage: Option<&Value>,
	total_duration_ns: u64,
	fallback_eval_count: u64,
) -> Value {
	let mut out = if chat {
		json!({
			"model": model,
			"created_at": now_rfc3339(),
			"message": {"role": "assistant", "content": ""},
			"done": true,
			"done_reason": done_reason(finish_reason),
		})
	} else {
		json!({
			"model": model,
			"created_at": now_rfc3339(),
			"response": "",
			"done": true,
			"done_reason": done_reason(finish_reason),
		})
	};
	insert_usage(&mut out, usage, total_duration_ns, fallback_eval_count);
	out
}

fn insert_usage(out: &mut Value, usage: Option<&Value>, total_duration_ns: u64, fallback_eval_count: u64) {
	let prompt_tokens = usage
		.and_then(|u| u.get("prompt_tokens"))
		.and_then(Value::as_u64)
		.unwrap_or(0);
	let completion_tokens = usage
		.and_then(|u| u.get("completion_tokens"))
		.and_then(Value::as_u64)
		.unwrap_or(fallback_eval_count);

	if let Some(obj) = out.as_object_mut() {
		obj.insert("total_duration".to_string(), json!(total_duration_ns));
		obj.insert("load_duration".to_string(), json!(0));
		obj.insert("prompt_eval_count".to_string(), json!(prompt_tokens));
		obj.insert("prompt_eval_duration".to_string(), json!(0));
		obj.insert("eval_count".to_string(), json!(completion_tokens));
		obj.insert("eval_duration".to_string(), json!(0));
	}
}

// -- Streaming chunk accessors (OpenAI side)

pub fn chunk_delta_content(chunk: &Value) -> Option<&str> {
	chunk["choices"][0]["delta"]["content"].as_str()
}

pub fn chunk_completion_text(chunk: &Value) -> Option<&str> {
	chunk["choices"][0]["text"].as_str()
}

pub fn chunk_finish_reason(chunk: &Value) -> Option<&str> {
	chunk["choices"][0]["finish_reason"].as_str()
}

pub fn chunk_delta_tool_calls(chunk: &Value) -> Option<&Value> {
	let calls = &chunk["choices"][0]["delta"]["tool_calls"];
	calls.is_array().then_some(calls)
}

// endregion: --- Responses

// region:    --- Catalog Views

/// `/api/tags` response.
pub fn tags_from_catalog(catalog: &Catalog) -> Value {
	let models: Vec<Value> = catalog
		.specs()
		.map(|spec| {
			json!({
				"name": spec.public_id,
				"model": spec.public_id,
				"modified_at": "",
				"size": 0,
				"digest": "",
				"details": model_details(),
			})
		})
		.collect();

	json!({"models": models})
}

/// `/api/show` response.
pub fn show_from_spec(spec: &ModelSpec) -> Value {
	let mut capabilities = vec!["completion"];
	if spec.supports_tools() {
		capabilities.push("tools");
	}

	json!({
		"modelfile": "",
		"parameters": "",
		"template": "",
		"details": model_details(),
		"model_info": {},
		"capabilities": capabilities,
	})
}

fn model_details() -> Value {
	json!({
		"parent_model": "",
		"format": "gguf",
		"family": "",
		"families": [],
		"parameter_size": "",
		"quantization_level": "",
	})
}

// endregion: --- Catalog Views

// region:    --- Tests


// endregion: --- Tests
