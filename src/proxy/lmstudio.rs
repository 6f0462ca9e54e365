//! LM Studio / OpenAI compatible API surface (default port 1234).
//!
//! Bodies are already in the OpenAI dialect, so forwarding is mostly
//! verbatim. The listener's own work is model resolution, driving the
//! supervisor, and the tool-capability filter.

use crate::config::ModelSpec;
use crate::proxy::{error_status, filter, upstream, ProxyState};
use crate::{Error, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Placeholder `created` timestamp for model listings, matching what LM
/// Studio itself reports for local models.
const MODEL_CREATED: i64 = 1_678_880_000;

pub fn router(state: Arc<ProxyState>) -> Router {
	Router::new()
		.route("/v1/models", get(list_models))
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/completions", post(completions))
		.route("/v1/embeddings", post(embeddings))
		// LM Studio's native REST surface. The POST routes forward to the
		// same `/v1/*` backend paths as their OpenAI twins.
		.route("/api/v0/models", get(rest_models))
		.route("/api/v0/models/:model_id", get(rest_model))
		.route("/api/v0/chat/completions", post(chat_completions))
		.route("/api/v0/completions", post(completions))
		.route("/api/v0/embeddings", post(embeddings))
		.with_state(state)
}

// region:    --- Handlers

async fn list_models(State(state): State<Arc<ProxyState>>) -> Json<Value> {
	let data: Vec<Value> = state
		.supervisor
		.catalog()
		.specs()
		.map(|spec| {
			json!({
				"id": spec.public_id,
				"object": "model",
				"created": MODEL_CREATED,
				"owned_by": "organization_owner",
			})
		})
		.collect();

	Json(json!({"object": "list", "data": data}))
}

async fn rest_models(State(state): State<Arc<ProxyState>>) -> Json<Value> {
	let running: Vec<String> = state
		.supervisor
		.status()
		.await
		.into_iter()
		.map(|status| status.public_id)
		.collect();

	let data: Vec<Value> = state
		.supervisor
		.catalog()
		.specs()
		.map(|spec| rest_model_record(spec, running.iter().any(|id| id == &spec.public_id)))
		.collect();

	Json(json!({"object": "list", "data": data}))
}

async fn rest_model(State(state): State<Arc<ProxyState>>, Path(model_id): Path<String>) -> Response {
	let Some(spec) = state.supervisor.catalog().resolve(&model_id).cloned() else {
		return error_response(&Error::UnknownModel { model: model_id });
	};

	let running = state
		.supervisor
		.status()
		.await
		.iter()
		.any(|status| status.public_id == spec.public_id);

	Json(rest_model_record(&spec, running)).into_response()
}

/// One model record in LM Studio's REST shape. GGUF metadata is not read, so
/// the architecture fields carry the same fallbacks LM Studio shows for
/// unreadable files.
fn rest_model_record(spec: &ModelSpec, loaded: bool) -> Value {
	let mut record = json!({
		"id": spec.public_id,
		"object": "model",
		"type": "llm",
		"publisher": "local",
		"arch": "unknown",
		"compatibility_type": "gguf",
		"quantization": "Unknown",
		"state": if loaded { "loaded" } else { "not-loaded" },
		"max_context_length": 4096,
	});
	if spec.supports_tools() {
		record["capabilities"] = json!(["tool_use"]);
	}
	record
}

async fn chat_completions(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	completion_like(state, "/v1/chat/completions", body).await
}

async fn completions(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	completion_like(state, "/v1/completions", body).await
}

async fn completion_like(state: Arc<ProxyState>, path: &'static str, body: Bytes) -> Response {
	let mut body: Value = match serde_json::from_slice(&body) {
		Ok(body) => body,
		Err(err) => return bad_request(format!("invalid JSON request body: {err}")),
	};

	let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
		return bad_request("missing 'model' in request body");
	};
	let Some(spec) = state.supervisor.catalog().resolve(&model).cloned() else {
		return error_response(&Error::UnknownModel { model });
	};

	let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

	let stripped = !spec.supports_tools() && filter::strip_tool_fields(&mut body);
	if stripped {
		debug!(model = %spec.name, "stripped tool fields for runtime without tool support");
	}

	let endpoint = match state.supervisor.acquire(&model).await {
		Ok(endpoint) => endpoint,
		Err(err) => return error_response(&err),
	};

	if stream {
		if stripped {
			scrubbed_sse(state, endpoint, path, body).await
		} else {
			passthrough_sse(state, endpoint, path, body).await
		}
	} else {
		let (status, mut resp) = match upstream::forward_json(&state.client, &endpoint, path, &body).await {
			Ok(ok) => ok,
			Err(err) => return error_response(&err),
		};
		if stripped {
			filter::scrub_tool_fragments(&mut resp);
		}
		// Relay the backend's status so its own errors come through intact.
		(status, Json(resp)).into_response()
	}
}

async fn embeddings(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	let body: Value = match serde_json::from_slice(&body) {
		Ok(body) => body,
		Err(err) => return bad_request(format!("invalid JSON request body: {err}")),
	};

	let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
		return bad_request("missing 'model' in request body");
	};
	if state.supervisor.catalog().resolve(&model).is_none() {
		return error_response(&Error::UnknownModel { model });
	}

	let endpoint = match state.supervisor.acquire(&model).await {
		Ok(endpoint) => endpoint,
		Err(err) => return error_response(&err),
	};

	let (status, resp) = match upstream::forward_json(&state.client, &endpoint, "/v1/embeddings", &body).await {
		Ok(ok) => ok,
		Err(err) => return error_response(&err),
	};
	(status, Json(resp)).into_response()
}

// endregion: --- Handlers

// region:    --- Streaming

/// Untouched byte-for-byte relay of the backend's SSE stream.
async fn passthrough_sse(state: Arc<ProxyState>, endpoint: crate::runner::Endpoint, path: &str, body: Value) -> Response {
	let stream = match upstream::forward_byte_stream(&state.client, &endpoint, path, &body).await {
		Ok(stream) => stream,
		Err(err) => return error_response(&err),
	};
	sse_response(Body::from_stream(stream))
}

/// Re-emitted SSE with `tool_calls` scrubbed from every chunk. Only used when
/// the request-side filter actually removed something.
async fn scrubbed_sse(state: Arc<ProxyState>, endpoint: crate::runner::Endpoint, path: &str, body: Value) -> Response {
	let events = match upstream::forward_sse(&state.client, &endpoint, path, &body).await {
		Ok(events) => events,
		Err(err) => return error_response(&err),
	};

	let stream = events.map(|next| -> Result<Bytes> {
		let event = next?;
		if event.data == "[DONE]" {
			return Ok(Bytes::from_static(b"data: [DONE]\n\n"));
		}
		match serde_json::from_str::<Value>(&event.data) {
			Ok(mut chunk) => {
				filter::scrub_tool_fragments(&mut chunk);
				Ok(Bytes::from(format!("data: {chunk}\n\n")))
			}
			Err(_) => Ok(Bytes::from(format!("data: {}\n\n", event.data))),
		}
	});

	sse_response(Body::from_stream(stream))
}

fn sse_response(body: Body) -> Response {
	match Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.body(body)
	{
		Ok(resp) => resp,
		Err(err) => error_response(&Error::upstream(format!("cannot build response: {err}"))),
	}
}

// endregion: --- Streaming

// region:    --- Error Envelope

fn error_type(err: &Error) -> &'static str {
	match err {
		Error::UnknownModel { .. } => "model_not_found",
		Error::LaunchFailure { .. } | Error::HealthCheckTimeout { .. } => "runner_startup_error",
		Error::Upstream { .. } | Error::Reqwest(_) => "runner_communication_error",
		Error::SerdeJson(_) => "invalid_request_error",
		_ => "internal_error",
	}
}

fn error_response(err: &Error) -> Response {
	let envelope = json!({"error": {"message": err.to_string(), "type": error_type(err)}});
	(error_status(err), Json(envelope)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
	let envelope = json!({"error": {"message": message.into(), "type": "invalid_request_error"}});
	(StatusCode::BAD_REQUEST, Json(envelope)).into_response()
}

// endregion: --- Error Envelope
