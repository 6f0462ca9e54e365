//! Ollama-compatible API surface (default port 11434).
//!
//! Requests are translated to the OpenAI dialect, routed through the
//! supervisor, and the answers translated back. Ollama streaming defaults to
//! on and uses line-delimited JSON rather than SSE.

// region:    --- Modules

pub mod convert;

// endregion: --- Modules

use crate::proxy::{error_status, filter, upstream, ProxyState};
use crate::{Error, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use eventsource_stream::Event;
use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

pub fn router(state: Arc<ProxyState>) -> Router {
	Router::new()
		.route("/api/tags", get(tags))
		.route("/api/show", post(show))
		.route("/api/chat", post(chat))
		.route("/api/generate", post(generate))
		.route("/api/embeddings", post(embeddings))
		.with_state(state)
}

// region:    --- Handlers

async fn tags(State(state): State<Arc<ProxyState>>) -> Json<Value> {
	Json(convert::tags_from_catalog(state.supervisor.catalog()))
}

async fn show(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	let body: Value = match serde_json::from_slice(&body) {
		Ok(body) => body,
		Err(err) => return error_message(StatusCode::BAD_REQUEST, format!("invalid JSON request body: {err}")),
	};

	let Some(model) = model_field(&body) else {
		return error_message(StatusCode::BAD_REQUEST, "model name not specified in request body");
	};
	let Some(spec) = state.supervisor.catalog().resolve(model) else {
		return error_message(StatusCode::NOT_FOUND, format!("model '{model}' not found"));
	};

	Json(convert::show_from_spec(spec)).into_response()
}

async fn chat(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	completion_like(state, body, true).await
}

async fn generate(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	completion_like(state, body, false).await
}

async fn completion_like(state: Arc<ProxyState>, body: Bytes, chat: bool) -> Response {
	let body: Value = match serde_json::from_slice(&body) {
		Ok(body) => body,
		Err(err) => return error_message(StatusCode::BAD_REQUEST, format!("invalid JSON request body: {err}")),
	};

	let Some(model) = model_field(&body) else {
		return error_message(StatusCode::BAD_REQUEST, "model name not specified in request body");
	};
	let Some(spec) = state.supervisor.catalog().resolve(model).cloned() else {
		return error_message(StatusCode::NOT_FOUND, format!("model '{model}' not found"));
	};

	// Ollama streams unless told otherwise.
	let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(true);

	let converted = if chat {
		convert::chat_to_openai(&body, &spec.public_id, stream)
	} else {
		convert::generate_to_openai(&body, &spec.public_id, stream)
	};
	let mut openai_body = match converted {
		Ok(openai_body) => openai_body,
		Err(err) => return error_message(StatusCode::BAD_REQUEST, format!("cannot convert request: {err}")),
	};

	if !spec.supports_tools() && filter::strip_tool_fields(&mut openai_body) {
		debug!(model = %spec.name, "stripped tool fields for runtime without tool support");
	}

	let endpoint = match state.supervisor.acquire(model).await {
		Ok(endpoint) => endpoint,
		Err(err) => return error_response(&err),
	};

	let path = if chat { "/v1/chat/completions" } else { "/v1/completions" };
	let started = Instant::now();

	if stream {
		let events = match upstream::forward_sse(&state.client, &endpoint, path, &openai_body).await {
			Ok(events) => events,
			Err(err) => return error_response(&err),
		};
		let ndjson = NdjsonStream::spawn(events, spec.public_id.clone(), chat);
		ndjson_response(ndjson)
	} else {
		let (status, resp) = match upstream::forward_json(&state.client, &endpoint, path, &openai_body).await {
			Ok(ok) => ok,
			Err(err) => return error_response(&err),
		};
		if !status.is_success() {
			return error_message(status, format!("runner error: {resp}"));
		}
		let elapsed_ns = started.elapsed().as_nanos() as u64;
		let out = if chat {
			convert::chat_from_openai(&resp, &spec.public_id, elapsed_ns)
		} else {
			convert::generate_from_openai(&resp, &spec.public_id, elapsed_ns)
		};
		Json(out).into_response()
	}
}

async fn embeddings(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
	let body: Value = match serde_json::from_slice(&body) {
		Ok(body) => body,
		Err(err) => return error_message(StatusCode::BAD_REQUEST, format!("invalid JSON request body: {err}")),
	};

	let Some(model) = model_field(&body) else {
		return error_message(StatusCode::BAD_REQUEST, "model name not specified in request body");
	};
	let Some(spec) = state.supervisor.catalog().resolve(model).cloned() else {
		return error_message(StatusCode::NOT_FOUND, format!("model '{model}' not found"));
	};

	let endpoint = match state.supervisor.acquire(model).await {
		Ok(endpoint) => endpoint,
		Err(err) => return error_response(&err),
	};

	let openai_body = convert::embeddings_to_openai(&body, &spec.public_id);
	let (status, resp) = match upstream::forward_json(&state.client, &endpoint, "/v1/embeddings", &openai_body).await {
		Ok(ok) => ok,
		Err(err) => return error_response(&err),
	};
	if !status.is_success() {
		return error_message(status, format!("runner error: {resp}"));
	}

	Json(convert::embeddings_from_openai(&resp)).into_response()
}

// endregion: --- Handlers

// region:    --- NDJSON Streaming

/// Converts a backend SSE stream into Ollama NDJSON chunks, ending with the
/// `done: true` record. Backed by a task so client disconnects simply drop
/// the receiver and stop the forwarding.
pub struct NdjsonStream {
	rx: mpsc::Receiver<Result<Bytes>>,
}

impl NdjsonStream {
	pub fn spawn(
		events: impl Stream<Item = Result<Event>> + Send + 'static,
		model: String,
		chat: bool,
	) -> Self {
		let (tx, rx) = mpsc::channel(32);

		tokio::spawn(async move {
			let started = Instant::now();
			let mut events = Box::pin(events);
			let mut eval_count: u64 = 0;
			let mut finish_reason: Option<String> = None;
			let mut usage: Option<Value> = None;
			let mut tool_calls = convert::ToolCallBuilder::default();

			while let Some(next) = futures::StreamExt::next(&mut events).await {
				let event = match next {
					Ok(event) => event,
					Err(err) => {
						let _ = tx.send(Err(err)).await;
						return;
					}
				};

				if event.data == "[DONE]" {
					break;
				}
				let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
					continue;
				};

				if let Some(reason) = convert::chunk_finish_reason(&chunk) {
					finish_reason = Some(reason.to_string());
				}
				if let Some(chunk_usage) = chunk.get("usage").filter(|u| u.is_object()) {
					usage = Some(chunk_usage.clone());
				}
				if chat {
					if let Some(deltas) = convert::chunk_delta_tool_calls(&chunk) {
						tool_calls.push_delta(deltas);
					}
				}

				let content = if chat {
					convert::chunk_delta_content(&chunk)
				} else {
					convert::chunk_completion_text(&chunk)
				};
				if let Some(content) = content {
					if !content.is_empty() {
						eval_count += 1;
						let line = ndjson_line(&convert::stream_chunk(&model, content, chat));
						if tx.send(Ok(line)).await.is_err() {
							// Client went away.
							return;
						}
					}
				}
			}

			// Tool calls are reassembled from the deltas and emitted as one
			// chunk ahead of the final record.
			if let Some(calls) = tool_calls.finish() {
				let line = ndjson_line(&convert::stream_tool_call_chunk(&model, calls));
				if tx.send(Ok(line)).await.is_err() {
					return;
				}
			}

			let final_chunk = convert::stream_final_chunk(
				&model,
				chat,
				finish_reason.as_deref(),
				usage.as_ref(),
				started.elapsed().as_nanos() as u64,
				eval_count,
			);
			let _ = tx.send(Ok(ndjson_line(&final_chunk))).await;
		});

		NdjsonStream { rx }
	}
}

impl Stream for NdjsonStream {
	type Item = Result<Bytes>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}

fn ndjson_line(value: &Value) -> Bytes {
	Bytes::from(format!("{value}\n"))
}

fn ndjson_response(stream: NdjsonStream) -> Response {
	match Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/x-ndjson")
		.body(Body::from_stream(stream))
	{
		Ok(resp) => resp,
		Err(err) => error_message(StatusCode::INTERNAL_SERVER_ERROR, format!("cannot build response: {err}")),
	}
}

// endregion: --- NDJSON Streaming

// region:    --- Error Envelope

fn model_field(body: &Value) -> Option<&str> {
	body.get("model").or_else(|| body.get("name")).and_then(Value::as_str)
}

fn error_response(err: &Error) -> Response {
	error_message(error_status(err), err.to_string())
}

fn error_message(status: StatusCode, message: impl Into<String>) -> Response {
	(status, Json(json!({"error": message.into()}))).into_response()
}

// endregion: --- Error Envelope
