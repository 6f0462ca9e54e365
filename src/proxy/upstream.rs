//! Forwarding to a ready runner: single-shot JSON and streaming variants.

use crate::runner::Endpoint;
use crate::{Error, Result};
use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;

/// Generous ceiling so long generations are not cut off mid-completion.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// POST `body` and decode the JSON answer. The backend's status code is
/// passed through so listeners can relay backend-side errors verbatim.
pub async fn forward_json(
	client: &reqwest::Client,
	endpoint: &Endpoint,
	path: &str,
	body: &Value,
) -> Result<(reqwest::StatusCode, Value)> {
	let url = format!("{}{path}", endpoint.base_url);
	let resp = client
		.post(&url)
		.json(body)
		.timeout(UPSTREAM_TIMEOUT)
		.send()
		.await
		.map_err(|err| Error::upstream(format!("request to runner failed: {err}")))?;

	let status = resp.status();
	let value: Value = resp
		.json()
		.await
		.map_err(|err| Error::upstream(format!("invalid JSON from runner: {err}")))?;

	Ok((status, value))
}

/// POST `body` and return the raw response byte stream (SSE passthrough).
/// A non-2xx backend answer is turned into an error carrying its body.
pub async fn forward_byte_stream(
	client: &reqwest::Client,
	endpoint: &Endpoint,
	path: &str,
	body: &Value,
) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + use<>> {
	let resp = send_streaming(client, endpoint, path, body).await?;
	Ok(resp.bytes_stream())
}

/// POST `body` and return the response parsed as SSE events.
pub async fn forward_sse(
	client: &reqwest::Client,
	endpoint: &Endpoint,
	path: &str,
	body: &Value,
) -> Result<impl Stream<Item = Result<Event>> + use<>> {
	let resp = send_streaming(client, endpoint, path, body).await?;
	let stream = resp
		.bytes_stream()
		.eventsource()
		.map(|res| res.map_err(|err| Error::upstream(format!("runner stream error: {err}"))));
	Ok(stream)
}

async fn send_streaming(
	client: &reqwest::Client,
	endpoint: &Endpoint,
	path: &str,
	body: &Value,
) -> Result<reqwest::Response> {
	let url = format!("{}{path}", endpoint.base_url);
	let resp = client
		.post(&url)
		.json(body)
		.timeout(UPSTREAM_TIMEOUT)
		.send()
		.await
		.map_err(|err| Error::upstream(format!("request to runner failed: {err}")))?;

	if !resp.status().is_success() {
		let status = resp.status();
		let text = resp.text().await.unwrap_or_default();
		return Err(Error::upstream(format!("runner answered {status}: {text}")));
	}

	Ok(resp)
}
