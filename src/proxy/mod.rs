//! The proxy listeners and their shared plumbing.

// region:    --- Modules

pub mod filter;
pub mod lmstudio;
pub mod ollama;
pub mod upstream;

// endregion: --- Modules

use crate::runner::Supervisor;
use crate::Error;
use axum::http::StatusCode;
use std::sync::Arc;

/// Shared state for both listeners.
#[derive(Debug)]
pub struct ProxyState {
	pub supervisor: Arc<Supervisor>,
	pub client: reqwest::Client,
}

impl ProxyState {
	pub fn new(supervisor: Arc<Supervisor>) -> Arc<Self> {
		Arc::new(ProxyState {
			supervisor,
			client: reqwest::Client::new(),
		})
	}
}

/// Status code mapping shared by both listeners. The envelope shape is each
/// listener's own.
pub(crate) fn error_status(err: &Error) -> StatusCode {
	match err {
		Error::UnknownModel { .. } => StatusCode::NOT_FOUND,
		Error::LaunchFailure { .. } | Error::HealthCheckTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
		Error::Upstream { .. } | Error::Reqwest(_) => StatusCode::BAD_GATEWAY,
		Error::SerdeJson(_) => StatusCode::BAD_REQUEST,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}
