//! llama-relay supervises llama.cpp-family server processes and exposes them
//! behind two local API surfaces:
//!
//! - an LM Studio / OpenAI compatible API (default port 1234)
//! - an Ollama compatible API (default port 11434)
//!
//! Backend processes are launched on demand from the model catalog, probed for
//! readiness, and swapped out when a request names a different model. At most
//! one backend owns a given port slot at any time.

// region:    --- Modules

mod error;

pub mod config;
pub mod proxy;
pub mod runner;
pub mod server;

// -- Flatten
pub use error::{Error, Result};

// endregion: --- Modules
