use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

/// Main llama-relay error type.
#[derive(Debug, From)]
pub enum Error {
	// -- Config
	Config {
		reason: String,
	},

	// -- Model resolution
	UnknownModel {
		model: String,
	},

	// -- Runner lifecycle
	LaunchFailure {
		model: String,
		reason: String,
	},
	HealthCheckTimeout {
		model: String,
		waited_secs: u64,
	},

	// -- Proxying
	Upstream {
		reason: String,
	},

	// -- Externals
	#[from]
	Io(std::io::Error),
	#[from]
	Reqwest(reqwest::Error),
	#[from]
	SerdeJson(serde_json::Error),
	#[from]
	JsonValueExt(value_ext::JsonValueExtError),
}

// region:    --- Custom Constructors

impl Error {
	pub fn config(reason: impl Into<String>) -> Self {
		Self::Config { reason: reason.into() }
	}

	pub fn launch_failure(model: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::LaunchFailure {
			model: model.into(),
			reason: reason.into(),
		}
	}

	pub fn upstream(reason: impl Into<String>) -> Self {
		Self::Upstream { reason: reason.into() }
	}
}

// endregion: --- Custom Constructors

// region:    --- Error Boilerplate

impl core::fmt::Display for Error {
	fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
		match self {
			Self::Config { reason } => write!(fmt, "Configuration error: {reason}"),
			Self::UnknownModel { model } => write!(fmt, "Unknown model '{model}'"),
			Self::LaunchFailure { model, reason } => write!(fmt, "Failed to launch runner for '{model}': {reason}"),
			Self::HealthCheckTimeout { model, waited_secs } => {
				write!(fmt, "Runner for '{model}' did not become healthy within {waited_secs}s")
			}
			Self::Upstream { reason } => write!(fmt, "Error communicating with runner: {reason}"),
			other => write!(fmt, "{other:?}"),
		}
	}
}

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate
