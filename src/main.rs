use llama_relay::config::Config;
use llama_relay::runner::Supervisor;
use llama_relay::server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = match CliArgs::parse(std::env::args().skip(1)) {
		Ok(args) => args,
		Err(message) => {
			eprintln!("{message}");
			eprintln!("usage: llama-relay [--config <path>] [--headless]");
			std::process::exit(2);
		}
	};

	let config = match Config::load(args.config.as_deref()) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("llama-relay: {err}");
			std::process::exit(1);
		}
	};

	info!(models = config.catalog.len(), "configuration loaded");
	if args.headless {
		info!("--headless accepted (this build always runs headless)");
	}

	let supervisor = Arc::new(Supervisor::from_config(&config));
	if let Err(err) = server::serve(&config, supervisor).await {
		eprintln!("llama-relay: {err}");
		std::process::exit(1);
	}
}

#[derive(Debug, Default)]
struct CliArgs {
	config: Option<String>,
	// Accepted for command-line compatibility. This build has no GUI, so the
	// flag changes nothing.
	headless: bool,
}

impl CliArgs {
	fn parse(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
		let mut parsed = CliArgs::default();

		while let Some(arg) = args.next() {
			match arg.as_str() {
				"--config" => {
					let value = args.next().ok_or("--config requires a path")?;
					parsed.config = Some(value);
				}
				"--headless" => parsed.headless = true,
				other => return Err(format!("unknown argument '{other}'")),
			}
		}

		Ok(parsed)
	}
}
