//! Readiness probing for freshly launched runners.

use crate::runner::Instance;
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `GET /health` until the runner answers 2xx, it exits, or `startup`
/// elapses. Does not terminate the process on failure; that is the caller's
/// call.
pub async fn wait_until_ready(
	client: &reqwest::Client,
	instance: &Instance,
	startup: Duration,
	poll: Duration,
) -> Result<()> {
	let deadline = Instant::now() + startup;
	let url = format!("{}/health", instance.endpoint());
	let mut exit_rx = instance.exit_watch();

	loop {
		tokio::select! {
			exited = exit_rx.wait_for(|code| code.is_some()) => {
				let code = exited.ok().and_then(|code| *code).unwrap_or(-1);
				// The captured output goes to the log; clients only get the
				// one-line summary.
				let tail = instance.output_tail();
				if !tail.is_empty() {
					warn!(model = %instance.model_name, "runner output before exit:\n{tail}");
				}
				return Err(Error::launch_failure(
					instance.model_name.clone(),
					format!("process exited with code {code} during startup"),
				));
			}

			res = client.get(&url).timeout(PROBE_REQUEST_TIMEOUT).send() => {
				match res {
					Ok(resp) if resp.status().is_success() => {
						info!(model = %instance.model_name, port = instance.port, "runner is healthy");
						return Ok(());
					}
					Ok(resp) => debug!(model = %instance.model_name, status = %resp.status(), "health probe not ready"),
					Err(err) => debug!(model = %instance.model_name, %err, "health probe failed"),
				}
			}
		}

		if Instant::now() >= deadline {
			return Err(Error::HealthCheckTimeout {
				model: instance.model_name.clone(),
				waited_secs: startup.as_secs(),
			});
		}

		tokio::time::sleep(poll).await;
	}
}
