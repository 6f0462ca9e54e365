//! A single supervised backend process.
//!
//! The spawned child is owned by a monitor task that reaps it and publishes
//! the exit code on a watch channel. Everything else (termination, liveness
//! checks) goes through the pid and that channel, so an `Instance` can be
//! shared behind an `Arc` without mutable access to the child.

use crate::runner::build_launch_args;
use crate::config::ModelSpec;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lines of merged stdout/stderr kept for failure diagnostics.
const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug)]
pub struct Instance {
	pub model_name: String,
	pub public_id: String,
	pub pid: u32,
	pub port: u16,
	started_at: Instant,
	exit_rx: watch::Receiver<Option<i32>>,
	output_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Instance {
	/// Spawn the runtime process for `spec` on `port`.
	///
	/// Only covers process creation. Readiness is the prober's concern.
	pub fn spawn(spec: &ModelSpec, port: u16) -> Result<Instance> {
		let args = build_launch_args(spec, port);
		debug!(command = %spec.runtime.command, ?args, "spawning runner");

		let mut child = Command::new(&spec.runtime.command)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			// Safety net if the monitor task is ever dropped before reaping.
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| {
				Error::launch_failure(spec.name.clone(), format!("cannot spawn '{}': {err}", spec.runtime.command))
			})?;

		let pid = child
			.id()
			.ok_or_else(|| Error::launch_failure(spec.name.clone(), "process exited before startup"))?;

		let output_tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));

		if let Some(stdout) = child.stdout.take() {
			tokio::spawn(read_lines(stdout, spec.name.clone(), output_tail.clone()));
		}
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(read_lines(stderr, spec.name.clone(), output_tail.clone()));
		}

		let (exit_tx, exit_rx) = watch::channel(None);
		let model_name = spec.name.clone();
		tokio::spawn(async move {
			let code = match child.wait().await {
				Ok(status) => status.code().unwrap_or(-1),
				Err(err) => {
					warn!(model = %model_name, %err, "failed to wait on runner process");
					-1
				}
			};
			info!(model = %model_name, pid, code, "runner process exited");
			let _ = exit_tx.send(Some(code));
		});

		info!(model = %spec.name, pid, port, "runner process started");

		Ok(Instance {
			model_name: spec.name.clone(),
			public_id: spec.public_id.clone(),
			pid,
			port,
			started_at: Instant::now(),
			exit_rx,
			output_tail,
		})
	}

	pub fn endpoint(&self) -> String {
		format!("http://127.0.0.1:{}", self.port)
	}

	pub fn is_alive(&self) -> bool {
		self.exit_rx.borrow().is_none()
	}

	pub fn uptime(&self) -> Duration {
		self.started_at.elapsed()
	}

	/// Watch channel holding `Some(exit_code)` once the process has exited.
	pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
		self.exit_rx.clone()
	}

	/// The last captured output lines, for error reporting.
	pub fn output_tail(&self) -> String {
		match self.output_tail.lock() {
			Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
			Err(_) => String::new(),
		}
	}

	/// SIGTERM, then SIGKILL after `grace` if the process is still up.
	pub async fn terminate(&self, grace: Duration) {
		if !self.is_alive() {
			return;
		}

		info!(model = %self.model_name, pid = self.pid, "stopping runner (SIGTERM)");
		signal(self.pid, libc::SIGTERM);

		if self.wait_exited(grace).await {
			return;
		}

		warn!(model = %self.model_name, pid = self.pid, "runner did not stop in time, sending SIGKILL");
		signal(self.pid, libc::SIGKILL);
		self.wait_exited(Duration::from_secs(5)).await;
	}

	/// Wait up to `timeout` for the exit code. Returns whether the process exited.
	pub async fn wait_exited(&self, timeout: Duration) -> bool {
		let mut rx = self.exit_rx.clone();
		tokio::time::timeout(timeout, rx.wait_for(|code| code.is_some()))
			.await
			.is_ok_and(|res| res.is_ok())
	}
}

fn signal(pid: u32, sig: libc::c_int) {
	// ESRCH just means the process already exited.
	unsafe {
		libc::kill(pid as libc::pid_t, sig);
	}
}

async fn read_lines(
	reader: impl tokio::io::AsyncRead + Unpin,
	model_name: String,
	tail: Arc<Mutex<VecDeque<String>>>,
) {
	let mut lines = BufReader::new(reader).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		debug!(model = %model_name, "runner: {line}");
		if let Ok(mut tail) = tail.lock() {
			if tail.len() == OUTPUT_TAIL_LINES {
				tail.pop_front();
			}
			tail.push_back(line);
		}
	}
}
