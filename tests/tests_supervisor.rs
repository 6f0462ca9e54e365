//! Process-level supervisor tests.
//!
//! The runner executables are stub shell scripts that record each launch and
//! then sleep. Readiness comes from a small in-test HTTP server answering
//! `/health` on the model's pinned port, which the stub never binds.

#![cfg(unix)]

use llama_relay::config::Config;
use llama_relay::runner::Supervisor;
use llama_relay::Error;
use serde_json::json;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// region:    --- Support

fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
	let path = dir.join(name);
	std::fs::write(&path, content).unwrap();
	std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
	path
}

/// A stub runtime that logs its pid and stays up until killed.
fn write_sleeper(dir: &Path, log: &Path) -> PathBuf {
	let content = format!("#!/bin/sh\necho \"launch $$\" >> {}\nexec sleep 300\n", log.display());
	write_script(dir, "stub-runner", &content)
}

/// A stub runtime that logs the launch, prints a diagnostic, lingers briefly,
/// then fails.
fn write_failer(dir: &Path, log: &Path) -> PathBuf {
	let content = format!(
		"#!/bin/sh\necho \"launch $$\" >> {}\necho \"ggml backend init failed\"\nsleep 1\nexit 1\n",
		log.display()
	);
	write_script(dir, "failing-runner", &content)
}

/// Minimal HTTP server answering 200 on `/health`, standing in for a healthy
/// runner on a pinned port.
async fn spawn_health_server() -> u16 {
	let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
	tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});
	port
}

/// A port nothing listens on.
fn free_port() -> u16 {
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
	listener.local_addr().unwrap().port()
}

fn config_with_models(runtime: &Path, models: &[(&str, u16)]) -> Config {
	let model_entries: serde_json::Map<String, serde_json::Value> = models
		.iter()
		.map(|(name, port)| {
			(
				name.to_string(),
				json!({"model_path": "/dev/null", "port": port}),
			)
		})
		.collect();

	let config = json!({
		"llama-runtimes": {
			"stub": {"runtime": runtime.to_string_lossy()}
		},
		"models": model_entries
			.into_iter()
			.map(|(name, mut entry)| {
				entry["llama_cpp_runtime"] = json!("stub");
				(name, entry)
			})
			.collect::<serde_json::Map<_, _>>(),
		"timeouts": {"startup_secs": 10, "stop_grace_secs": 2, "health_poll_ms": 50}
	});

	Config::from_json_str(&config.to_string()).unwrap()
}

fn launch_count(log: &Path) -> usize {
	std::fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
}

/// Wait until the launch log reaches `expected` lines, then assert the exact
/// count. The stubs write their log line after the health probe can already
/// succeed, so a plain read would race them.
async fn wait_for_launch_count(log: &Path, expected: usize) {
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		let count = launch_count(log);
		if count >= expected || std::time::Instant::now() >= deadline {
			assert_eq!(count, expected);
			return;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
}

fn process_alive(pid: u32) -> bool {
	unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

// endregion: --- Support

#[tokio::test]
#[serial]
async fn test_acquire_reuses_ready_runner() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port = spawn_health_server().await;

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Supervisor::from_config(&config);

	let first = supervisor.acquire("model-a").await.unwrap();
	let second = supervisor.acquire("model-a").await.unwrap();

	assert_eq!(first.pid, second.pid);
	assert_eq!(first.port, port);
	wait_for_launch_count(&log, 1).await;

	let status = supervisor.status().await;
	assert_eq!(status.len(), 1);
	assert_eq!(status[0].pid, first.pid);

	supervisor.shutdown_all().await;
	assert!(!process_alive(first.pid));
}

#[tokio::test]
#[serial]
async fn test_concurrent_acquires_launch_once() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port = spawn_health_server().await;

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Arc::new(Supervisor::from_config(&config));

	let tasks: Vec<_> = (0..8)
		.map(|_| {
			let supervisor = supervisor.clone();
			tokio::spawn(async move { supervisor.acquire("model-a").await })
		})
		.collect();

	let mut pids = Vec::new();
	for task in tasks {
		let endpoint = task.await.unwrap().unwrap();
		pids.push(endpoint.pid);
	}

	assert!(pids.windows(2).all(|w| w[0] == w[1]));
	wait_for_launch_count(&log, 1).await;

	supervisor.shutdown_all().await;
}

#[tokio::test]
#[serial]
async fn test_swap_replaces_previous_runner() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port = spawn_health_server().await;

	// Same pinned port, so the two models share a slot.
	let config = config_with_models(&runtime, &[("model-a", port), ("model-b", port)]);
	let supervisor = Supervisor::from_config(&config);

	let a = supervisor.acquire("model-a").await.unwrap();
	let b = supervisor.acquire("model-b").await.unwrap();

	assert_ne!(a.pid, b.pid);
	assert!(!process_alive(a.pid), "previous runner should be drained");
	assert!(process_alive(b.pid));
	wait_for_launch_count(&log, 2).await;

	let status = supervisor.status().await;
	assert_eq!(status.len(), 1);
	assert_eq!(status[0].model_name, "model-b");

	supervisor.shutdown_all().await;
	assert!(!process_alive(b.pid));
}

#[tokio::test]
#[serial]
async fn test_independent_ports_not_serialized() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port_a = spawn_health_server().await;
	let port_b = spawn_health_server().await;

	let config = config_with_models(&runtime, &[("model-a", port_a), ("model-b", port_b)]);
	let supervisor = Supervisor::from_config(&config);

	let a = supervisor.acquire("model-a").await.unwrap();
	let b = supervisor.acquire("model-b").await.unwrap();

	// Different slots, both stay up.
	assert!(process_alive(a.pid));
	assert!(process_alive(b.pid));
	assert_eq!(supervisor.status().await.len(), 2);

	supervisor.shutdown_all().await;
	assert!(!process_alive(a.pid));
	assert!(!process_alive(b.pid));
}

#[tokio::test]
#[serial]
async fn test_exiting_runner_fails_fast() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_failer(dir.path(), &log);
	let port = free_port();

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Supervisor::from_config(&config);

	// Well before the 10s startup deadline: the exit is detected, not timed out.
	let res = tokio::time::timeout(Duration::from_secs(5), supervisor.acquire("model-a")).await;
	let res = res.expect("should fail fast, not hang until the startup deadline");

	match res {
		Err(Error::LaunchFailure { reason, .. }) => {
			// One-line summary only; the runner's own output stays in the logs.
			assert!(reason.contains("exited with code 1"), "reason: {reason}");
			assert!(!reason.contains('\n'), "reason: {reason}");
			assert!(!reason.contains("ggml backend init failed"), "reason: {reason}");
		}
		other => panic!("expected LaunchFailure, got {other:?}"),
	}
	assert!(supervisor.status().await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_launch_failure_reported_to_all_waiters() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_failer(dir.path(), &log);
	let port = free_port();

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Arc::new(Supervisor::from_config(&config));

	let tasks: Vec<_> = (0..8)
		.map(|_| {
			let supervisor = supervisor.clone();
			tokio::spawn(async move { supervisor.acquire("model-a").await })
		})
		.collect();

	for task in tasks {
		let res = task.await.unwrap();
		assert!(matches!(res, Err(Error::LaunchFailure { .. })));
	}

	// One attempt served every waiter.
	wait_for_launch_count(&log, 1).await;
	assert!(supervisor.status().await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_health_check_timeout_kills_runner() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	// Nothing answers /health here.
	let port = free_port();

	let config = Config::from_json_str(
		&json!({
			"llama-runtimes": {"stub": {"runtime": runtime.to_string_lossy()}},
			"models": {"model-a": {"model_path": "/dev/null", "llama_cpp_runtime": "stub", "port": port}},
			"timeouts": {"startup_secs": 1, "stop_grace_secs": 2, "health_poll_ms": 50}
		})
		.to_string(),
	)
	.unwrap();
	let supervisor = Supervisor::from_config(&config);

	let res = supervisor.acquire("model-a").await;
	assert!(matches!(res, Err(Error::HealthCheckTimeout { .. })));
	assert!(supervisor.status().await.is_empty());

	// The stuck process must not linger.
	let pid_line = std::fs::read_to_string(&log).unwrap();
	let pid: u32 = pid_line.trim().rsplit(' ').next().unwrap().parse().unwrap();
	assert!(!process_alive(pid));
}

#[tokio::test]
#[serial]
async fn test_shutdown_all_idempotent() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port = spawn_health_server().await;

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Supervisor::from_config(&config);

	let endpoint = supervisor.acquire("model-a").await.unwrap();

	supervisor.shutdown_all().await;
	supervisor.shutdown_all().await;

	assert!(!process_alive(endpoint.pid));
	assert!(supervisor.status().await.is_empty());

	// A new request relaunches from scratch.
	let endpoint = supervisor.acquire("model-a").await.unwrap();
	wait_for_launch_count(&log, 2).await;
	supervisor.shutdown_all().await;
	assert!(!process_alive(endpoint.pid));
}

#[tokio::test]
#[serial]
async fn test_shutdown_waits_for_swap_in_flight() {
	let dir = tempfile::tempdir().unwrap();
	let log = dir.path().join("launches.log");
	let runtime = write_sleeper(dir.path(), &log);
	let port = spawn_health_server().await;

	let config = config_with_models(&runtime, &[("model-a", port)]);
	let supervisor = Arc::new(Supervisor::from_config(&config));

	// Race a shutdown against a swap that is already in flight. The shutdown
	// must wait for the swap and sweep whatever it committed, never leave a
	// runner tracked behind its back.
	let acquirer = supervisor.clone();
	let task = tokio::spawn(async move { acquirer.acquire("model-a").await });
	tokio::time::sleep(Duration::from_millis(100)).await;
	supervisor.shutdown_all().await;

	let res = task.await.unwrap();
	assert!(supervisor.status().await.is_empty());
	if let Ok(endpoint) = res {
		assert!(!process_alive(endpoint.pid));
	}
}
