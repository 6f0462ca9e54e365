//! Listener wiring and graceful shutdown.

use crate::config::Config;
use crate::proxy::{lmstudio, ollama, ProxyState};
use crate::runner::Supervisor;
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Bind the enabled listeners and serve until SIGINT/SIGTERM, then stop all
/// runners.
pub async fn serve(config: &Config, supervisor: Arc<Supervisor>) -> Result<()> {
	let state = ProxyState::new(supervisor.clone());

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		wait_for_signal().await;
		info!("shutdown signal received");
		let _ = shutdown_tx.send(true);
	});

	let mut servers = Vec::new();

	if config.proxies.lmstudio.enabled {
		let port = config.proxies.lmstudio_port();
		let listener = bind(port).await?;
		info!(port, "LM Studio API listening");
		servers.push(tokio::spawn(run_listener(
			listener,
			lmstudio::router(state.clone()),
			shutdown_rx.clone(),
		)));
	} else {
		info!("LM Studio API disabled in config");
	}

	if config.proxies.ollama.enabled {
		let port = config.proxies.ollama_port();
		let listener = bind(port).await?;
		info!(port, "Ollama API listening");
		servers.push(tokio::spawn(run_listener(
			listener,
			ollama::router(state.clone()),
			shutdown_rx.clone(),
		)));
	} else {
		info!("Ollama API disabled in config");
	}

	for server in servers {
		let _ = server.await;
	}

	info!("listeners stopped, shutting down runners");
	supervisor.shutdown_all().await;

	Ok(())
}

async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
	Ok(tokio::net::TcpListener::bind(("127.0.0.1", port)).await?)
}

async fn run_listener(listener: tokio::net::TcpListener, router: axum::Router, mut shutdown_rx: watch::Receiver<bool>) {
	let shutdown = async move {
		let _ = shutdown_rx.wait_for(|stop| *stop).await;
	};
	if let Err(err) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
		tracing::error!(%err, "listener error");
	}
}

async fn wait_for_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};

	#[cfg(unix)]
	{
		let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(sigterm) => sigterm,
			Err(_) => return ctrl_c.await,
		};
		tokio::select! {
			_ = ctrl_c => (),
			_ = sigterm.recv() => (),
		}
	}

	#[cfg(not(unix))]
	ctrl_c.await;
}
