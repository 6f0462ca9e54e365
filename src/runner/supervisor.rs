//! The supervisor owns runner lifecycles: on-demand launch, readiness,
//! model swapping, and teardown.
//!
//! Mutual exclusion is per port slot. Models with a pinned port get their own
//! slot; everything else shares the dynamic-port slot, so requesting a
//! different model there swaps the current occupant out. Concurrent requests
//! for the same cold model coalesce into a single launch, and every waiter of
//! that launch observes the same outcome.
//!
//! Swaps run in detached driver tasks. The requesting task only waits on the
//! outcome channel, so a dropped client connection never aborts a swap
//! halfway through.

use crate::config::{Catalog, Config, ModelSpec, TimeoutsConfig};
use crate::runner::{probe, Instance};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

// region:    --- Types

/// Unit of mutual exclusion for runner processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
	/// The dynamic-port pool. One occupant at a time.
	Shared,
	/// A pinned port, independent from other slots.
	Fixed(u16),
}

impl SlotKey {
	pub fn for_spec(spec: &ModelSpec) -> SlotKey {
		match spec.fixed_port {
			Some(port) => SlotKey::Fixed(port),
			None => SlotKey::Shared,
		}
	}
}

/// Where a ready runner can be reached.
#[derive(Debug, Clone)]
pub struct Endpoint {
	pub base_url: String,
	pub pid: u32,
	pub port: u16,
}

/// Read-only snapshot of one live runner.
#[derive(Debug, Clone)]
pub struct RunnerStatus {
	pub model_name: String,
	pub public_id: String,
	pub pid: u32,
	pub port: u16,
	pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
enum SwapOutcome {
	Ready(Endpoint),
	Failed(SwapFailure),
}

/// Cloneable failure record, so one failed attempt can be reported to every
/// task that waited on it.
#[derive(Debug, Clone)]
enum SwapFailure {
	Launch { model: String, reason: String },
	HealthTimeout { model: String, waited_secs: u64 },
}

impl SwapFailure {
	fn from_error(model: &str, err: &Error) -> SwapFailure {
		match err {
			Error::HealthCheckTimeout { waited_secs, .. } => SwapFailure::HealthTimeout {
				model: model.to_string(),
				waited_secs: *waited_secs,
			},
			other => SwapFailure::Launch {
				model: model.to_string(),
				reason: other.to_string(),
			},
		}
	}

	fn into_error(self) -> Error {
		match self {
			SwapFailure::Launch { model, reason } => Error::LaunchFailure { model, reason },
			SwapFailure::HealthTimeout { model, waited_secs } => Error::HealthCheckTimeout { model, waited_secs },
		}
	}
}

#[derive(Debug, Clone)]
struct PendingSwap {
	model_name: String,
	rx: watch::Receiver<Option<SwapOutcome>>,
}

#[derive(Debug, Default)]
struct SlotState {
	current: Option<Arc<Instance>>,
	pending: Option<PendingSwap>,
}

#[derive(Debug, Default)]
struct Slot {
	// Serializes swap drivers. Never held across request proxying.
	swap_lock: tokio::sync::Mutex<()>,
	state: RwLock<SlotState>,
}

// endregion: --- Types

// region:    --- Supervisor

#[derive(Debug)]
pub struct Supervisor {
	catalog: Catalog,
	timeouts: TimeoutsConfig,
	client: reqwest::Client,
	slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
}

impl Supervisor {
	pub fn new(catalog: Catalog, timeouts: TimeoutsConfig) -> Self {
		Supervisor {
			catalog,
			timeouts,
			client: reqwest::Client::new(),
			slots: Mutex::new(HashMap::new()),
		}
	}

	pub fn from_config(config: &Config) -> Self {
		Self::new(config.catalog.clone(), config.timeouts.clone())
	}

	pub fn catalog(&self) -> &Catalog {
		&self.catalog
	}

	/// Ensure a ready runner for `name_or_id` and return its endpoint.
	///
	/// Swaps out the slot's current occupant when it serves a different model.
	pub async fn acquire(&self, name_or_id: &str) -> Result<Endpoint> {
		let spec = self
			.catalog
			.resolve(name_or_id)
			.cloned()
			.ok_or_else(|| Error::UnknownModel {
				model: name_or_id.to_string(),
			})?;
		let slot = self.slot_for(SlotKey::for_spec(&spec));

		loop {
			// Ready instance, or an in-flight swap toward our model to join.
			let join_rx = {
				let state = slot.state.read().await;
				if let Some(endpoint) = ready_endpoint(&state, &spec) {
					return Ok(endpoint);
				}
				state
					.pending
					.as_ref()
					.filter(|pending| pending.model_name == spec.name)
					.map(|pending| pending.rx.clone())
			};

			let mut rx = match join_rx {
				Some(rx) => rx,
				// Publish the pending record and start a driver, atomically
				// against other requesters.
				None => {
					let mut state = slot.state.write().await;
					if let Some(endpoint) = ready_endpoint(&state, &spec) {
						return Ok(endpoint);
					}
					match state
						.pending
						.as_ref()
						.filter(|pending| pending.model_name == spec.name)
						.map(|pending| pending.rx.clone())
					{
						Some(rx) => rx,
						None => {
							let (tx, rx) = watch::channel(None);
							state.pending = Some(PendingSwap {
								model_name: spec.name.clone(),
								rx: rx.clone(),
							});
							self.spawn_swap(slot.clone(), spec.clone(), tx, rx.clone());
							rx
						}
					}
				}
			};

			// Clone out of the watch guard first; the failure arm needs `rx` back.
			let waited = rx.wait_for(|outcome| outcome.is_some()).await.map(|outcome| (*outcome).clone());

			match waited {
				Ok(Some(SwapOutcome::Ready(endpoint))) => return Ok(endpoint),
				Ok(Some(SwapOutcome::Failed(failure))) => return Err(failure.into_error()),
				Ok(None) => continue,
				// Driver gone without publishing. Clear its stale pending
				// record so the next pass can start fresh.
				Err(_) => {
					let mut state = slot.state.write().await;
					if state.pending.as_ref().is_some_and(|p| p.rx.same_channel(&rx)) {
						state.pending = None;
					}
					continue;
				}
			}
		}
	}

	/// Detached swap driver. Runs to completion even when every requester has
	/// gone away.
	fn spawn_swap(
		&self,
		slot: Arc<Slot>,
		spec: Arc<ModelSpec>,
		tx: watch::Sender<Option<SwapOutcome>>,
		my_rx: watch::Receiver<Option<SwapOutcome>>,
	) {
		let client = self.client.clone();
		let timeouts = self.timeouts.clone();

		tokio::spawn(async move {
			let _guard = slot.swap_lock.lock().await;

			// Another driver may have finished the same swap while we waited
			// for the lock.
			{
				let mut state = slot.state.write().await;
				if let Some(endpoint) = ready_endpoint(&state, &spec) {
					clear_own_pending(&mut state, &my_rx);
					let _ = tx.send(Some(SwapOutcome::Ready(endpoint)));
					return;
				}
			}

			let result = perform_swap(&client, &timeouts, &slot, &spec).await;

			{
				let mut state = slot.state.write().await;
				clear_own_pending(&mut state, &my_rx);
			}

			let outcome = match result {
				Ok(endpoint) => SwapOutcome::Ready(endpoint),
				Err(err) => {
					warn!(model = %spec.name, %err, "swap failed");
					SwapOutcome::Failed(SwapFailure::from_error(&spec.name, &err))
				}
			};
			let _ = tx.send(Some(outcome));
		});
	}

	/// Stop every tracked runner. Idempotent.
	///
	/// Takes every slot's swap lock, so an in-flight swap finishes (and its
	/// fresh instance gets swept here) rather than committing behind the
	/// sweep. The locks stay held until termination is done.
	pub async fn shutdown_all(&self) {
		let slots = self.snapshot_slots();

		let mut guards = Vec::new();
		let mut instances = Vec::new();
		for slot in &slots {
			let guard = slot.swap_lock.lock().await;
			let mut state = slot.state.write().await;
			if let Some(instance) = state.current.take() {
				instances.push(instance);
			}
			guards.push(guard);
		}

		if instances.is_empty() {
			return;
		}

		info!(count = instances.len(), "shutting down all runners");
		let grace = self.timeouts.stop_grace();
		futures::future::join_all(instances.iter().map(|instance| instance.terminate(grace))).await;
	}

	/// Snapshot of the live runners.
	pub async fn status(&self) -> Vec<RunnerStatus> {
		let mut statuses = Vec::new();
		for slot in self.snapshot_slots() {
			let state = slot.state.read().await;
			if let Some(instance) = &state.current {
				if instance.is_alive() {
					statuses.push(RunnerStatus {
						model_name: instance.model_name.clone(),
						public_id: instance.public_id.clone(),
						pid: instance.pid,
						port: instance.port,
						uptime_secs: instance.uptime().as_secs(),
					});
				}
			}
		}
		statuses
	}

	fn slot_for(&self, key: SlotKey) -> Arc<Slot> {
		let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		slots.entry(key).or_default().clone()
	}

	fn snapshot_slots(&self) -> Vec<Arc<Slot>> {
		let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		slots.values().cloned().collect()
	}
}

/// Drain the slot occupant, then launch and probe the new model.
/// Caller must hold the slot's swap lock.
async fn perform_swap(
	client: &reqwest::Client,
	timeouts: &TimeoutsConfig,
	slot: &Slot,
	spec: &ModelSpec,
) -> Result<Endpoint> {
	let old = {
		let mut state = slot.state.write().await;
		state.current.take()
	};
	if let Some(old) = old {
		if old.is_alive() {
			info!(from = %old.model_name, to = %spec.name, "swapping runner");
		}
		old.terminate(timeouts.stop_grace()).await;
	}

	let port = match spec.fixed_port {
		Some(port) => port,
		None => alloc_dynamic_port()?,
	};

	let instance = Arc::new(Instance::spawn(spec, port)?);

	match probe::wait_until_ready(client, &instance, timeouts.startup(), timeouts.health_poll()).await {
		Ok(()) => {
			let endpoint = Endpoint {
				base_url: instance.endpoint(),
				pid: instance.pid,
				port: instance.port,
			};
			slot.state.write().await.current = Some(instance);
			Ok(endpoint)
		}
		Err(err) => {
			warn!(model = %spec.name, %err, "runner failed to become ready");
			instance.terminate(timeouts.stop_grace()).await;
			Err(err)
		}
	}
}

fn clear_own_pending(state: &mut SlotState, my_rx: &watch::Receiver<Option<SwapOutcome>>) {
	if state.pending.as_ref().is_some_and(|p| p.rx.same_channel(my_rx)) {
		state.pending = None;
	}
}

fn ready_endpoint(state: &SlotState, spec: &ModelSpec) -> Option<Endpoint> {
	let instance = state.current.as_ref()?;
	if instance.model_name == spec.name && instance.is_alive() {
		Some(Endpoint {
			base_url: instance.endpoint(),
			pid: instance.pid,
			port: instance.port,
		})
	} else {
		None
	}
}

/// Reserve an ephemeral port by binding to port 0 and releasing it.
fn alloc_dynamic_port() -> Result<u16> {
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
	Ok(listener.local_addr()?.port())
}

// endregion: --- Supervisor

// region:    --- Tests

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	#[test]
	fn test_slot_key_derivation() {
		let config = Config::from_json_str(
			r#"{ "models": {
				"pinned": { "model_path": "/a.gguf", "port": 9001 },
				"floating": { "model_path": "/b.gguf" }
			} }"#,
		)
		.unwrap();

		let pinned = config.catalog.resolve("pinned").unwrap();
		let floating = config.catalog.resolve("floating").unwrap();
		assert_eq!(SlotKey::for_spec(pinned), SlotKey::Fixed(9001));
		assert_eq!(SlotKey::for_spec(floating), SlotKey::Shared);
	}

	#[test]
	fn test_alloc_dynamic_port() {
		let port = alloc_dynamic_port().unwrap();
		assert!(port > 0);
	}

	#[tokio::test]
	async fn test_acquire_unknown_model() {
		let config = Config::from_json_str(r#"{ "models": {} }"#).unwrap();
		let supervisor = Supervisor::from_config(&config);

		let res = supervisor.acquire("no-such-model").await;
		assert!(matches!(res, Err(Error::UnknownModel { .. })));
		assert!(supervisor.status().await.is_empty());
	}
}

// endregion: --- Tests
