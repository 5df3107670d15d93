#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lurker_domain::StreamerHandle;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::listener::ListenerState;

/// Process-wide registry of in-memory listeners, keyed by streamer handle.
///
/// The registry lock is only ever held while mutating the map; per-listener
/// state has its own lock, acquired strictly after this one.
#[derive(Default)]
pub struct ListenerManager {
	registry: RwLock<HashMap<StreamerHandle, Arc<ListenerState>>>,
}

impl ListenerManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, handle: &StreamerHandle) -> Option<Arc<ListenerState>> {
		self.registry.read().get(handle).cloned()
	}

	/// Insert unconditionally, replacing (and stopping) any previous entry.
	pub fn add(&self, handle: StreamerHandle, state: Arc<ListenerState>) {
		let previous = self.registry.write().insert(handle, state);
		if let Some(previous) = previous {
			previous.signal_stop();
		}
	}

	/// Insert only when the handle is vacant; otherwise hand back the
	/// occupant so the caller can attach to it instead.
	pub fn insert_if_absent(&self, handle: StreamerHandle, state: Arc<ListenerState>) -> Result<(), Arc<ListenerState>> {
		let mut registry = self.registry.write();
		if let Some(existing) = registry.get(&handle) {
			return Err(Arc::clone(existing));
		}
		registry.insert(handle, state);
		Ok(())
	}

	/// Swap `expected` for `fresh` atomically. Fails with the current
	/// occupant when the entry changed (or vanished) since it was observed.
	pub fn replace_if_same(
		&self,
		handle: &StreamerHandle,
		expected: &Arc<ListenerState>,
		fresh: Arc<ListenerState>,
	) -> Result<(), Option<Arc<ListenerState>>> {
		let mut registry = self.registry.write();
		match registry.get(handle) {
			Some(current) if Arc::ptr_eq(current, expected) => {
				let old = registry.insert(handle.clone(), fresh);
				drop(registry);
				if let Some(old) = old {
					old.signal_stop();
				}
				Ok(())
			}
			other => Err(other.cloned()),
		}
	}

	/// Remove an entry, signalling its stop channel. Idempotent: removing a
	/// missing handle (or one whose stop already fired) is a no-op.
	pub fn remove(&self, handle: &StreamerHandle) -> bool {
		let removed = self.registry.write().remove(handle);
		match removed {
			Some(state) => {
				state.signal_stop();
				debug!(streamer = %handle, "listener removed from registry");
				true
			}
			None => false,
		}
	}

	/// Remove an entry only if it still is the given state. Supervisors use
	/// this on termination so they never evict a replacement listener.
	pub fn remove_if_same(&self, handle: &StreamerHandle, state: &Arc<ListenerState>) -> bool {
		let mut registry = self.registry.write();
		match registry.get(handle) {
			Some(current) if Arc::ptr_eq(current, state) => {
				registry.remove(handle);
				drop(registry);
				state.signal_stop();
				true
			}
			_ => false,
		}
	}

	pub fn len(&self) -> usize {
		self.registry.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.registry.read().is_empty()
	}

	pub fn active_count(&self) -> usize {
		self.registry.read().values().filter(|state| state.is_active()).count()
	}

	pub fn handles(&self) -> Vec<StreamerHandle> {
		self.registry.read().keys().cloned().collect()
	}

	/// Signal every listener's stop channel (process shutdown).
	pub fn shutdown_all(&self) {
		let states: Vec<Arc<ListenerState>> = self.registry.read().values().cloned().collect();
		for state in states {
			state.signal_stop();
		}
	}

	/// One sweep pass: prune expired interests everywhere, then drop entries
	/// that are inactive with nothing left to wait for. Returns the handles
	/// that were removed.
	pub fn cleanup_sweep(&self, now: DateTime<Utc>) -> Vec<StreamerHandle> {
		let snapshot: Vec<(StreamerHandle, Arc<ListenerState>)> = self
			.registry
			.read()
			.iter()
			.map(|(handle, state)| (handle.clone(), Arc::clone(state)))
			.collect();

		let mut candidates = Vec::new();
		for (handle, state) in snapshot {
			state.remove_expired_interests(now);
			if !state.has_active_interests(now) && !state.is_active() {
				candidates.push((handle, state));
			}
		}

		let mut removed = Vec::new();
		let mut registry = self.registry.write();
		for (handle, state) in candidates {
			// Re-check under the write lock; a listen call may have revived it.
			let still_dead = registry
				.get(&handle)
				.map(|current| Arc::ptr_eq(current, &state) && !state.has_active_interests(now) && !state.is_active())
				.unwrap_or(false);
			if still_dead {
				registry.remove(&handle);
				state.signal_stop();
				removed.push(handle);
			}
		}
		drop(registry);

		if !removed.is_empty() {
			info!(count = removed.len(), "cleanup sweep removed expired listeners");
		}
		removed
	}
}

/// Run the periodic cleanup sweep until the task is aborted.
pub fn spawn_sweeper(manager: Arc<ListenerManager>, period: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			manager.cleanup_sweep(Utc::now());
			metrics::gauge!("lurker_engine_listeners").set(manager.len() as f64);
			metrics::gauge!("lurker_engine_active_listeners").set(manager.active_count() as f64);
		}
	})
}
