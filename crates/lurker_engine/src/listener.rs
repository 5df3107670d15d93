#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lurker_domain::{ChatEvent, Interest, ListenerId, StreamerHandle, UserId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

/// In-memory state of one per-streamer listener.
///
/// Shared between the manager registry, incoming listen requests and the
/// listener's supervisor. Mutable fields sit behind the state's own lock,
/// which is never held across an await; the supervisor exclusively owns the
/// receive end of the inbound channel.
#[derive(Debug)]
pub struct ListenerState {
	handle: StreamerHandle,
	inner: RwLock<Inner>,
	events_tx: mpsc::Sender<ChatEvent>,
	events_rx: Mutex<Option<mpsc::Receiver<ChatEvent>>>,
	stop_tx: watch::Sender<bool>,
	stop_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Inner {
	listener_id: ListenerId,
	interests: HashMap<UserId, Interest>,
	aggregate_end: DateTime<Utc>,
	is_active: bool,
	reconnect_attempts: u32,
	last_activity: DateTime<Utc>,
}

impl ListenerState {
	pub fn new(handle: StreamerHandle, listener_id: ListenerId, aggregate_end: DateTime<Utc>, buffer: usize) -> Self {
		let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
		let (stop_tx, stop_rx) = watch::channel(false);

		Self {
			handle,
			inner: RwLock::new(Inner {
				listener_id,
				interests: HashMap::new(),
				aggregate_end,
				is_active: false,
				reconnect_attempts: 0,
				last_activity: Utc::now(),
			}),
			events_tx,
			events_rx: Mutex::new(Some(events_rx)),
			stop_tx,
			stop_rx,
		}
	}

	pub fn handle(&self) -> &StreamerHandle {
		&self.handle
	}

	pub fn listener_id(&self) -> ListenerId {
		self.inner.read().listener_id
	}

	pub fn set_active(&self, active: bool) {
		let mut inner = self.inner.write();
		inner.is_active = active;
		inner.last_activity = Utc::now();
	}

	pub fn is_active(&self) -> bool {
		self.inner.read().is_active
	}

	/// Attach (or replace) one user's interest and raise the aggregate end
	/// time to the later of the current and new values. Re-adding for the
	/// same user keeps the later end time, so racing requests converge.
	pub fn add_interest(&self, user_id: UserId, end_time: DateTime<Utc>) {
		let now = Utc::now();
		let mut inner = self.inner.write();
		let end = match inner.interests.get(&user_id) {
			Some(existing) if existing.end_time > end_time => existing.end_time,
			_ => end_time,
		};
		inner.interests.insert(user_id, Interest::new(user_id, now, end));
		if end > inner.aggregate_end {
			inner.aggregate_end = end;
		}
		inner.last_activity = now;
	}

	/// Merge already-built interests (recovery, resume), keeping the later
	/// end time per user and raising the aggregate end accordingly.
	pub fn import_interests(&self, interests: impl IntoIterator<Item = Interest>) {
		let mut inner = self.inner.write();
		for interest in interests {
			let entry = inner
				.interests
				.entry(interest.user_id)
				.and_modify(|existing| {
					if interest.end_time > existing.end_time {
						*existing = interest;
					}
				})
				.or_insert(interest);
			let end = entry.end_time;
			if end > inner.aggregate_end {
				inner.aggregate_end = end;
			}
		}
	}

	/// Drop interests whose end time passed; returns how many were removed.
	pub fn remove_expired_interests(&self, now: DateTime<Utc>) -> usize {
		let mut inner = self.inner.write();
		let before = inner.interests.len();
		inner.interests.retain(|_, interest| interest.is_active(now));
		before - inner.interests.len()
	}

	pub fn has_active_interests(&self, now: DateTime<Utc>) -> bool {
		self.inner.read().interests.values().any(|i| i.is_active(now))
	}

	pub fn active_interest_count(&self, now: DateTime<Utc>) -> usize {
		self.inner.read().interests.values().filter(|i| i.is_active(now)).count()
	}

	pub fn interests_snapshot(&self) -> Vec<Interest> {
		self.inner.read().interests.values().copied().collect()
	}

	pub fn aggregate_end_time(&self) -> DateTime<Utc> {
		self.inner.read().aggregate_end
	}

	/// Raise the aggregate end time without touching the interest map.
	pub fn raise_aggregate_end(&self, end_time: DateTime<Utc>) {
		let mut inner = self.inner.write();
		if end_time > inner.aggregate_end {
			inner.aggregate_end = end_time;
		}
	}

	/// Increment the reconnect counter and return the new value.
	pub fn increment_reconnect(&self) -> u32 {
		let mut inner = self.inner.write();
		inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
		inner.reconnect_attempts
	}

	pub fn reset_reconnect(&self) {
		self.inner.write().reconnect_attempts = 0;
	}

	pub fn reconnect_attempts(&self) -> u32 {
		self.inner.read().reconnect_attempts
	}

	/// Record activity on the listener (a streamed message).
	pub fn touch(&self) {
		self.inner.write().last_activity = Utc::now();
	}

	pub fn last_activity(&self) -> DateTime<Utc> {
		self.inner.read().last_activity
	}

	/// Sender side of the inbound channel; decode tasks must only ever
	/// `try_send` on it.
	pub fn events_sender(&self) -> mpsc::Sender<ChatEvent> {
		self.events_tx.clone()
	}

	/// Receive side of the inbound channel; yields once, to the supervisor.
	pub fn take_events_rx(&self) -> Option<mpsc::Receiver<ChatEvent>> {
		self.events_rx.lock().take()
	}

	pub fn stop_rx(&self) -> watch::Receiver<bool> {
		self.stop_rx.clone()
	}

	/// Flip the stop signal. Returns `true` only for the call that actually
	/// flipped it, so stopping is observable exactly once.
	pub fn signal_stop(&self) -> bool {
		self.stop_tx.send_if_modified(|stopped| {
			if *stopped {
				false
			} else {
				*stopped = true;
				true
			}
		})
	}

	pub fn is_stopped(&self) -> bool {
		*self.stop_rx.borrow()
	}
}
