#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lurker_domain::{Interest, StreamerHandle};
use lurker_storage::{ActiveListener, ListenerRepository as _};
use tracing::{info, warn};

use crate::listener::ListenerState;
use crate::service::{ListenError, ListenService};

/// What startup recovery did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Listeners rebuilt and handed a supervisor.
	pub restarted: usize,

	/// Durable rows flipped inactive because their end time had passed.
	pub deactivated: usize,

	/// Per-listener failures; recovery never aborts on one bad row.
	pub errors: Vec<(StreamerHandle, String)>,
}

impl ListenService {
	/// Rebuild in-memory listeners from durable state after a restart.
	///
	/// Durable rows are per `(streamer, user)`; all rows for one handle merge
	/// into a single in-memory listener whose aggregate end time is the max
	/// of the stored end times and every still-live interest.
	pub async fn recover_active_listeners(&self) -> Result<RecoveryReport, ListenError> {
		let rows = self.with_deadline(self.repo.list_active_listeners()).await?;
		let now = Utc::now();

		let mut report = RecoveryReport::default();
		let mut live_by_handle: HashMap<StreamerHandle, Vec<ActiveListener>> = HashMap::new();

		for row in rows {
			let expired = match row.end_time {
				Some(end) => end <= now,
				None => true,
			};

			if expired {
				info!(streamer = %row.handle, listener_id = %row.listener_id, "deactivating expired listener row");
				match self.with_deadline(self.repo.update_listener_status(row.listener_id, false)).await {
					Ok(()) => report.deactivated += 1,
					Err(err) => report.errors.push((row.handle.clone(), err.to_string())),
				}
				continue;
			}

			live_by_handle.entry(row.handle.clone()).or_default().push(row);
		}

		let recoveries = live_by_handle
			.into_iter()
			.map(|(handle, rows)| self.recover_one(handle, rows));
		for outcome in futures_util::future::join_all(recoveries).await {
			match outcome {
				Ok(()) => report.restarted += 1,
				Err((handle, reason)) => report.errors.push((handle, reason)),
			}
		}

		info!(
			restarted = report.restarted,
			deactivated = report.deactivated,
			errors = report.errors.len(),
			"startup recovery finished"
		);
		Ok(report)
	}

	async fn recover_one(&self, handle: StreamerHandle, rows: Vec<ActiveListener>) -> Result<(), (StreamerHandle, String)> {
		let now = Utc::now();
		let Some(primary) = rows.first() else {
			return Ok(());
		};

		let max_row_end = rows.iter().filter_map(|row| row.end_time).max().unwrap_or(now);
		let state = Arc::new(ListenerState::new(
			handle.clone(),
			primary.listener_id,
			max_row_end,
			self.cfg.inbound_buffer_size,
		));

		for row in &rows {
			match self.with_deadline(self.repo.list_interests(row.listener_id)).await {
				Ok(interests) => {
					state.import_interests(
						interests
							.into_iter()
							.filter(|interest| interest.end_time > now)
							.map(|interest| Interest::new(interest.user_id, interest.request_time, interest.end_time)),
					);
				}
				// A lost interest only narrows the window; the row end time
				// still keeps the listener alive.
				Err(err) => {
					warn!(streamer = %handle, listener_id = %row.listener_id, error = %err, "failed to load interests")
				}
			}
		}
		state.raise_aggregate_end(max_row_end);

		match self.manager.insert_if_absent(handle.clone(), Arc::clone(&state)) {
			Ok(()) => {
				info!(
					streamer = %handle,
					interests = state.interests_snapshot().len(),
					aggregate_end = %state.aggregate_end_time(),
					"restarting recovered listener"
				);
				self.spawn_supervisor(state);
				Ok(())
			}
			Err(existing) => {
				existing.import_interests(state.interests_snapshot());
				existing.raise_aggregate_end(max_row_end);
				Ok(())
			}
		}
	}
}
