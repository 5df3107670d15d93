#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lurker_domain::{ListenerId, UserId};
use lurker_kick::TransportError;
use lurker_storage::ListenerRepository as _;

use crate::listener::ListenerState;
use crate::testutil::{
	CHAT_FRAME, EmptyBehavior, EngineFixture, FixedResolver, ScriptedTransport, fixture, handle, test_config, wait_until,
};

const WAIT: Duration = Duration::from_secs(3);

async fn seeded_listener(fx: &EngineFixture, name: &str, user: UserId) -> (Arc<ListenerState>, ListenerId) {
	let now = Utc::now();
	let end = now + chrono::Duration::hours(1);

	let streamer_id = fx
		.repo
		.upsert_streamer(&handle(name), None, None)
		.await
		.expect("seed streamer");
	let listener_id = fx
		.repo
		.upsert_listener(streamer_id, user, end, 3600, true)
		.await
		.expect("seed listener");

	let state = Arc::new(ListenerState::new(handle(name), listener_id, end, 16));
	state.add_interest(user, end);
	fx.manager.add(handle(name), Arc::clone(&state));

	(state, listener_id)
}

#[tokio::test]
async fn subscribes_then_streams_messages_into_storage() {
	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let tx = transport.push_connection();
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(196));

	let (state, listener_id) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	assert!(wait_until(WAIT, || transport.writes().len() == 1).await, "no subscribe frame");
	assert_eq!(
		transport.writes()[0],
		"{\"event\":\"pusher:subscribe\",\"data\":{\"auth\":\"\",\"channel\":\"chatrooms.196.v2\"}}"
	);

	tx.send(Ok(CHAT_FRAME.to_string())).expect("feed frame");

	assert!(wait_until(WAIT, || fx.repo.messages().len() == 1).await, "message not persisted");
	let message = &fx.repo.messages()[0];
	assert_eq!(message.listener_id, listener_id);
	assert_eq!(message.sender, "u");
	assert_eq!(message.content, "hello https://a.b");
	assert!(message.has_link);
	assert_eq!(message.links, vec!["https://a.b".to_string()]);

	state.signal_stop();
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor exits").expect("join");
}

#[tokio::test]
async fn stop_signal_terminates_and_deregisters() {
	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let _tx = transport.push_connection();
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(1));

	let (state, listener_id) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	assert!(wait_until(WAIT, || state.is_active()).await, "supervisor never started");

	// Manager removal closes the stop channel; the supervisor must notice.
	fx.manager.remove(&handle("s1"));
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor exits").expect("join");

	assert_eq!(fx.repo.listener_is_active(listener_id), Some(false));
	assert!(fx.manager.get(&handle("s1")).is_none());
	assert!(!state.is_active());
}

#[tokio::test]
async fn abnormal_close_reconnects_and_resubscribes() {
	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let first = transport.push_connection();
	transport.push_failure();
	let _second = transport.push_connection();
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(42));

	let (state, _) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	assert!(wait_until(WAIT, || transport.writes().len() == 1).await, "no first subscribe");

	first
		.send(Err(TransportError::ReadClosedAbnormal("connection reset".to_string())))
		.expect("feed error");

	assert!(wait_until(WAIT, || transport.writes().len() == 2).await, "no resubscribe");
	assert_eq!(transport.connect_count(), 3);
	// A successful session resets the budget.
	assert!(wait_until(WAIT, || state.reconnect_attempts() == 0).await);

	state.signal_stop();
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor exits").expect("join");
}

#[tokio::test]
async fn reconnect_budget_exhaustion_terminates() {
	let transport = ScriptedTransport::new(EmptyBehavior::Fail);
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(42));

	let (state, listener_id) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor gives up").expect("join");

	// max_reconnect_attempts = 3: two retries after the initial failure.
	assert_eq!(transport.connect_count(), 3);
	assert_eq!(fx.repo.listener_is_active(listener_id), Some(false));
	assert!(fx.manager.get(&handle("s1")).is_none());
}

#[tokio::test]
async fn normal_close_ends_the_supervisor_cleanly() {
	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let tx = transport.push_connection();
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(7));

	let (state, listener_id) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	assert!(wait_until(WAIT, || transport.writes().len() == 1).await, "no subscribe");

	tx.send(Ok(CHAT_FRAME.to_string())).expect("feed frame");
	assert!(wait_until(WAIT, || fx.repo.messages().len() == 1).await, "message not persisted");

	tx.send(Err(TransportError::ReadClosedNormal)).expect("feed close");
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor exits").expect("join");

	// Graceful close is not a reconnect case.
	assert_eq!(transport.connect_count(), 1);
	assert_eq!(fx.repo.listener_is_active(listener_id), Some(false));
	assert!(fx.manager.get(&handle("s1")).is_none());
}

#[tokio::test]
async fn frame_bursts_never_block_the_reader() {
	let mut cfg = test_config();
	cfg.inbound_buffer_size = 4;

	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let tx = transport.push_connection();
	let fx = fixture(cfg, Arc::clone(&transport), FixedResolver::chatroom(9));

	let (state, _) = seeded_listener(&fx, "s1", UserId::new_v4()).await;
	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));

	assert!(wait_until(WAIT, || transport.writes().len() == 1).await, "no subscribe");

	// Far more frames than the buffer holds; overflow is dropped, never queued.
	for _ in 0..200 {
		tx.send(Ok(CHAT_FRAME.to_string())).expect("feed frame");
	}

	assert!(wait_until(WAIT, || !fx.repo.messages().is_empty()).await, "nothing persisted");
	assert!(fx.repo.messages().len() <= 200);

	state.signal_stop();
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor survives burst").expect("join");
}

#[tokio::test]
async fn elapsed_window_terminates_via_tick() {
	let transport = ScriptedTransport::new(EmptyBehavior::Pend);
	let _tx = transport.push_connection();
	let fx = fixture(test_config(), Arc::clone(&transport), FixedResolver::chatroom(3));

	let user = UserId::new_v4();
	let now = Utc::now();
	let end = now + chrono::Duration::milliseconds(250);

	let streamer_id = fx
		.repo
		.upsert_streamer(&handle("s1"), None, None)
		.await
		.expect("seed streamer");
	let listener_id = fx
		.repo
		.upsert_listener(streamer_id, user, end, 1, true)
		.await
		.expect("seed listener");

	let state = Arc::new(ListenerState::new(handle("s1"), listener_id, end, 16));
	state.add_interest(user, end);
	fx.manager.add(handle("s1"), Arc::clone(&state));

	let supervisor = fx.service.spawn_supervisor(Arc::clone(&state));
	tokio::time::timeout(WAIT, supervisor).await.expect("supervisor expires").expect("join");

	assert_eq!(fx.repo.listener_is_active(listener_id), Some(false));
	assert!(fx.manager.get(&handle("s1")).is_none());
}
