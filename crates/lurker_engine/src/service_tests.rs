#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lurker_domain::{ListenerId, UserId};
use lurker_storage::ListenerRepository as _;

use crate::listener::ListenerState;
use crate::service::{ListenError, ListenOutcome};
use crate::testutil::{EmptyBehavior, EngineFixture, FixedResolver, ScriptedTransport, fixture, handle, test_config, wait_until};

const WAIT: Duration = Duration::from_secs(3);

fn pend_fixture() -> EngineFixture {
	fixture(
		test_config(),
		ScriptedTransport::new(EmptyBehavior::Pend),
		FixedResolver::chatroom(196),
	)
}

#[tokio::test]
async fn listen_starts_a_new_listener() {
	let fx = pend_fixture();
	let user = UserId::new_v4();

	let outcome = fx.service.listen(user, &handle("s1")).await.expect("listen");
	assert_eq!(outcome, ListenOutcome::Started);
	assert_eq!(outcome.message(&handle("s1")), "started listening to 's1' chat");

	let state = fx.manager.get(&handle("s1")).expect("registered");
	assert!(wait_until(WAIT, || state.is_active()).await, "supervisor never went active");
	assert_eq!(state.active_interest_count(Utc::now()), 1);
	assert_eq!(fx.repo.interest_count(), 1);
	assert_eq!(fx.repo.listener_is_active(state.listener_id()), Some(true));
}

#[tokio::test]
async fn second_user_extends_the_same_listener() {
	let fx = pend_fixture();
	let first = UserId::new_v4();
	let second = UserId::new_v4();

	fx.service.listen(first, &handle("s1")).await.expect("first listen");
	let state = fx.manager.get(&handle("s1")).expect("registered");
	let first_end = state.aggregate_end_time();

	let outcome = fx.service.listen(second, &handle("s1")).await.expect("second listen");
	assert_eq!(outcome, ListenOutcome::Extended);

	// Still one in-memory listener, now aggregating two interests.
	assert_eq!(fx.manager.len(), 1);
	assert!(Arc::ptr_eq(&fx.manager.get(&handle("s1")).expect("still there"), &state));
	assert_eq!(state.active_interest_count(Utc::now()), 2);
	assert!(state.aggregate_end_time() >= first_end);

	// The durable row follows the aggregate.
	let stored_end = fx
		.repo
		.listener_end_time(state.listener_id())
		.expect("row present")
		.expect("end set");
	assert_eq!(stored_end, state.aggregate_end_time());
}

#[tokio::test]
async fn concurrent_listens_for_one_user_leave_a_single_interest() {
	let fx = pend_fixture();
	let user = UserId::new_v4();

	let target = handle("s1");
	let (a, b) = tokio::join!(fx.service.listen(user, &target), fx.service.listen(user, &target));
	a.expect("first listen");
	b.expect("second listen");

	assert_eq!(fx.manager.len(), 1);
	let state = fx.manager.get(&handle("s1")).expect("registered");
	assert_eq!(state.active_interest_count(Utc::now()), 1);

	let snapshot = state.interests_snapshot();
	assert_eq!(snapshot.len(), 1);
	assert_eq!(snapshot[0].end_time, state.aggregate_end_time());
}

#[tokio::test]
async fn unknown_streamer_aborts_before_touching_storage() {
	let fx = fixture(
		test_config(),
		ScriptedTransport::new(EmptyBehavior::Pend),
		FixedResolver::not_found(),
	);

	let err = fx
		.service
		.listen(UserId::new_v4(), &handle("ghost"))
		.await
		.expect_err("must fail");
	assert!(matches!(err, ListenError::StreamerNotFound(_)));
	assert_eq!(fx.repo.interest_count(), 0);
	assert!(fx.manager.is_empty());
}

#[tokio::test]
async fn dormant_listener_is_resumed_with_a_fresh_state() {
	let fx = pend_fixture();
	let user = UserId::new_v4();
	let end = Utc::now() + chrono::Duration::hours(1);

	// A dormant entry: present in the registry, supervisor long gone.
	let dormant = Arc::new(ListenerState::new(handle("s1"), ListenerId::new_v4(), end, 16));
	dormant.add_interest(user, end);
	fx.manager.add(handle("s1"), Arc::clone(&dormant));

	let outcome = fx.service.listen(UserId::new_v4(), &handle("s1")).await.expect("listen");
	assert_eq!(outcome, ListenOutcome::Resumed);

	let fresh = fx.manager.get(&handle("s1")).expect("registered");
	assert!(!Arc::ptr_eq(&fresh, &dormant), "resume must allocate a fresh state");
	assert!(dormant.is_stopped(), "old stop channel must be signalled");
	// The surviving interest came along.
	assert_eq!(fresh.active_interest_count(Utc::now()), 2);
	assert!(wait_until(WAIT, || fresh.is_active()).await, "new supervisor never started");
}

#[tokio::test]
async fn stop_listener_tears_the_listener_down() {
	let fx = pend_fixture();
	fx.service.listen(UserId::new_v4(), &handle("s1")).await.expect("listen");

	fx.service.stop_listener(&handle("s1")).expect("stop");
	assert!(
		wait_until(WAIT, || fx.manager.get(&handle("s1")).is_none()).await,
		"supervisor never deregistered"
	);

	assert!(matches!(
		fx.service.stop_listener(&handle("s1")),
		Err(ListenError::NotListening(_))
	));
}

#[tokio::test]
async fn stats_reflect_the_registry() {
	let fx = pend_fixture();
	fx.service.listen(UserId::new_v4(), &handle("s1")).await.expect("listen");
	fx.service.listen(UserId::new_v4(), &handle("s2")).await.expect("listen");

	assert!(wait_until(WAIT, || fx.service.stats().active_listeners == 2).await);
	assert_eq!(fx.service.stats().total_listeners, 2);
}

#[tokio::test]
async fn recovery_rebuilds_listeners_from_durable_rows() {
	let fx = pend_fixture();
	let now = Utc::now();
	let u1 = UserId::new_v4();
	let u2 = UserId::new_v4();
	let near = now + chrono::Duration::hours(4);
	let far = now + chrono::Duration::hours(6);

	// Two (streamer, user) rows for the same handle, as the port stores them.
	let streamer_id = fx
		.repo
		.upsert_streamer(&handle("s1"), Some(7), None)
		.await
		.expect("seed streamer");
	let row1 = fx
		.repo
		.upsert_listener(streamer_id, u1, near, 4 * 3600, true)
		.await
		.expect("seed row1");
	let row2 = fx
		.repo
		.upsert_listener(streamer_id, u2, far, 6 * 3600, true)
		.await
		.expect("seed row2");
	fx.repo.insert_interest(row1, u1, now, near).await.expect("seed interest");
	fx.repo.insert_interest(row2, u2, now, far).await.expect("seed interest");

	let report = fx.service.recover_active_listeners().await.expect("recover");
	assert_eq!(report.restarted, 1);
	assert!(report.errors.is_empty());

	let state = fx.manager.get(&handle("s1")).expect("rebuilt");
	assert_eq!(state.active_interest_count(Utc::now()), 2);
	assert_eq!(state.aggregate_end_time(), far);
	assert!(wait_until(WAIT, || state.is_active()).await, "recovered supervisor never started");
}

#[tokio::test]
async fn recovery_merges_into_an_existing_entry() {
	let fx = pend_fixture();
	let now = Utc::now();
	let user = UserId::new_v4();
	let end = now + chrono::Duration::hours(2);

	let streamer_id = fx
		.repo
		.upsert_streamer(&handle("s1"), None, None)
		.await
		.expect("seed streamer");
	let row = fx
		.repo
		.upsert_listener(streamer_id, user, end, 2 * 3600, true)
		.await
		.expect("seed row");
	fx.repo.insert_interest(row, user, now, end).await.expect("seed interest");

	// Someone already listens before recovery runs.
	let pre_existing = Arc::new(ListenerState::new(handle("s1"), row, end, 16));
	fx.manager.add(handle("s1"), Arc::clone(&pre_existing));

	fx.service.recover_active_listeners().await.expect("recover");

	// No replacement happened, the interests merged in.
	let current = fx.manager.get(&handle("s1")).expect("present");
	assert!(Arc::ptr_eq(&current, &pre_existing));
	assert_eq!(current.active_interest_count(Utc::now()), 1);
	assert_eq!(fx.manager.len(), 1);
}
