use chrono::Duration as ChronoDuration;
use std::time::Duration;

use agenthub::session_store::{
    MessageRole, SessionStatus, SessionStore, SessionStoreError,
};

fn store() -> SessionStore {
    SessionStore::open_in_memory(ChronoDuration::hours(24), 30).unwrap()
}

#[test]
fn create_and_get_session() {
    let store = store();
    let id = store.create_session("alice").unwrap();

    let snapshot = store.get_session(&id).unwrap();
    assert_eq!(snapshot.meta.user_id, "alice");
    assert_eq!(snapshot.meta.status, SessionStatus::Active);
    assert!(snapshot.history.is_empty());
    assert!(snapshot.invocations.is_empty());
    assert!(snapshot.context.is_none());
}

#[test]
fn get_unknown_session_is_not_found() {
    let store = store();
    assert!(matches!(
        store.get_session("nope"),
        Err(SessionStoreError::NotFound(_))
    ));
}

#[test]
fn seq_is_monotonic_and_history_ordered() {
    let store = store();
    let id = store.create_session("alice").unwrap();

    let s1 = store
        .append_message(&id, MessageRole::User, "first")
        .unwrap();
    let s2 = store
        .append_message(&id, MessageRole::Assistant, "second")
        .unwrap();
    let s3 = store
        .append_message(&id, MessageRole::User, "third")
        .unwrap();
    assert_eq!((s1, s2, s3), (1, 2, 3));

    let snapshot = store.get_session(&id).unwrap();
    let contents: Vec<&str> = snapshot.history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
    assert_eq!(snapshot.history[1].role, MessageRole::Assistant);
}

#[test]
fn append_bumps_updated_at() {
    let store = store();
    let id = store.create_session("alice").unwrap();
    let before = store.get_session(&id).unwrap().meta.updated_at;

    std::thread::sleep(Duration::from_millis(5));
    store.append_message(&id, MessageRole::User, "hi").unwrap();

    let after = store.get_session(&id).unwrap().meta.updated_at;
    assert!(after > before);
}

#[test]
fn record_invocation_updates_context() {
    let store = store();
    let id = store.create_session("alice").unwrap();

    store
        .record_invocation(
            &id,
            "TicketsAgent",
            "show alice's tickets",
            Some("3 open tickets"),
            true,
            None,
            120,
        )
        .unwrap();
    store
        .record_invocation(
            &id,
            "FinOpsAgent",
            "show alice's costs",
            None,
            false,
            Some("timeout"),
            30000,
        )
        .unwrap();

    let snapshot = store.get_session(&id).unwrap();
    assert_eq!(snapshot.invocations.len(), 2);
    assert!(snapshot.invocations[0].success);
    assert_eq!(
        snapshot.invocations[1].error_message.as_deref(),
        Some("timeout")
    );

    // Context reflects the most recent dispatch.
    let context = snapshot.context.unwrap();
    assert_eq!(context.last_agent_called.as_deref(), Some("FinOpsAgent"));
    assert_eq!(context.last_query.as_deref(), Some("show alice's costs"));
}

#[test]
fn delete_cascades_to_history_invocations_and_context() {
    let store = store();
    let id = store.create_session("alice").unwrap();
    store.append_message(&id, MessageRole::User, "hi").unwrap();
    store
        .record_invocation(&id, "TicketsAgent", "q", Some("r"), true, None, 10)
        .unwrap();

    store.delete(&id).unwrap();
    assert!(matches!(
        store.get_session(&id),
        Err(SessionStoreError::NotFound(_))
    ));

    // Orphaned invocations would show up under the agent view.
    assert!(store.invocations_for_agent("TicketsAgent", 10).unwrap().is_empty());
}

#[test]
fn active_session_is_resumed_inside_the_window() {
    let store = store();
    let id = store.create_session("alice").unwrap();
    store.append_message(&id, MessageRole::User, "hi").unwrap();

    let resumed = store.active_session_for_user("alice").unwrap();
    assert_eq!(resumed.as_deref(), Some(id.as_str()));

    // A different user sees nothing.
    assert!(store.active_session_for_user("bob").unwrap().is_none());
}

#[test]
fn session_outside_the_window_is_not_resumed() {
    // Millisecond window so the boundary is crossed by a short sleep.
    let store = SessionStore::open_in_memory(ChronoDuration::milliseconds(40), 30).unwrap();
    let id = store.create_session("alice").unwrap();

    std::thread::sleep(Duration::from_millis(80));
    assert!(store.active_session_for_user("alice").unwrap().is_none());

    // History is preserved and still queryable by id.
    assert_eq!(store.get_session(&id).unwrap().meta.user_id, "alice");
}

#[test]
fn completed_sessions_are_not_resumed() {
    let store = store();
    let id = store.create_session("alice").unwrap();
    store.set_status(&id, SessionStatus::Completed).unwrap();

    assert!(store.active_session_for_user("alice").unwrap().is_none());
}

#[test]
fn most_recent_active_session_wins() {
    let store = store();
    let first = store.create_session("alice").unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let second = store.create_session("alice").unwrap();
    std::thread::sleep(Duration::from_millis(5));

    // Touch the first so it becomes the most recently updated.
    store
        .append_message(&first, MessageRole::User, "back here")
        .unwrap();

    let resumed = store.active_session_for_user("alice").unwrap();
    assert_eq!(resumed.as_deref(), Some(first.as_str()));
    let _ = second;
}

#[test]
fn set_status_round_trips() {
    let store = store();
    let id = store.create_session("alice").unwrap();

    store.set_status(&id, SessionStatus::Expired).unwrap();
    assert_eq!(
        store.get_session(&id).unwrap().meta.status,
        SessionStatus::Expired
    );

    assert!(matches!(
        store.set_status("nope", SessionStatus::Active),
        Err(SessionStoreError::NotFound(_))
    ));
}

#[test]
fn cleanup_removes_old_completed_sessions() {
    // ttl 0: any completed session qualifies immediately.
    let store = store();
    let completed = store.create_session("alice").unwrap();
    store
        .set_status(&completed, SessionStatus::Completed)
        .unwrap();
    let active = store.create_session("alice").unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let (removed_completed, _) = store.cleanup(0).unwrap();
    assert_eq!(removed_completed, 1);

    assert!(store.get_session(&completed).is_err());
    assert!(store.get_session(&active).is_ok());
}

#[test]
fn hard_expiry_removes_any_old_session() {
    // Hard expiry of 0 days: everything older than "now" is swept.
    let store = SessionStore::open_in_memory(ChronoDuration::hours(24), 0).unwrap();
    let id = store.create_session("alice").unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let (_, removed_expired) = store.cleanup(365).unwrap();
    assert_eq!(removed_expired, 1);
    assert!(store.get_session(&id).is_err());
}

#[test]
fn invocations_for_agent_honors_the_limit() {
    let store = store();
    let id = store.create_session("alice").unwrap();
    for i in 0..5 {
        store
            .record_invocation(&id, "TicketsAgent", &format!("q{}", i), Some("r"), true, None, 1)
            .unwrap();
    }

    let recent = store.invocations_for_agent("TicketsAgent", 3).unwrap();
    assert_eq!(recent.len(), 3);
    // Most recent first.
    assert_eq!(recent[0].query, "q4");
}
