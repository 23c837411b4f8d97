//! Merge properties of the live registry

use omniroster::data::{
    HostRef, KnownSession, LiveUserUpdate, MainSessionState, NonIndexedSession, OnlineStatus,
    Platform, SessionDetails, SessionKnowledge, UpdateTrigger,
};
use omniroster::registry::LiveRegistry;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

fn update(id: &str) -> LiveUserUpdate {
    LiveUserUpdate::new(Platform::VRChat, id)
}

#[test]
fn repeated_user_merges_keep_latest_non_null_values() {
    let registry = LiveRegistry::new();

    let mut first = update("usr_a");
    first.display_name = Some("Aki".to_string());
    first.online_status = Some(OnlineStatus::Online);
    first.custom_status = Some("exploring".to_string());
    first.trigger = Some(UpdateTrigger::InitialPoll);
    registry.merge_user(first);

    let mut second = update("usr_a");
    second.online_status = Some(OnlineStatus::Busy);
    second.trigger = Some(UpdateTrigger::StatusPush);
    registry.merge_user(second);

    // an all-empty update changes nothing
    registry.merge_user(update("usr_a"));

    let merged = registry.get_user(Platform::VRChat, "usr_a").unwrap();
    assert_eq!(registry.user_count(), 1);
    assert_eq!(merged.display_name.as_deref(), Some("Aki"));
    assert_eq!(merged.online_status, Some(OnlineStatus::Busy));
    assert_eq!(merged.custom_status.as_deref(), Some("exploring"));
    assert_eq!(merged.trigger, Some(UpdateTrigger::InitialPoll));
}

#[test]
fn same_account_on_two_platforms_is_two_records() {
    let registry = LiveRegistry::new();
    registry.merge_user(LiveUserUpdate::new(Platform::VRChat, "shared"));
    registry.merge_user(LiveUserUpdate::new(Platform::Resonite, "shared"));

    assert_eq!(registry.user_count(), 2);
    assert_eq!(registry.users(Platform::Resonite).len(), 1);
}

#[test]
fn session_ids_are_stable_and_unique() {
    let registry = LiveRegistry::new();

    let a1 = registry.merge_session(NonIndexedSession::new(Platform::Resonite, "S-a"));
    let b = registry.merge_session(NonIndexedSession::new(Platform::Resonite, "S-b"));
    let mut renamed = NonIndexedSession::new(Platform::Resonite, "S-a");
    renamed.name = Some("Renamed".to_string());
    let a2 = registry.merge_session(renamed);

    assert_eq!(a1, a2);
    assert_ne!(a1, b);
    assert_eq!(registry.session_count(), 2);
    assert_eq!(
        registry
            .get_session(Platform::Resonite, "S-a")
            .unwrap()
            .name
            .as_deref(),
        Some("Renamed")
    );
}

#[test]
fn known_session_in_user_update_creates_session_first() {
    let registry = Arc::new(LiveRegistry::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    registry.on_session_updated(move |s| log.lock().unwrap().push(format!("session:{}", s.session_id)));
    let log = Arc::clone(&order);
    registry.on_user_updated(move |u| log.lock().unwrap().push(format!("user:{}", u.account_id)));

    let mut known = KnownSession::new("wrld_x:1");
    known.space_name = Some("X World".to_string());
    let mut incoming = update("usr_a");
    incoming.main_session = Some(MainSessionState::new(SessionKnowledge::Known(known)));

    let merged = registry.merge_user(incoming);
    let session = registry.get_session(Platform::VRChat, "wrld_x:1").unwrap();

    let assigned = merged
        .main_session
        .as_ref()
        .and_then(|s| s.knowledge.known())
        .and_then(|k| k.assigned_id);
    assert_eq!(assigned, Some(session.id));
    assert_eq!(session.space_name.as_deref(), Some("X World"));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["session:wrld_x:1".to_string(), "user:usr_a".to_string()]
    );
}

#[test]
fn details_merge_never_erases() {
    let registry = LiveRegistry::new();
    let mut session = NonIndexedSession::new(Platform::Resonite, "S-1");
    session.details = SessionDetails {
        host: Some(HostRef {
            account_id: "U-host".to_string(),
            display_name: None,
        }),
        capacity: Some(16),
        ..SessionDetails::default()
    };
    registry.merge_session(session);

    let later = SessionDetails {
        attendance: Some(5),
        ..SessionDetails::default()
    };
    registry.merge_session_details(Platform::Resonite, "S-1", later);

    let stored = registry.get_session(Platform::Resonite, "S-1").unwrap();
    assert_eq!(stored.capacity, Some(16));
    assert_eq!(stored.attendance, Some(5));
    assert_eq!(stored.host.unwrap().account_id, "U-host");

    assert!(registry
        .merge_session_details(Platform::Resonite, "S-unknown", SessionDetails::default())
        .is_none());
}

#[test]
fn world_name_fills_sessions_in_that_world() {
    let registry = LiveRegistry::new();
    for (id, world) in [("S-1", "w1"), ("S-2", "w1"), ("S-3", "w2")] {
        let mut session = NonIndexedSession::new(Platform::VRChat, id);
        session.details.world_id = Some(world.to_string());
        registry.merge_session(session);
    }

    assert_eq!(registry.apply_world_name(Platform::VRChat, "w1", "World One"), 2);
    assert_eq!(
        registry.apply_world_name(Platform::VRChat, "w1", "World One"),
        0,
        "unchanged names do not notify"
    );
    assert!(registry
        .get_session(Platform::VRChat, "S-3")
        .unwrap()
        .space_name
        .is_none());
}
