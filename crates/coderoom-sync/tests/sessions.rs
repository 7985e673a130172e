//! Sessions talking to a hub over in-memory links.

use coderoom_core::RoomId;
use coderoom_doc::{CursorState, LocalEdit};
use coderoom_sandbox::Language;
use coderoom_sync::{
    ClientConfigBuilder, EditorBinding, EditorEvent, Hub, MemoryTransport, Session, SessionEvent,
    SessionState, SyncConfigBuilder, SyncError,
};
use std::sync::Arc;
use std::time::Duration;

fn session(transport: MemoryTransport) -> Session<MemoryTransport> {
    Session::with_config(
        RoomId::new("pairing"),
        transport,
        SyncConfigBuilder::new()
            .sync_interval(50)
            .heartbeat_interval(200)
            .presence_interval(20)
            .build(),
        ClientConfigBuilder::new()
            .backoff(10, 50)
            .max_reconnect_attempts(200)
            .build(),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 4s");
}

fn insert(position: usize, text: &str) -> LocalEdit {
    LocalEdit::Insert {
        position,
        text: text.to_string(),
    }
}

fn setup() -> (Arc<Hub>, MemoryTransport, MemoryTransport) {
    let hub = Arc::new(Hub::default());
    let room = RoomId::new("pairing");
    let a = MemoryTransport::new(hub.clone(), room.clone());
    let b = MemoryTransport::new(hub.clone(), room);
    (hub, a, b)
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (hub, ta, tb) = setup();
    let a = session(ta);
    let b = session(tb);
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    assert_eq!(a.state(), SessionState::Synced);
    assert_eq!(hub.member_count(&RoomId::new("pairing")), 2);

    a.edit(insert(0, "hello"));
    b.edit(insert(0, "world"));
    eventually(|| a.len() == 10 && a.text() == b.text()).await;

    let merged = a.text();
    assert!(merged == "helloworld" || merged == "worldhello");
    eventually(|| hub.room_text(&RoomId::new("pairing")).as_deref() == Some(merged.as_str())).await;
}

#[tokio::test]
async fn test_late_joiner_receives_document_in_welcome() {
    let (hub, ta, tb) = setup();
    let a = session(ta);
    a.connect().await.unwrap();
    a.edit(insert(0, "fn main() {}"));
    eventually(|| hub.room_text(&RoomId::new("pairing")).as_deref() == Some("fn main() {}")).await;

    let b = session(tb);
    b.connect().await.unwrap();
    assert_eq!(b.text(), "fn main() {}");
}

#[tokio::test]
async fn test_offline_edits_replayed_after_reconnect() {
    let (_hub, ta, tb) = setup();
    let link = ta.clone();
    let a = session(ta);
    let b = session(tb);
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    a.edit(insert(0, "shared "));
    eventually(|| b.text() == "shared ").await;

    link.set_online(false);
    link.sever();
    eventually(|| a.state() == SessionState::Reconnecting).await;

    let before = a.queued_operations();
    a.edit(insert(7, "offline"));
    assert_eq!(a.queued_operations(), before + 7);
    b.edit(insert(0, ">"));

    link.set_online(true);
    eventually(|| a.state() == SessionState::Synced).await;
    eventually(|| a.text() == b.text() && a.len() == 15).await;
    assert_eq!(a.text(), ">shared offline");
    assert_eq!(a.queued_operations(), 0);
}

#[tokio::test]
async fn test_lost_update_is_recovered_by_anti_entropy() {
    let (hub, ta, tb) = setup();
    let link = ta.clone();
    let a = session(ta);
    let b = session(tb);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    link.lose_next_updates(2);
    a.edit(insert(0, "abc"));
    assert_eq!(a.unacknowledged_operations(), 3);

    // Several sync rounds pass before the hub's state vector covers all three.
    eventually(|| hub.room_text(&RoomId::new("pairing")).as_deref() == Some("abc")).await;
    eventually(|| b.text() == "abc").await;
    eventually(|| a.unacknowledged_operations() == 0).await;

    // A clean edit is acknowledged as well and nothing is resent forever.
    a.edit(insert(3, "d"));
    eventually(|| b.text() == "abcd" && a.unacknowledged_operations() == 0).await;
}

#[tokio::test]
async fn test_run_output_is_shared_and_language_switch_clears_it() {
    let (hub, ta, tb) = setup();
    let a = Arc::new(session(ta));
    let b = session(tb);
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    let mut b_events = b.subscribe();

    let mut binding = EditorBinding::new(a.clone());
    binding.handle(EditorEvent::Insert {
        position: 0,
        text: "console.log(1)".into(),
    });
    binding.handle(EditorEvent::Run);
    assert_eq!(a.output(), "console.log(1)");
    let announced = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            if let Ok(SessionEvent::OutputChanged(code)) = b_events.recv().await {
                return code;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(announced, "console.log(1)");
    assert_eq!(b.output(), "console.log(1)");

    // A late joiner sees the last run.
    let late = session(MemoryTransport::new(hub.clone(), RoomId::new("pairing")));
    late.connect().await.unwrap();
    assert_eq!(late.output(), "console.log(1)");

    b.clear_output();
    eventually(|| a.output().is_empty() && late.output().is_empty()).await;

    binding.handle(EditorEvent::Run);
    eventually(|| b.output() == "console.log(1)").await;
    assert!(!a.set_language(Language::JavaScript));
    binding.handle(EditorEvent::LanguageSelected(Language::TypeScript));
    assert_eq!(a.language(), Language::TypeScript);
    assert_eq!(a.text(), "");
    eventually(|| b.text().is_empty() && b.output().is_empty()).await;
    eventually(|| hub.room_output(&RoomId::new("pairing")).as_deref() == Some("")).await;
    assert_eq!(b.language(), Language::JavaScript);
}

#[tokio::test]
async fn test_initial_failure_is_reported() {
    let (_hub, ta, _tb) = setup();
    ta.set_online(false);
    let a = session(ta);
    let err = a.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::NotConnected(_)));
    assert_eq!(a.state(), SessionState::Disconnected);

    // Edits still apply locally.
    a.edit(insert(0, "draft"));
    assert_eq!(a.text(), "draft");
}

#[tokio::test]
async fn test_presence_cursors_identities_and_leave() {
    let (hub, ta, tb) = setup();
    let a = Arc::new(session(ta));
    let b = session(tb);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    eventually(|| match (a.identity(), b.identity()) {
        (Some(x), Some(y)) => x.name != y.name,
        _ => false,
    })
    .await;

    let mut binding = EditorBinding::new(a.clone());
    binding.handle(EditorEvent::Insert {
        position: 0,
        text: "let x = 1;".into(),
    });
    binding.handle(EditorEvent::Cursor(Some(CursorState::at(4))));

    let a_id = a.connection_id();
    let a_name = a.identity().unwrap().name;
    eventually(|| {
        b.remote_cursors()
            .iter()
            .any(|cursor| cursor.connection_id == a_id && cursor.position == 4 && cursor.label == a_name)
    })
    .await;

    a.leave();
    assert_eq!(a.state(), SessionState::Disconnected);
    eventually(|| b.presence().iter().all(|entry| entry.connection_id != a_id)).await;
    eventually(|| hub.member_count(&RoomId::new("pairing")) == 1).await;
}

#[tokio::test]
async fn test_events_report_state_and_changes() {
    let (_hub, ta, _tb) = setup();
    let a = session(ta);
    let mut events = a.subscribe();
    a.connect().await.unwrap();
    a.edit(insert(0, "x"));

    let mut states = Vec::new();
    let mut local_changes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::StateChanged(state) => states.push(state),
            SessionEvent::DocumentChanged(delta) if delta.is_local() => local_changes += 1,
            _ => {}
        }
    }
    assert_eq!(states, vec![SessionState::Connecting, SessionState::Synced]);
    assert_eq!(local_changes, 1);
}
