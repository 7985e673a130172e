//! End-to-end over a real WebSocket server on a loopback port.

use coderoom_core::{ReplicaId, RoomId};
use coderoom_doc::LocalEdit;
use coderoom_sync::{
    Message, ServerConfig, Session, SyncConfigBuilder, SyncServer, WebSocketTransport,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as Frame;

async fn start_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://{addr}"))
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

#[tokio::test]
async fn test_sessions_converge_through_server() {
    let (server, base) = start_server().await;
    let config = || SyncConfigBuilder::new().sync_interval(50).build();
    let a = Session::with_config(
        RoomId::new("ignored"),
        WebSocketTransport::new(format!("{base}/pairing")),
        config(),
        Default::default(),
    );
    let b = Session::with_config(
        RoomId::new("ignored"),
        WebSocketTransport::new(format!("{base}/pairing?tab=2")),
        config(),
        Default::default(),
    );
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.edit(LocalEdit::Insert {
        position: 0,
        text: "const a = 1;".into(),
    });
    b.edit(LocalEdit::Insert {
        position: 0,
        text: "// ".into(),
    });
    eventually(|| a.len() == 15 && a.text() == b.text()).await;

    // The path names the room, not the JOIN message.
    let hub = server.hub();
    eventually(|| hub.room_text(&RoomId::new("pairing")).as_deref() == Some(a.text().as_str())).await;
    assert_eq!(hub.room_text(&RoomId::new("ignored")), None);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let (server, base) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{base}/raw")).await.unwrap();

    ws.send(Frame::Text("not json".into())).await.unwrap();
    let join = Message::Join {
        room: RoomId::new("raw"),
        replica_id: Some(ReplicaId::new("alice")),
        state_vector: None,
    };
    ws.send(Frame::Text(join.encode().unwrap().into())).await.unwrap();

    let welcome = loop {
        match ws.next().await.unwrap().unwrap() {
            Frame::Text(text) => break Message::decode(text.as_str()).unwrap(),
            _ => continue,
        }
    };
    match welcome {
        Message::Welcome { replica_id, .. } => assert_eq!(replica_id, ReplicaId::new("alice")),
        other => panic!("expected welcome, got {other:?}"),
    }

    ws.send(Frame::Text(r#"{"type":"UPDATE"}"#.into())).await.unwrap();
    ws.send(Frame::Text(Message::Ping.encode().unwrap().into())).await.unwrap();
    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Frame::Text(text) => break Message::decode(text.as_str()).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply, Message::Pong);
    assert_eq!(server.hub().member_count(&RoomId::new("raw")), 1);

    ws.close(None).await.unwrap();
    eventually(|| server.hub().room_count() == 0).await;
}
