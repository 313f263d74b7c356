use std::sync::Arc;
use std::time::Duration;

use chat_websocket_client::{ChatClient, Client};
use chat_websocket_server as server;
use chat_websocket_server::protocol::{ChannelJoinPayload, ProtocolMessage};
use chat_websocket_server::{AuthFn, AuthFuture, ChatServer, Identity, ServerConfig};

fn authenticator() -> AuthFn {
    Arc::new(|token: String| -> AuthFuture {
        Box::pin(async move {
            match token.as_str() {
                "alice-token" => Ok(Identity::registered(1, "alice")),
                "bob-token" => Ok(Identity::registered(2, "bob")),
                "carol-token" => Ok(Identity::registered(3, "carol")),
                _ => Err("unknown token".to_string()),
            }
        })
    })
}

async fn start() -> (String, Arc<ChatServer>, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ChatServer::new(ServerConfig {
        authenticate: Some(authenticator()),
        ..Default::default()
    }));
    let shared = state.clone();
    let server_task = tokio::spawn(async move {
        server::serve_incoming_with_server(listener, shared)
            .await
            .unwrap();
    });
    (format!("ws://{}", addr), state, server_task)
}

/// Skip events until one matches `pred`.
async fn recv_until<F>(client: &mut ChatClient, mut pred: F) -> ProtocolMessage
where
    F: FnMut(&ProtocolMessage) -> bool,
{
    loop {
        let env = tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed");
        if pred(&env.message) {
            return env.message;
        }
    }
}

fn is_join_of(channel: u64, who: &'static str) -> impl Fn(&ProtocolMessage) -> bool {
    move |m| {
        matches!(m, ProtocolMessage::ChannelJoin(p)
            if p.channel_id == channel && p.user.as_ref().is_some_and(|u| u.username == who))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn chat_reaches_other_members() {
    let (url, _state, server_task) = start().await;
    let mut alice = ChatClient::connect(&url, Some("alice-token")).await.unwrap();
    let mut bob = ChatClient::connect(&url, Some("bob-token")).await.unwrap();

    alice.join(1).unwrap();
    recv_until(&mut alice, is_join_of(1, "alice")).await;
    bob.join(1).unwrap();
    recv_until(&mut alice, is_join_of(1, "bob")).await;
    recv_until(&mut bob, is_join_of(1, "bob")).await;

    alice.say(1, "hello bob").unwrap();
    match recv_until(&mut bob, |m| matches!(m, ProtocolMessage::ChatSend(_))).await {
        ProtocolMessage::ChatSend(p) => {
            assert_eq!(p.channel_id, 1);
            assert_eq!(p.content, "hello bob");
            assert_eq!(p.sender.map(|u| u.username), Some("alice".to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }

    server_task.abort();
}

#[tokio::test(flavor = "current_thread")]
async fn guest_join_is_denied_over_the_wire() {
    let (url, state, server_task) = start().await;
    let mut guest = ChatClient::connect(&url, None).await.unwrap();
    assert!(guest.user().username.starts_with("Guest"));

    guest.join(1).unwrap();
    match recv_until(&mut guest, |_| true).await {
        ProtocolMessage::Error(e) => assert_eq!(e.detail, "Guests cannot join channels."),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(state.active_channels().await.is_empty());

    server_task.abort();
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_type_keeps_connection_open() {
    let (url, _state, server_task) = start().await;
    let mut client = Client::connect(&url).await.unwrap();
    client.hello(Some("alice-token")).await.unwrap();

    client.send_raw(r#"{"type":"user_typing","payload":{"channel_id":1}}"#).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .unwrap()
        .unwrap()
        .map(|e| e.message);
    match reply {
        Some(ProtocolMessage::Error(e)) => assert_eq!(e.detail, "Invalid message type"),
        other => panic!("expected error, got {other:?}"),
    }

    client
        .send_message(ProtocolMessage::ChannelJoin(ChannelJoinPayload { channel_id: 2, user: None }))
        .await
        .unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .unwrap()
        .unwrap()
        .map(|e| e.message);
    assert!(matches!(joined, Some(ProtocolMessage::ChannelJoin(p)) if p.channel_id == 2));

    server_task.abort();
}

#[tokio::test(flavor = "current_thread")]
async fn disconnect_notifies_each_channel() {
    let (url, state, server_task) = start().await;
    let mut alice = ChatClient::connect(&url, Some("alice-token")).await.unwrap();
    let mut bob = ChatClient::connect(&url, Some("bob-token")).await.unwrap();
    let mut carol = ChatClient::connect(&url, Some("carol-token")).await.unwrap();

    alice.join(1).unwrap();
    recv_until(&mut alice, is_join_of(1, "alice")).await;
    alice.join(2).unwrap();
    recv_until(&mut alice, is_join_of(2, "alice")).await;
    bob.join(1).unwrap();
    recv_until(&mut bob, is_join_of(1, "bob")).await;
    carol.join(2).unwrap();
    recv_until(&mut carol, is_join_of(2, "carol")).await;

    alice.close().unwrap();

    let is_leave = |m: &ProtocolMessage| matches!(m, ProtocolMessage::ChannelLeave(_));
    match recv_until(&mut bob, is_leave).await {
        ProtocolMessage::ChannelLeave(p) => {
            assert_eq!(p.channel_id, 1);
            assert_eq!(p.user.map(|u| u.username), Some("alice".to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }
    match recv_until(&mut carol, is_leave).await {
        ProtocolMessage::ChannelLeave(p) => assert_eq!(p.channel_id, 2),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(state.connection_count().await, 2);

    server_task.abort();
}

#[tokio::test(flavor = "current_thread")]
async fn reconnect_replaces_stale_session() {
    let (url, state, server_task) = start().await;
    let mut bob = ChatClient::connect(&url, Some("bob-token")).await.unwrap();
    bob.join(1).unwrap();
    recv_until(&mut bob, is_join_of(1, "bob")).await;

    let mut first = Client::connect(&url).await.unwrap();
    first.hello(Some("alice-token")).await.unwrap();
    first
        .send_message(ProtocolMessage::ChannelJoin(ChannelJoinPayload { channel_id: 1, user: None }))
        .await
        .unwrap();
    recv_until(&mut bob, is_join_of(1, "alice")).await;

    let second = ChatClient::connect(&url, Some("alice-token")).await.unwrap();

    // the stale connection is closed with a reason
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), first.next())
            .await
            .expect("stale session was not closed")
            .unwrap();
        if next.is_none() {
            break;
        }
    }
    assert_eq!(first.close_reason(), Some("Session replaced"));

    // membership survives the replacement: alice can still talk in channel 1
    second.say(1, "back again").unwrap();
    let mut seen = Vec::new();
    let msg = recv_until(&mut bob, |m| {
        seen.push(m.clone());
        matches!(m, ProtocolMessage::ChatSend(_))
    })
    .await;
    assert!(matches!(msg, ProtocolMessage::ChatSend(p) if p.content == "back again"));
    assert!(!seen.iter().any(|m| matches!(m, ProtocolMessage::ChannelLeave(_))));
    assert_eq!(state.connection_count().await, 2);

    server_task.abort();
}
