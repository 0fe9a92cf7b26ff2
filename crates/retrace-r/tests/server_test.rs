use futures::{SinkExt, StreamExt};
use retrace_engine::api::RecorderService;
use retrace_engine::error::ErrorCategory;
use retrace_engine::event::EventKind;
use retrace_engine::protocol::{SessionDraft, SessionStatus};
use retrace_engine::store::{MemoryDurableStore, SessionStore, StoreOptions};
use retrace_r::PushServer;
use retrace_r::protocol::ServerMessage;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn service() -> RecorderService {
    let options = StoreOptions {
        reconcile_interval: None,
        ..StoreOptions::default()
    };
    let store = SessionStore::new(Arc::new(MemoryDurableStore::new()), None, options);
    RecorderService::new(store)
}

async fn connect(port: u16) -> Client {
    let url = format!("ws://127.0.0.1:{}", port);
    for _ in 0..10 {
        if let Ok((ws_stream, _)) = connect_async(&url).await {
            return ws_stream;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to push server");
}

async fn send(client: &mut Client, value: serde_json::Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

async fn next(client: &mut Client) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server message");
        }
    }
}

async fn session(service: &RecorderService) -> String {
    service
        .create_session(SessionDraft::new("Login Flow", "https://example.com"))
        .await
        .unwrap()
        .value
        .id
}

#[tokio::test]
async fn joined_clients_receive_step_events() -> anyhow::Result<()> {
    let service = service();
    let id = session(&service).await;
    let handle = PushServer::new(service.clone(), 0).start().await?;
    let mut client = connect(handle.local_addr().port()).await;

    send(&mut client, json!({ "type": "join", "session_id": id })).await;
    assert!(matches!(next(&mut client).await, ServerMessage::Joined { .. }));

    service
        .add_step(
            &id,
            serde_json::from_value(json!({ "action": "click", "locator": "#login" }))?,
        )
        .await?;

    match next(&mut client).await {
        ServerMessage::Event { event } => {
            assert_eq!(event.session_id, id);
            match event.kind {
                EventKind::StepAdded { step } => {
                    assert_eq!(step.locator.as_deref(), Some("#login"))
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        other => panic!("unexpected message {other:?}"),
    }

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn socket_mutations_share_the_store_path() -> anyhow::Result<()> {
    let service = service();
    let id = session(&service).await;
    let handle = PushServer::new(service.clone(), 0).start().await?;
    let mut client = connect(handle.local_addr().port()).await;

    send(
        &mut client,
        json!({
            "type": "add_step",
            "session_id": id,
            "request_id": "r1",
            "step": { "action": "fill", "value": "alice", "locator": "#username" }
        }),
    )
    .await;
    let step_id = match next(&mut client).await {
        ServerMessage::Ack {
            request_id, step, ..
        } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert!(!step.fallbacks.is_empty());
            step.id
        }
        other => panic!("unexpected message {other:?}"),
    };

    send(
        &mut client,
        json!({
            "type": "update_step",
            "session_id": id,
            "step_id": step_id,
            "request_id": "r2",
            "patch": { "description": "Type the user name" }
        }),
    )
    .await;
    assert!(matches!(next(&mut client).await, ServerMessage::Ack { .. }));

    send(
        &mut client,
        json!({
            "type": "remove_step",
            "session_id": id,
            "step_id": step_id,
            "request_id": "r3"
        }),
    )
    .await;
    assert!(matches!(next(&mut client).await, ServerMessage::Ack { .. }));
    assert!(service.list_steps(&id).await?.is_empty());

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn bad_requests_report_categories() -> anyhow::Result<()> {
    let service = service();
    let id = session(&service).await;
    let handle = PushServer::new(service.clone(), 0).start().await?;
    let mut client = connect(handle.local_addr().port()).await;

    send(&mut client, json!({ "type": "join", "session_id": "missing" })).await;
    match next(&mut client).await {
        ServerMessage::Error { error, .. } => assert_eq!(error.category, ErrorCategory::NotFound),
        other => panic!("unexpected message {other:?}"),
    }

    send(
        &mut client,
        json!({
            "type": "remove_step",
            "session_id": id,
            "step_id": "nope",
            "request_id": "r9"
        }),
    )
    .await;
    match next(&mut client).await {
        ServerMessage::Error { request_id, error } => {
            assert_eq!(request_id.as_deref(), Some("r9"));
            assert_eq!(error.category, ErrorCategory::NotFound);
        }
        other => panic!("unexpected message {other:?}"),
    }

    client.send(Message::Text("{ not json".into())).await?;
    match next(&mut client).await {
        ServerMessage::Error { error, .. } => {
            assert_eq!(error.category, ErrorCategory::ValidationFailure)
        }
        other => panic!("unexpected message {other:?}"),
    }

    handle.stop();
    Ok(())
}

#[tokio::test]
async fn leaving_and_disconnecting_do_not_touch_sessions() -> anyhow::Result<()> {
    let service = service();
    let id = session(&service).await;
    let handle = PushServer::new(service.clone(), 0).start().await?;
    let mut client = connect(handle.local_addr().port()).await;

    send(&mut client, json!({ "type": "join", "session_id": id })).await;
    assert!(matches!(next(&mut client).await, ServerMessage::Joined { .. }));
    assert_eq!(service.store().notifier().subscriber_count(&id), 1);

    send(&mut client, json!({ "type": "leave", "session_id": id })).await;
    assert!(matches!(next(&mut client).await, ServerMessage::Left { .. }));

    send(&mut client, json!({ "type": "join", "session_id": id })).await;
    assert!(matches!(next(&mut client).await, ServerMessage::Joined { .. }));
    client.close(None).await?;

    let mut released = false;
    for _ in 0..50 {
        if service.store().notifier().subscriber_count(&id) == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released);
    assert_eq!(
        service.get_session(&id).await?.status,
        SessionStatus::Created
    );

    handle.stop();
    Ok(())
}
