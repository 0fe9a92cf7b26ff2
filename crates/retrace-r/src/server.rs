use crate::protocol::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use retrace_engine::api::RecorderService;
use retrace_engine::error::{Mutation, RecorderError};
use retrace_engine::protocol::{SessionId, Step};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// Accepts WebSocket clients and relays session topics to them.
#[derive(Clone)]
pub struct PushServer {
    service: RecorderService,
    port: u16,
}

/// A running accept loop.
pub struct PushHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PushHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting. Connections already open run until their peer leaves.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Wait for the accept loop to end.
    pub async fn wait(self) {
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            error!("Push server accept loop failed: {}", e);
        }
    }
}

impl PushServer {
    pub fn new(service: RecorderService, port: u16) -> Self {
        Self { service, port }
    }

    /// Bind to `127.0.0.1:port` (port 0 picks a free one) and start accepting.
    pub async fn start(&self) -> std::io::Result<PushHandle> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = TcpListener::bind(&addr).await?;
        let addr = listener.local_addr()?;
        info!("Push server listening on: {}", addr);

        let service = self.service.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted TCP connection from: {}", peer);
                        tokio::spawn(accept_connection(stream, peer, service.clone()));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }
        });

        Ok(PushHandle { addr, task })
    }
}

/// Per-connection state: the outbound queue and one forwarder per joined topic.
struct Connection {
    service: RecorderService,
    outbound: mpsc::Sender<ServerMessage>,
    topics: HashMap<SessionId, JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Connection writer gone, dropping message");
        }
    }

    async fn join(&mut self, session_id: SessionId) -> Result<(), RecorderError> {
        if self.topics.contains_key(&session_id) {
            self.send(ServerMessage::Joined { session_id }).await;
            return Ok(());
        }
        // Only existing sessions have topics worth joining.
        self.service.get_session(&session_id).await?;

        let mut subscription = self.service.subscribe(&session_id);
        let outbound = self.outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if outbound.send(ServerMessage::Event { event }).await.is_err() {
                    break;
                }
            }
        });
        self.topics.insert(session_id.clone(), forwarder);
        self.send(ServerMessage::Joined { session_id }).await;
        Ok(())
    }

    /// Dropping the forwarder drops its subscription, which leaves the topic.
    async fn leave(&mut self, session_id: SessionId) {
        if let Some(forwarder) = self.topics.remove(&session_id) {
            forwarder.abort();
        }
        self.send(ServerMessage::Left { session_id }).await;
    }

    async fn acknowledge(
        &self,
        request_id: Option<String>,
        result: Result<Mutation<Step>, RecorderError>,
    ) {
        let message = match result {
            Ok(mutation) => ServerMessage::Ack {
                request_id,
                warnings: mutation.warnings.iter().map(RecorderError::report).collect(),
                step: mutation.value,
            },
            Err(e) => ServerMessage::error(request_id.as_deref(), &e),
        };
        self.send(message).await;
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Join { session_id } => {
                if let Err(e) = self.join(session_id).await {
                    self.send(ServerMessage::error(None, &e)).await;
                }
            }
            ClientMessage::Leave { session_id } => self.leave(session_id).await,
            ClientMessage::AddStep {
                session_id,
                request_id,
                step,
            } => {
                let result = self.service.add_step(&session_id, step).await;
                self.acknowledge(request_id, result).await;
            }
            ClientMessage::UpdateStep {
                session_id,
                step_id,
                request_id,
                patch,
            } => {
                let result = self.service.update_step(&session_id, &step_id, patch).await;
                self.acknowledge(request_id, result).await;
            }
            ClientMessage::RemoveStep {
                session_id,
                step_id,
                request_id,
            } => {
                let result = self.service.remove_step(&session_id, &step_id).await;
                self.acknowledge(request_id, result).await;
            }
        }
    }

    fn close(&mut self) {
        for (_, forwarder) in self.topics.drain() {
            forwarder.abort();
        }
    }
}

async fn accept_connection(stream: TcpStream, peer: SocketAddr, service: RecorderService) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Error during the websocket handshake occurred: {}", e);
            return;
        }
    };

    info!("New WebSocket connection: {}", peer);
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("Failed to send message to WS: {}", e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut connection = Connection {
        service,
        outbound,
        topics: HashMap::new(),
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => connection.handle(message).await,
                Err(e) => {
                    warn!("Failed to parse client message: {} | Text: {}", e, text);
                    let err = RecorderError::invalid_field("message", e.to_string());
                    connection.send(ServerMessage::error(None, &err)).await;
                }
            },
            Ok(Message::Close(_)) => {
                info!("WebSocket closed: {}", peer);
                break;
            }
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Disconnect only deregisters; session state is untouched.
    connection.close();
    drop(connection);
    if let Err(e) = writer.await {
        debug!("Connection writer ended abnormally: {}", e);
    }
}
