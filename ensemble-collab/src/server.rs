//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ── connection task ──┐                       ┌── outbound mpsc ── Client A
//!                                ├─► SessionCommand mpsc ─► session task ─┤
//! Client B ── connection task ──┘      (one per session)  │ ServerWorkspace  └── outbound mpsc ── Client B
//!                                                         │ EndpointRouter
//!                                   tick interval ────────┘ LedgerStore (RocksDB)
//! ```
//!
//! Connection tasks only decode and encode frames. The session task owns the
//! workspace exclusively, so every lock acquisition and ledger append for the
//! session happens on one task, one message at a time.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use ensemble_core::{ActivityLedger, EndpointId, LedgerError};

use crate::config::ServerConfig;
use crate::endpoints::{Delivery, EndpointRouter, Frame};
use crate::protocol::{ClientJoinedEvent, MessageType, SyncMessage};
use crate::storage::{LedgerStore, StoreError};
use crate::workspace::ServerWorkspace;

/// Capacity of the channel feeding the session task.
const SESSION_COMMAND_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Ledger recovery failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input of the session task.
#[derive(Debug)]
enum SessionCommand {
    Connected {
        endpoint: EndpointId,
        outbound: mpsc::Sender<Frame>,
    },
    Message {
        endpoint: EndpointId,
        message: SyncMessage,
    },
    Disconnected {
        endpoint: EndpointId,
    },
}

/// The session server.
pub struct SyncServer {
    config: ServerConfig,
    workspace: ServerWorkspace,
}

impl SyncServer {
    /// Create the server, recovering the ledger when storage is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let workspace = match &config.storage {
            Some(store_config) => {
                let store = LedgerStore::open(store_config.clone())?;
                let session_id = match store.session_id()? {
                    Some(id) => id,
                    None => {
                        let id = Uuid::new_v4();
                        store.set_session_id(id)?;
                        id
                    }
                };

                let mut ledger = ActivityLedger::new();
                let activities = store.load_activities()?;
                let recovered = activities.len();
                for activity in activities {
                    ledger.append_synced(activity)?;
                }
                ledger.reserve_activity_ids(store.next_activity_id()?);
                ledger.set_sink(Box::new(store));

                log::info!(
                    "Recovered {recovered} activities for session {session_id}, next activity {}",
                    ledger.next_activity_id()
                );
                ServerWorkspace::with_ledger(session_id, ledger)
            }
            None => ServerWorkspace::new(Uuid::new_v4()),
        };

        Ok(Self { config, workspace })
    }

    pub fn session_id(&self) -> Uuid {
        self.workspace.session_id()
    }

    pub fn workspace(&self) -> &ServerWorkspace {
        &self.workspace
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run_on(self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Session '{}' ({}) listening on {}",
            self.config.session_name,
            self.workspace.session_id(),
            listener.local_addr()?
        );

        let (command_tx, command_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        let config = self.config.clone();
        tokio::spawn(Self::run_session(self.workspace, config.clone(), command_rx));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let command_tx = command_tx.clone();
            let outbound_capacity = config.outbound_capacity;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, command_tx, outbound_capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// The session task: sole owner of the workspace.
    async fn run_session(
        mut workspace: ServerWorkspace,
        config: ServerConfig,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let mut router = EndpointRouter::new();
        let mut ticker = tokio::time::interval(config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let budget = config.sync_time_budget();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        SessionCommand::Connected { endpoint, outbound } => {
                            router.attach(endpoint, outbound);
                        }
                        SessionCommand::Message { endpoint, message } => {
                            workspace.handle_message(endpoint, &message);
                        }
                        SessionCommand::Disconnected { endpoint } => {
                            router.detach(endpoint);
                            workspace.handle_client_left(endpoint);
                            let stats = router.stats();
                            log::debug!(
                                "Router: {} sent, {} dropped, {} active",
                                stats.messages_sent,
                                stats.messages_dropped,
                                stats.active_endpoints
                            );
                        }
                    }
                }
                _ = ticker.tick() => {
                    workspace.tick(budget);
                }
            }

            for outbound in workspace.drain_outbox() {
                match router.send(outbound.endpoint, &outbound.message) {
                    Ok(Delivery::Detached) => {
                        log::info!("Endpoint {} detached by the router", outbound.endpoint);
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to route message to {}: {e}", outbound.endpoint),
                }
            }
        }

        log::info!("Session task stopped");
    }

    /// Handle a single WebSocket connection.
    ///
    /// The first message must be `ClientJoined`; its endpoint id identifies
    /// the connection from then on.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        commands: mpsc::Sender<SessionCommand>,
        outbound_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let join = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = SyncMessage::decode(&bytes)?;
                    if msg.msg_type != MessageType::ClientJoined {
                        log::warn!("Expected ClientJoined from {addr}, got {:?}", msg.msg_type);
                        return Ok(());
                    }
                    // Validate before registering the endpoint
                    msg.decode_payload::<ClientJoinedEvent>()?;
                    break msg;
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let endpoint = join.endpoint_id;
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(outbound_capacity);
        commands
            .send(SessionCommand::Connected {
                endpoint,
                outbound: outbound_tx,
            })
            .await?;
        commands
            .send(SessionCommand::Message {
                endpoint,
                message: join,
            })
            .await?;

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                match SyncMessage::decode(&bytes) {
                                    Ok(message) => {
                                        let leaving = message.msg_type == MessageType::ClientLeft;
                                        commands.send(SessionCommand::Message { endpoint, message }).await?;
                                        if leaving {
                                            break;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                            }
                            None => {
                                log::info!("Endpoint {endpoint} detached, closing connection");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        commands.send(SessionCommand::Disconnected { endpoint }).await?;
        result
    }
}
