//! Client side of a session.
//!
//! - [`SyncClient`] — WebSocket connection to the session server
//! - [`workspace`] — the client's view of the session, driven by `tick`
//! - [`transaction_manager`] — local transaction capture, remote apply
//! - [`package_manager`] — package files on disk, hot-reload and purge
//! - [`persisted`] — package revisions already reconciled with disk

pub mod package_manager;
pub mod persisted;
pub mod transaction_manager;
pub mod workspace;

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use ensemble_core::EndpointId;

use crate::protocol::{ProtocolError, SyncMessage};
use workspace::ClientWorkspace;

/// Frames buffered in each direction.
const CHANNEL_CAPACITY: usize = 1024;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// WebSocket connection to the session server.
///
/// Reading and writing run on background tasks; the application exchanges
/// [`SyncMessage`]s through channels and never blocks its frame on the
/// socket.
pub struct SyncClient {
    endpoint_id: EndpointId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Messages decoded by the reader task
    incoming_rx: Option<mpsc::Receiver<SyncMessage>>,
}

impl SyncClient {
    pub fn new(endpoint_id: EndpointId, server_url: impl Into<String>) -> Self {
        Self {
            endpoint_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            incoming_rx: None,
        }
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: decode incoming frames
        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
        let state = self.state.clone();
        let server_url = self.server_url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(message) => {
                                if in_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from {server_url}: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            log::info!("Connection to {server_url} lost");
            *state.write().await = ConnectionState::Disconnected;
        });

        self.outgoing_tx = Some(out_tx);
        self.incoming_rx = Some(in_rx);
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Endpoint {} connected to {}", self.endpoint_id, self.server_url);
        Ok(())
    }

    /// Send one message to the server.
    pub async fn send(&self, message: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Wait for the next message. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.incoming_rx.as_mut()?.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        self.incoming_rx.as_mut()?.try_recv().ok()
    }

    /// Exchange messages with `workspace`: send its outbox, then feed it
    /// everything received so far. Returns how many messages it handled.
    pub async fn pump(&mut self, workspace: &mut ClientWorkspace) -> Result<usize, ProtocolError> {
        for message in workspace.drain_outbox() {
            self.send(&message).await?;
        }
        let mut handled = 0;
        while let Some(message) = self.try_recv() {
            workspace.handle_message(&message);
            handled += 1;
        }
        Ok(handled)
    }

    /// Drop the channels; the writer task closes the socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.incoming_rx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_client_initial_state() {
        let endpoint = Uuid::new_v4();
        let client = SyncClient::new(endpoint, "ws://127.0.0.1:9190");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.endpoint_id(), endpoint);
        assert_eq!(client.server_url(), "ws://127.0.0.1:9190");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new(Uuid::new_v4(), "ws://127.0.0.1:9190");
        let result = client.send(&SyncMessage::ping(Uuid::new_v4())).await;
        assert_eq!(result, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = SyncClient::new(Uuid::new_v4(), format!("ws://127.0.0.1:{port}"));
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
