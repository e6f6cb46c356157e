//! Outbound routing from the session task to connected endpoints.
//!
//! Each endpoint has a bounded channel drained by its connection task. The
//! session task never awaits a slow endpoint:
//!
//! - best-effort messages (snapshots) are dropped when the channel is full
//! - reliable messages that do not fit detach the endpoint, closing its
//!   connection; it has to reconnect and resync
//!
//! Stats are tracked via atomics and can be read from any task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use ensemble_core::EndpointId;

use crate::protocol::{ProtocolError, SyncMessage};

/// Encoded frame shared by every recipient of a fan-out.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub endpoints_detached: u64,
    pub active_endpoints: usize,
}

#[derive(Debug, Default)]
struct AtomicRouterStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    endpoints_detached: AtomicU64,
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Dropped,
    /// The endpoint was detached (full on a reliable message, or gone)
    Detached,
    UnknownEndpoint,
}

pub struct EndpointRouter {
    senders: HashMap<EndpointId, mpsc::Sender<Frame>>,
    stats: Arc<AtomicRouterStats>,
}

impl Default for EndpointRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
            stats: Arc::new(AtomicRouterStats::default()),
        }
    }

    /// Route messages for `endpoint` into `sender`, replacing any previous one.
    pub fn attach(&mut self, endpoint: EndpointId, sender: mpsc::Sender<Frame>) {
        self.senders.insert(endpoint, sender);
    }

    pub fn detach(&mut self, endpoint: EndpointId) -> bool {
        self.senders.remove(&endpoint).is_some()
    }

    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.senders.contains_key(&endpoint)
    }

    /// Encode and queue `msg` for `endpoint`.
    pub fn send(&mut self, endpoint: EndpointId, msg: &SyncMessage) -> Result<Delivery, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.send_frame(endpoint, frame, msg.reliable))
    }

    /// Queue a pre-encoded frame.
    pub fn send_frame(&mut self, endpoint: EndpointId, frame: Frame, reliable: bool) -> Delivery {
        let Some(sender) = self.senders.get(&endpoint) else {
            return Delivery::UnknownEndpoint;
        };

        match sender.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) if !reliable => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Dropped best-effort message for lagging endpoint {endpoint}");
                Delivery::Dropped
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Endpoint {endpoint} lagged on a reliable message, detaching");
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.stats.endpoints_detached.fetch_add(1, Ordering::Relaxed);
                self.senders.remove(&endpoint);
                Delivery::Detached
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Endpoint {endpoint} channel closed");
                self.senders.remove(&endpoint);
                Delivery::Detached
            }
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.senders.keys().copied().collect()
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            endpoints_detached: self.stats.endpoints_detached.load(Ordering::Relaxed),
            active_endpoints: self.senders.len(),
        }
    }
}
