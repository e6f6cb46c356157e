//! Play-session tracking.
//!
//! Play sessions are ephemeral: nothing is recorded while one runs. When a
//! session ends the server fences the played package with a `Dummy` package
//! activity so clients re-read the head revision that was live during play.
//!
//! ```text
//! Begin ─► Switch* ─► End ─► fence(play_package_name)
//!   └──────── disconnect ──┘
//! ```

use std::collections::HashMap;

use ensemble_core::EndpointId;

use crate::protocol::{PlaySessionEvent, PlaySessionEventType};

/// A running play session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaySession {
    pub play_endpoint_id: EndpointId,
    pub play_package_name: String,
    pub is_simulating: bool,
}

#[derive(Debug, Default)]
pub struct PlaySessionTracker {
    sessions: HashMap<EndpointId, PlaySession>,
}

impl PlaySessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event. Returns the ended session on `End`.
    pub fn handle(&mut self, event: &PlaySessionEvent) -> Option<PlaySession> {
        match event.event_type {
            PlaySessionEventType::Begin => {
                log::info!(
                    "Play session began for {} in {}",
                    event.play_endpoint_id,
                    event.play_package_name
                );
                self.sessions.insert(
                    event.play_endpoint_id,
                    PlaySession {
                        play_endpoint_id: event.play_endpoint_id,
                        play_package_name: event.play_package_name.clone(),
                        is_simulating: event.is_simulating,
                    },
                );
                None
            }
            PlaySessionEventType::Switch => {
                if let Some(session) = self.sessions.get_mut(&event.play_endpoint_id) {
                    session.is_simulating = event.is_simulating;
                } else {
                    log::debug!("Play session switch for unknown endpoint {}", event.play_endpoint_id);
                }
                None
            }
            PlaySessionEventType::End => {
                let ended = self.sessions.remove(&event.play_endpoint_id);
                if ended.is_some() {
                    log::info!("Play session ended for {}", event.play_endpoint_id);
                }
                ended
            }
        }
    }

    /// Forget the session of a disconnected endpoint.
    pub fn remove_endpoint(&mut self, endpoint: EndpointId) -> Option<PlaySession> {
        self.sessions.remove(&endpoint)
    }

    pub fn session(&self, endpoint: EndpointId) -> Option<&PlaySession> {
        self.sessions.get(&endpoint)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
