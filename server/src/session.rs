//! Voice session tracking and liveness for the relay
//!
//! This module handles the server-side bookkeeping of authenticated voice
//! sessions, including:
//! - Session lifecycle (authenticate, endpoint rebind, disconnect, expiry)
//! - Last-activity tracking used by the idle sweep
//! - Endpoint lookup for audio fan-out
//!
//! Exactly one live session exists per player identifier; a fresh AUTH for an
//! already-authenticated identifier replaces the prior session, last writer
//! wins on the endpoint. Every subsequent valid packet refreshes the endpoint
//! mapping, which makes NAT rebinds and port changes transparent.

use dashmap::DashMap;
use log::info;
use shared::PlayerId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An authenticated voice session.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    pub player_id: PlayerId,
    /// Transport endpoint audio frames are sent to.
    pub endpoint: SocketAddr,
    pub authenticated_at: Instant,
    /// Last time any valid packet arrived from this player.
    pub last_activity: Instant,
}

impl VoiceSession {
    fn new(player_id: PlayerId, endpoint: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            player_id,
            endpoint,
            authenticated_at: now,
            last_activity: now,
        }
    }

    /// True if no packet has arrived within `max_idle`.
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.last_activity.elapsed() > max_idle
    }
}

/// Concurrent table of live voice sessions, keyed by player id.
///
/// Entries are guarded at key granularity; packets from different speakers
/// never contend.
pub struct SessionTable {
    sessions: DashMap<PlayerId, VoiceSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Creates a session for `player_id`, replacing any existing one.
    /// Returns true if a prior session was replaced.
    pub fn authenticate(&self, player_id: PlayerId, endpoint: SocketAddr) -> bool {
        let replaced = self
            .sessions
            .insert(player_id, VoiceSession::new(player_id, endpoint))
            .is_some();
        if replaced {
            info!("Voice session for {} replaced, now at {}", player_id, endpoint);
        } else {
            info!("Voice session established for {} at {}", player_id, endpoint);
        }
        replaced
    }

    /// Refreshes activity and endpoint for a known session. Returns false if
    /// the player is not authenticated.
    pub fn touch(&self, player_id: PlayerId, endpoint: SocketAddr) -> bool {
        if let Some(mut session) = self.sessions.get_mut(&player_id) {
            session.last_activity = Instant::now();
            session.endpoint = endpoint;
            true
        } else {
            false
        }
    }

    /// Removes a session explicitly. Returns true if one existed.
    pub fn remove(&self, player_id: PlayerId) -> bool {
        if self.sessions.remove(&player_id).is_some() {
            info!("Voice session for {} removed", player_id);
            true
        } else {
            false
        }
    }

    pub fn is_authenticated(&self, player_id: PlayerId) -> bool {
        self.sessions.contains_key(&player_id)
    }

    /// Current endpoint for an authenticated player.
    pub fn endpoint_of(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.sessions.get(&player_id).map(|s| s.endpoint)
    }

    /// Finds the player currently bound to an endpoint. Used to refresh
    /// activity for control packets that carry no id, like PING.
    pub fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<PlayerId> {
        self.sessions
            .iter()
            .find(|entry| entry.endpoint == endpoint)
            .map(|entry| entry.player_id)
    }

    /// Removes sessions idle longer than `max_idle` and returns their ids so
    /// the caller can cascade removal into derived state.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<PlayerId> {
        let idle: Vec<PlayerId> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_idle(max_idle))
            .map(|entry| entry.player_id)
            .collect();

        for player_id in &idle {
            if self.sessions.remove(player_id).is_some() {
                info!("Voice session for {} expired after inactivity", player_id);
            }
        }

        idle
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
