//! Counters polled by the external stats publisher.
//!
//! Plain atomics, no metrics framework. Gauges that live in other structures
//! (session count, tracked players, occupied cells) are sampled at snapshot
//! time by the relay.

use dashmap::DashMap;
use shared::PlayerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Window over which a speaker counts as active after sending audio.
pub const SPEAKER_WINDOW: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct RelayStats {
    pub packets_received: AtomicU64,
    pub audio_frames_in: AtomicU64,
    pub frames_relayed: AtomicU64,
    pub auth_accepted: AtomicU64,
    pub auth_rejected: AtomicU64,
    pub slot_denials: AtomicU64,
    pub send_failures: AtomicU64,
    pub malformed_packets: AtomicU64,
    last_audio: DashMap<PlayerId, Instant>,
}

/// Point-in-time sample handed to the stats publisher.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub audio_frames_in: u64,
    pub frames_relayed: u64,
    pub auth_accepted: u64,
    pub auth_rejected: u64,
    pub slot_denials: u64,
    pub send_failures: u64,
    pub malformed_packets: u64,
    pub active_speakers: usize,
    pub authenticated_sessions: usize,
    pub tracked_players: usize,
    pub occupied_cells: usize,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio(&self, speaker: PlayerId) {
        self.audio_frames_in.fetch_add(1, Ordering::Relaxed);
        self.last_audio.insert(speaker, Instant::now());
    }

    pub fn record_relayed(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth(&self, accepted: bool) {
        if accepted {
            self.auth_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_slot_denial(&self) {
        self.slot_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Forgets a speaker, e.g. when their session is swept.
    pub fn forget_speaker(&self, speaker: PlayerId) {
        self.last_audio.remove(&speaker);
    }

    /// Distinct speakers that sent audio within the sampling window. Also
    /// prunes entries that fell out of the window.
    pub fn active_speakers(&self) -> usize {
        let now = Instant::now();
        self.last_audio
            .retain(|_, at| now.duration_since(*at) <= SPEAKER_WINDOW);
        self.last_audio.len()
    }

    pub fn snapshot(
        &self,
        authenticated_sessions: usize,
        tracked_players: usize,
        occupied_cells: usize,
    ) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            audio_frames_in: self.audio_frames_in.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            auth_accepted: self.auth_accepted.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            slot_denials: self.slot_denials.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            active_speakers: self.active_speakers(),
            authenticated_sessions,
            tracked_players,
            occupied_cells,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RelayStats::new();
        stats.record_packet();
        stats.record_packet();
        stats.record_audio(1);
        stats.record_relayed();
        stats.record_auth(true);
        stats.record_auth(false);
        stats.record_slot_denial();

        let snap = stats.snapshot(3, 4, 5);
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.audio_frames_in, 1);
        assert_eq!(snap.frames_relayed, 1);
        assert_eq!(snap.auth_accepted, 1);
        assert_eq!(snap.auth_rejected, 1);
        assert_eq!(snap.slot_denials, 1);
        assert_eq!(snap.authenticated_sessions, 3);
        assert_eq!(snap.tracked_players, 4);
        assert_eq!(snap.occupied_cells, 5);
    }

    #[test]
    fn test_active_speakers_distinct() {
        let stats = RelayStats::new();
        stats.record_audio(1);
        stats.record_audio(1);
        stats.record_audio(2);
        assert_eq!(stats.active_speakers(), 2);

        stats.forget_speaker(1);
        assert_eq!(stats.active_speakers(), 1);
    }
}
