//! Per-listener speaker-slot admission control.
//!
//! Each listener can hear at most `MAX_SPEAKERS_PER_LISTENER` speakers at
//! once; the table self-corrects toward the closest-K set. Slot tables are
//! independent per listener, so admission needs no global coordination. The
//! farthest-eviction read-then-write runs under the listener's own entry
//! lock, which is what keeps concurrent claims from admitting an 11th
//! speaker.

use dashmap::DashMap;
use shared::PlayerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    distance: f32,
    last_seen: Instant,
}

/// Bounded per-listener speaker tables.
pub struct SpeakerSlots {
    tables: DashMap<PlayerId, HashMap<PlayerId, SlotEntry>>,
    capacity: usize,
    stale_after: Duration,
}

impl SpeakerSlots {
    pub fn new(capacity: usize, stale_after: Duration) -> Self {
        Self {
            tables: DashMap::new(),
            capacity,
            stale_after,
        }
    }

    /// Attempts to claim (or refresh) a slot for `speaker` in `listener`'s
    /// table. Returns false when the listener is at capacity with speakers
    /// at least as close.
    pub fn try_claim(&self, listener: PlayerId, speaker: PlayerId, distance: f32) -> bool {
        let mut table = self.tables.entry(listener).or_default();
        let now = Instant::now();

        // Lazy eviction of slots that stopped being refreshed
        table.retain(|_, slot| now.duration_since(slot.last_seen) <= self.stale_after);

        if let Some(slot) = table.get_mut(&speaker) {
            slot.distance = distance;
            slot.last_seen = now;
            return true;
        }

        if table.len() < self.capacity {
            table.insert(
                speaker,
                SlotEntry {
                    distance,
                    last_seen: now,
                },
            );
            return true;
        }

        // Full: displace the farthest occupant only if strictly closer
        let farthest = table
            .iter()
            .max_by(|a, b| a.1.distance.total_cmp(&b.1.distance))
            .map(|(id, slot)| (*id, slot.distance));

        if let Some((farthest_id, farthest_distance)) = farthest {
            if distance < farthest_distance {
                table.remove(&farthest_id);
                table.insert(
                    speaker,
                    SlotEntry {
                        distance,
                        last_seen: now,
                    },
                );
                return true;
            }
        }

        false
    }

    /// Drops a listener's whole table, e.g. when their session expires.
    pub fn remove_listener(&self, listener: PlayerId) {
        self.tables.remove(&listener);
    }

    /// Releases every slot a departing speaker holds across listeners.
    pub fn remove_speaker(&self, speaker: PlayerId) {
        for mut table in self.tables.iter_mut() {
            table.remove(&speaker);
        }
    }

    /// Number of live (non-stale) slots currently held for a listener.
    pub fn held_slots(&self, listener: PlayerId) -> usize {
        let now = Instant::now();
        self.tables
            .get(&listener)
            .map(|table| {
                table
                    .values()
                    .filter(|slot| now.duration_since(slot.last_seen) <= self.stale_after)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn holds_slot(&self, listener: PlayerId, speaker: PlayerId) -> bool {
        self.tables
            .get(&listener)
            .map(|table| table.contains_key(&speaker))
            .unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn slots() -> SpeakerSlots {
        SpeakerSlots::new(10, Duration::from_millis(500))
    }

    #[test]
    fn test_claims_up_to_capacity() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, speaker as f32));
        }
        assert_eq!(s.held_slots(100), 10);
    }

    #[test]
    fn test_eleventh_farther_speaker_is_denied() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, speaker as f32));
        }

        assert!(!s.try_claim(100, 11, 11.0));
        assert_eq!(s.held_slots(100), 10);
        for speaker in 1..=10 {
            assert!(s.holds_slot(100, speaker));
        }
        assert!(!s.holds_slot(100, 11));
    }

    #[test]
    fn test_closer_speaker_displaces_farthest() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, (speaker * 10) as f32));
        }

        // Distance 5 beats the farthest occupant at 100
        assert!(s.try_claim(100, 50, 5.0));
        assert_eq!(s.held_slots(100), 10);
        assert!(s.holds_slot(100, 50));
        assert!(!s.holds_slot(100, 10));
    }

    #[test]
    fn test_equal_distance_does_not_displace() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, 10.0));
        }
        // Strictly closer is required
        assert!(!s.try_claim(100, 11, 10.0));
    }

    #[test]
    fn test_held_slot_refreshes() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, speaker as f32));
        }
        // Speaker 10 re-claims at a new distance while the table is full
        assert!(s.try_claim(100, 10, 2.5));
        assert_eq!(s.held_slots(100), 10);
    }

    #[test]
    fn test_stale_slots_evicted_before_capacity_check() {
        let s = SpeakerSlots::new(10, Duration::from_millis(30));
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, speaker as f32));
        }

        sleep(Duration::from_millis(40));
        // All prior slots are stale; a far speaker gets in cleanly
        assert!(s.try_claim(100, 99, 500.0));
        assert_eq!(s.held_slots(100), 1);
    }

    #[test]
    fn test_tables_are_per_listener() {
        let s = slots();
        for speaker in 1..=10 {
            assert!(s.try_claim(100, speaker, speaker as f32));
        }
        // Listener 200 has its own budget
        assert!(s.try_claim(200, 42, 99.0));
    }

    #[test]
    fn test_remove_speaker_cascades() {
        let s = slots();
        s.try_claim(100, 7, 1.0);
        s.try_claim(200, 7, 2.0);
        s.remove_speaker(7);
        assert!(!s.holds_slot(100, 7));
        assert!(!s.holds_slot(200, 7));
    }

    #[test]
    fn test_remove_listener_drops_table() {
        let s = slots();
        s.try_claim(100, 1, 1.0);
        s.remove_listener(100);
        assert_eq!(s.held_slots(100), 0);
        assert_eq!(s.listener_count(), 0);
    }

    #[test]
    fn test_closest_ten_of_eleven_hold_slots() {
        let s = slots();
        // 11 speakers at distances 1..11: the closest 10 win
        for speaker in 1..=11u16 {
            s.try_claim(100, speaker, speaker as f32);
        }
        assert_eq!(s.held_slots(100), 10);
        for speaker in 1..=10 {
            assert!(s.holds_slot(100, speaker));
        }
        assert!(!s.holds_slot(100, 11));
    }

    #[test]
    fn test_concurrent_claims_never_exceed_capacity() {
        use std::sync::Arc;
        let s = Arc::new(slots());
        let mut handles = Vec::new();
        for t in 0..4u16 {
            let s = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                for speaker in 0..50u16 {
                    s.try_claim(100, t * 100 + speaker, (speaker % 20) as f32);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(s.held_slots(100) <= 10);
    }
}
