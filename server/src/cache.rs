//! Time-bounded caches in front of the position and account collaborators.
//!
//! Audio frames arrive tens of times per second per speaker; these caches pin
//! the cost of "who is near the speaker" and "what does this account look
//! like" to a fixed refresh interval instead of paying it per packet. Within
//! the TTL a cached snapshot is returned verbatim, staleness bounded only by
//! explicit invalidation on account mutations.

use crate::spatial::SpatialGrid;
use crate::world::{AccountSnapshot, BotHandle, DirectoryHandle};
use dashmap::DashMap;
use log::debug;
use shared::{PlayerId, PlayerPosition};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One player near a speaker, with the distance at snapshot time.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub player_id: PlayerId,
    pub position: PlayerPosition,
    pub distance: f32,
}

/// A speaker's nearby-player snapshot.
#[derive(Clone)]
pub struct NearbySnapshot {
    /// Speaker position at fetch time; None if unresolvable.
    pub position: Option<PlayerPosition>,
    pub candidates: Arc<Vec<Candidate>>,
}

struct NearbyEntry {
    fetched_at: Instant,
    snapshot: NearbySnapshot,
}

/// Nearby-player cache backed by the spatial grid.
///
/// A refresh resolves the speaker's position, records it in the grid, and
/// runs a 3x3 neighborhood query, merging any synthetic bots in range. A
/// speaker with no resolvable position caches an empty snapshot so repeated
/// failed lookups stay bounded by the TTL too.
pub struct ProximityCache {
    directory: DirectoryHandle,
    bots: BotHandle,
    grid: Arc<SpatialGrid>,
    entries: DashMap<PlayerId, NearbyEntry>,
    ttl: Duration,
    range: f32,
}

impl ProximityCache {
    pub fn new(
        directory: DirectoryHandle,
        bots: BotHandle,
        grid: Arc<SpatialGrid>,
        ttl: Duration,
        range: f32,
    ) -> Self {
        Self {
            directory,
            bots,
            grid,
            entries: DashMap::new(),
            ttl,
            range,
        }
    }

    /// Returns the speaker's cached nearby snapshot, refreshing it when the
    /// entry is older than the TTL.
    pub fn nearby(&self, speaker: PlayerId) -> NearbySnapshot {
        if let Some(entry) = self.entries.get(&speaker) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.snapshot.clone();
            }
        }
        self.refresh(speaker)
    }

    fn refresh(&self, speaker: PlayerId) -> NearbySnapshot {
        let position = self
            .directory
            .resolve_position(speaker)
            .or_else(|| self.bots.position_of(speaker));

        let snapshot = match position {
            Some(position) => {
                self.grid.update(speaker, position);

                let mut candidates: Vec<Candidate> = self
                    .grid
                    .query(position.x, position.y, self.range, position.world_id)
                    .into_iter()
                    .filter(|(id, _, _)| *id != speaker)
                    .map(|(player_id, position, distance)| Candidate {
                        player_id,
                        position,
                        distance,
                    })
                    .collect();

                for (bot_id, bot_pos, distance) in
                    self.bots
                        .bots_in_range(position.x, position.y, position.world_id, self.range)
                {
                    if bot_id == speaker || candidates.iter().any(|c| c.player_id == bot_id) {
                        continue;
                    }
                    candidates.push(Candidate {
                        player_id: bot_id,
                        position: bot_pos,
                        distance,
                    });
                }

                NearbySnapshot {
                    position: Some(position),
                    candidates: Arc::new(candidates),
                }
            }
            None => {
                debug!("No resolvable position for speaker {}", speaker);
                NearbySnapshot {
                    position: None,
                    candidates: Arc::new(Vec::new()),
                }
            }
        };

        self.entries.insert(
            speaker,
            NearbyEntry {
                fetched_at: Instant::now(),
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    /// Drops the cached entry so the next lookup refreshes.
    pub fn invalidate(&self, speaker: PlayerId) {
        self.entries.remove(&speaker);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct AccountEntry {
    fetched_at: Instant,
    snapshot: Option<Arc<AccountSnapshot>>,
}

/// Account snapshot cache in front of the account store, 30s TTL.
pub struct AccountCache {
    directory: DirectoryHandle,
    entries: DashMap<PlayerId, AccountEntry>,
    ttl: Duration,
}

impl AccountCache {
    pub fn new(directory: DirectoryHandle, ttl: Duration) -> Self {
        Self {
            directory,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached account snapshot; unknown accounts are negatively cached for
    /// the same TTL.
    pub fn snapshot(&self, account_id: PlayerId) -> Option<Arc<AccountSnapshot>> {
        if let Some(entry) = self.entries.get(&account_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.snapshot.clone();
            }
        }

        let snapshot = self.directory.account_snapshot(account_id).map(Arc::new);
        self.entries.insert(
            account_id,
            AccountEntry {
                fetched_at: Instant::now(),
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    /// Called when the owning subsystem reports an account mutation, e.g. an
    /// ignore-list change.
    pub fn invalidate(&self, account_id: PlayerId) {
        self.entries.remove(&account_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{InMemoryDirectory, NoTestBots, SimTestBots};
    use std::thread::sleep;

    fn setup(ttl_ms: u64) -> (Arc<InMemoryDirectory>, ProximityCache) {
        let directory = Arc::new(InMemoryDirectory::new());
        let grid = Arc::new(SpatialGrid::new(15.0));
        let cache = ProximityCache::new(
            directory.clone(),
            Arc::new(NoTestBots),
            grid,
            Duration::from_millis(ttl_ms),
            15.0,
        );
        (directory, cache)
    }

    #[test]
    fn test_nearby_finds_in_range_player() {
        let (directory, cache) = setup(200);
        directory.set_position(1, PlayerPosition::new(100.0, 100.0, 1));
        directory.set_position(2, PlayerPosition::new(105.0, 100.0, 1));

        // Prime the grid with the listener's position
        cache.nearby(2);

        let snapshot = cache.nearby(1);
        assert!(snapshot.position.is_some());
        let candidate = snapshot
            .candidates
            .iter()
            .find(|c| c.player_id == 2)
            .expect("player 2 nearby");
        assert!((candidate.distance - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_snapshot_is_stable_within_ttl() {
        let (directory, cache) = setup(500);
        directory.set_position(1, PlayerPosition::new(0.0, 0.0, 1));
        directory.set_position(2, PlayerPosition::new(5.0, 0.0, 1));
        cache.nearby(2);

        let first = cache.nearby(1);
        assert_eq!(first.candidates.len(), 1);

        // The move is invisible until the entry expires
        directory.set_position(2, PlayerPosition::new(200.0, 200.0, 1));
        let second = cache.nearby(1);
        assert_eq!(second.candidates.len(), 1);
        assert!(Arc::ptr_eq(&first.candidates, &second.candidates));
    }

    #[test]
    fn test_expired_entry_recomputes() {
        let (directory, cache) = setup(50);
        directory.set_position(1, PlayerPosition::new(0.0, 0.0, 1));
        directory.set_position(2, PlayerPosition::new(5.0, 0.0, 1));
        cache.nearby(2);
        assert_eq!(cache.nearby(1).candidates.len(), 1);

        directory.set_position(2, PlayerPosition::new(200.0, 200.0, 1));
        sleep(Duration::from_millis(60));
        // Listener refresh migrates them in the grid, speaker refresh re-queries
        cache.nearby(2);
        assert!(cache.nearby(1).candidates.is_empty());
    }

    #[test]
    fn test_unresolvable_speaker_is_negatively_cached() {
        let (directory, cache) = setup(200);
        let snapshot = cache.nearby(9);
        assert!(snapshot.position.is_none());
        assert!(snapshot.candidates.is_empty());
        assert_eq!(cache.len(), 1);

        // A position appearing mid-TTL stays invisible until expiry
        directory.set_position(9, PlayerPosition::new(1.0, 1.0, 1));
        assert!(cache.nearby(9).position.is_none());
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let (directory, cache) = setup(60_000);
        directory.set_position(1, PlayerPosition::new(0.0, 0.0, 1));
        assert!(cache.nearby(1).candidates.is_empty());

        directory.set_position(2, PlayerPosition::new(3.0, 0.0, 1));
        cache.nearby(2);
        cache.invalidate(1);
        assert_eq!(cache.nearby(1).candidates.len(), 1);
    }

    #[test]
    fn test_synthetic_bots_merge_into_candidates() {
        let directory = Arc::new(InMemoryDirectory::new());
        let bots = Arc::new(SimTestBots::new());
        let grid = Arc::new(SpatialGrid::new(15.0));
        let cache = ProximityCache::new(
            directory.clone(),
            bots.clone(),
            grid,
            Duration::from_millis(200),
            15.0,
        );

        directory.set_position(1, PlayerPosition::new(0.0, 0.0, 1));
        bots.register(60_001, PlayerPosition::new(4.0, 0.0, 1));
        bots.register(60_002, PlayerPosition::new(400.0, 0.0, 1));

        let snapshot = cache.nearby(1);
        assert!(snapshot.candidates.iter().any(|c| c.player_id == 60_001));
        assert!(!snapshot.candidates.iter().any(|c| c.player_id == 60_002));
    }

    #[test]
    fn test_bot_speaker_position_fallback() {
        let directory = Arc::new(InMemoryDirectory::new());
        let bots = Arc::new(SimTestBots::new());
        let grid = Arc::new(SpatialGrid::new(15.0));
        let cache = ProximityCache::new(
            directory,
            bots.clone(),
            grid,
            Duration::from_millis(200),
            15.0,
        );

        bots.register(60_001, PlayerPosition::new(7.0, 8.0, 2));
        let snapshot = cache.nearby(60_001);
        let pos = snapshot.position.expect("bot position");
        assert_eq!(pos.world_id, 2);
    }

    #[test]
    fn test_account_cache_ttl_and_invalidation() {
        let directory = Arc::new(InMemoryDirectory::new());
        let cache = AccountCache::new(directory.clone(), Duration::from_millis(60_000));

        assert!(cache.snapshot(1).is_none());

        let mut account = AccountSnapshot::default();
        account.guild_id = 44;
        directory.set_account(1, account);

        // Negative entry still within TTL
        assert!(cache.snapshot(1).is_none());

        cache.invalidate(1);
        assert_eq!(cache.snapshot(1).unwrap().guild_id, 44);
    }

    #[test]
    fn test_account_cache_expiry() {
        let directory = Arc::new(InMemoryDirectory::new());
        let cache = AccountCache::new(directory.clone(), Duration::from_millis(40));

        let mut account = AccountSnapshot::default();
        account.guild_id = 7;
        directory.set_account(1, account);
        assert_eq!(cache.snapshot(1).unwrap().guild_id, 7);

        let mut updated = AccountSnapshot::default();
        updated.guild_id = 8;
        directory.set_account(1, updated);
        assert_eq!(cache.snapshot(1).unwrap().guild_id, 7);

        sleep(Duration::from_millis(50));
        assert_eq!(cache.snapshot(1).unwrap().guild_id, 8);
    }
}
