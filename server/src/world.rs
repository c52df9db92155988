//! Seams to the surrounding game: position, liveness, and account lookups.
//!
//! The relay never walks the game simulation or the persistence store
//! directly; it consumes them through `GameDirectory`. Synthetic load testing
//! goes through `TestBotProvider`, an injected collaborator that replaces the
//! original process-wide test-mode flag. Production installs `NoTestBots`.

use dashmap::DashMap;
use shared::{PlayerId, PlayerPosition, TEST_BOT_ID_FLOOR};
use std::collections::HashSet;
use std::sync::Arc;

/// Account state the relay needs for arbitration and filtering.
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub ignore_list: HashSet<PlayerId>,
    /// Zero means no guild.
    pub guild_id: u32,
    pub lock_list: HashSet<PlayerId>,
    /// Secondary credential checked on AUTH, distinct from the game login.
    pub voice_credential: String,
}

/// Read-only view of the game process and account store.
pub trait GameDirectory: Send + Sync {
    /// Current position of a player, or None if offline.
    fn resolve_position(&self, player_id: PlayerId) -> Option<PlayerPosition>;

    /// Whether the player has an active, connected game session.
    fn is_session_active(&self, player_id: PlayerId) -> bool;

    /// Account snapshot for arbitration: ignore list, guild, lock list,
    /// voice credential.
    fn account_snapshot(&self, player_id: PlayerId) -> Option<AccountSnapshot>;
}

/// Synthetic bots injected for load and soak testing.
pub trait TestBotProvider: Send + Sync {
    /// Whether this id belongs to a synthetic bot. Bots skip the voice
    /// credential check on AUTH.
    fn is_test_bot(&self, player_id: PlayerId) -> bool;

    /// Synthetic position registered for a bot id.
    fn position_of(&self, player_id: PlayerId) -> Option<PlayerPosition>;

    /// Bots within `range` of a point, with their distances.
    fn bots_in_range(
        &self,
        x: f32,
        y: f32,
        world_id: i32,
        range: f32,
    ) -> Vec<(PlayerId, PlayerPosition, f32)>;
}

/// Production default: no synthetic bots anywhere.
pub struct NoTestBots;

impl TestBotProvider for NoTestBots {
    fn is_test_bot(&self, _player_id: PlayerId) -> bool {
        false
    }

    fn position_of(&self, _player_id: PlayerId) -> Option<PlayerPosition> {
        None
    }

    fn bots_in_range(
        &self,
        _x: f32,
        _y: f32,
        _world_id: i32,
        _range: f32,
    ) -> Vec<(PlayerId, PlayerPosition, f32)> {
        Vec::new()
    }
}

/// Bot provider backed by a registry of fixed positions, for test builds and
/// the `--test-mode` server flag. Only ids in the reserved high id-space are
/// accepted.
pub struct SimTestBots {
    bots: DashMap<PlayerId, PlayerPosition>,
}

impl SimTestBots {
    pub fn new() -> Self {
        Self {
            bots: DashMap::new(),
        }
    }

    pub fn register(&self, player_id: PlayerId, position: PlayerPosition) {
        debug_assert!(player_id >= TEST_BOT_ID_FLOOR);
        self.bots.insert(player_id, position);
    }

    pub fn unregister(&self, player_id: PlayerId) {
        self.bots.remove(&player_id);
    }
}

impl Default for SimTestBots {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBotProvider for SimTestBots {
    fn is_test_bot(&self, player_id: PlayerId) -> bool {
        player_id >= TEST_BOT_ID_FLOOR
    }

    fn position_of(&self, player_id: PlayerId) -> Option<PlayerPosition> {
        self.bots.get(&player_id).map(|p| *p)
    }

    fn bots_in_range(
        &self,
        x: f32,
        y: f32,
        world_id: i32,
        range: f32,
    ) -> Vec<(PlayerId, PlayerPosition, f32)> {
        let origin = PlayerPosition::new(x, y, world_id);
        self.bots
            .iter()
            .filter(|entry| entry.world_id == world_id)
            .filter_map(|entry| {
                let distance = origin.distance_to(entry.value());
                (distance <= range).then(|| (*entry.key(), *entry.value(), distance))
            })
            .collect()
    }
}

/// In-memory directory used by tests and the demo binary. A real deployment
/// wires the game process in behind `GameDirectory` instead.
pub struct InMemoryDirectory {
    positions: DashMap<PlayerId, PlayerPosition>,
    accounts: DashMap<PlayerId, AccountSnapshot>,
    active: DashMap<PlayerId, ()>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            accounts: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn set_position(&self, player_id: PlayerId, position: PlayerPosition) {
        self.positions.insert(player_id, position);
    }

    pub fn clear_position(&self, player_id: PlayerId) {
        self.positions.remove(&player_id);
    }

    pub fn set_account(&self, player_id: PlayerId, account: AccountSnapshot) {
        self.accounts.insert(player_id, account);
    }

    pub fn set_active(&self, player_id: PlayerId, active: bool) {
        if active {
            self.active.insert(player_id, ());
        } else {
            self.active.remove(&player_id);
        }
    }

    /// Registers a player with a position, credential, and active session in
    /// one call.
    pub fn add_player(&self, player_id: PlayerId, position: PlayerPosition, credential: &str) {
        self.set_position(player_id, position);
        self.set_account(
            player_id,
            AccountSnapshot {
                voice_credential: credential.to_string(),
                ..AccountSnapshot::default()
            },
        );
        self.set_active(player_id, true);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl GameDirectory for InMemoryDirectory {
    fn resolve_position(&self, player_id: PlayerId) -> Option<PlayerPosition> {
        self.positions.get(&player_id).map(|p| *p)
    }

    fn is_session_active(&self, player_id: PlayerId) -> bool {
        self.active.contains_key(&player_id)
    }

    fn account_snapshot(&self, player_id: PlayerId) -> Option<AccountSnapshot> {
        self.accounts.get(&player_id).map(|a| a.clone())
    }
}

/// Shared handles used throughout the relay.
pub type DirectoryHandle = Arc<dyn GameDirectory>;
pub type BotHandle = Arc<dyn TestBotProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_test_bots_is_inert() {
        let bots = NoTestBots;
        assert!(!bots.is_test_bot(TEST_BOT_ID_FLOOR));
        assert!(bots.position_of(TEST_BOT_ID_FLOOR).is_none());
        assert!(bots.bots_in_range(0.0, 0.0, 1, 100.0).is_empty());
    }

    #[test]
    fn test_sim_bots_only_claim_reserved_ids() {
        let bots = SimTestBots::new();
        assert!(bots.is_test_bot(TEST_BOT_ID_FLOOR));
        assert!(bots.is_test_bot(65_000));
        assert!(!bots.is_test_bot(TEST_BOT_ID_FLOOR - 1));
    }

    #[test]
    fn test_sim_bots_range_query() {
        let bots = SimTestBots::new();
        bots.register(60_001, PlayerPosition::new(10.0, 0.0, 1));
        bots.register(60_002, PlayerPosition::new(100.0, 0.0, 1));
        bots.register(60_003, PlayerPosition::new(11.0, 0.0, 2));

        let found = bots.bots_in_range(0.0, 0.0, 1, 15.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 60_001);

        bots.unregister(60_001);
        assert!(bots.bots_in_range(0.0, 0.0, 1, 15.0).is_empty());
    }

    #[test]
    fn test_in_memory_directory_roundtrip() {
        let dir = InMemoryDirectory::new();
        dir.add_player(5, PlayerPosition::new(1.0, 2.0, 3), "secret");

        let pos = dir.resolve_position(5).unwrap();
        assert_eq!(pos.world_id, 3);
        assert!(dir.is_session_active(5));
        assert_eq!(dir.account_snapshot(5).unwrap().voice_credential, "secret");

        dir.set_active(5, false);
        assert!(!dir.is_session_active(5));
        dir.clear_position(5);
        assert!(dir.resolve_position(5).is_none());
    }
}
