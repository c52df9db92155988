//! Per-world priority settings and speaker/volume arbitration.
//!
//! Once a world's nearby-speaker density crosses its activation threshold,
//! non-favored speakers are attenuated to the configured non-priority volume
//! and muted outright when that volume rounds to silence. Favor comes from a
//! manual per-world list, shared guild membership, or the listener's lock
//! list. Settings are created on first reference with defaults and never
//! deleted; every mutation is followed by `validate()`, which clamps fields
//! into their documented ranges.

use crate::world::AccountSnapshot;
use dashmap::DashMap;
use parking_lot::RwLock;
use shared::{
    PlayerId, SettingCommand, ACTIVATION_THRESHOLD_MAX, ACTIVATION_THRESHOLD_MIN,
    MAX_PRIORITY_PLAYERS_MAX, MAX_PRIORITY_PLAYERS_MIN, NON_PRIORITY_VOLUME_MAX,
    PRIORITY_VOLUME_MAX, SILENCE_EPSILON,
};
use std::collections::HashSet;

/// One world's priority arbitration configuration.
pub struct VoicePrioritySettings {
    pub enable_priority: bool,
    pub max_priority_players: u32,
    pub priority_volume: f32,
    pub non_priority_volume: f32,
    pub guild_members_get_priority: bool,
    pub locked_players_get_priority: bool,
    pub activation_threshold: u32,
    /// Mutated as a unit (add/remove/trim), hence its own lock.
    manual_priority: RwLock<HashSet<PlayerId>>,
}

impl Default for VoicePrioritySettings {
    fn default() -> Self {
        Self {
            enable_priority: true,
            max_priority_players: 10,
            priority_volume: 1.0,
            non_priority_volume: 0.3,
            guild_members_get_priority: true,
            locked_players_get_priority: true,
            activation_threshold: 8,
            manual_priority: RwLock::new(HashSet::new()),
        }
    }
}

impl VoicePrioritySettings {
    /// Clamps every field into its documented range and trims the manual
    /// list down to `max_priority_players`. Idempotent; called after every
    /// mutation.
    pub fn validate(&mut self) {
        self.activation_threshold = self
            .activation_threshold
            .clamp(ACTIVATION_THRESHOLD_MIN, ACTIVATION_THRESHOLD_MAX);
        self.max_priority_players = self
            .max_priority_players
            .clamp(MAX_PRIORITY_PLAYERS_MIN, MAX_PRIORITY_PLAYERS_MAX);
        self.priority_volume = self.priority_volume.clamp(0.0, PRIORITY_VOLUME_MAX);
        self.non_priority_volume = self.non_priority_volume.clamp(0.0, NON_PRIORITY_VOLUME_MAX);

        let mut manual = self.manual_priority.write();
        if manual.len() > self.max_priority_players as usize {
            // Deterministic trim: keep the lowest ids
            let mut ids: Vec<PlayerId> = manual.iter().copied().collect();
            ids.sort_unstable();
            ids.truncate(self.max_priority_players as usize);
            *manual = ids.into_iter().collect();
        }
    }

    /// Applies a decoded configuration command. `AddManual` is rejected once
    /// the manual list is full.
    pub fn apply(&mut self, command: SettingCommand) -> Result<String, String> {
        match command {
            SettingCommand::Enabled(enabled) => {
                self.enable_priority = enabled;
                Ok(format!("Priority {}", if enabled { "enabled" } else { "disabled" }))
            }
            SettingCommand::Threshold(threshold) => {
                self.activation_threshold = threshold;
                Ok(format!("Activation threshold set to {}", threshold))
            }
            SettingCommand::NonPriorityVolume(volume) => {
                self.non_priority_volume = volume;
                Ok(format!("Non-priority volume set to {:.2}", volume))
            }
            SettingCommand::AddManual(player_id) => {
                let mut manual = self.manual_priority.write();
                if manual.contains(&player_id) {
                    return Ok(format!("{} already on the priority list", player_id));
                }
                if manual.len() >= self.max_priority_players as usize {
                    return Err("Manual priority list is full".to_string());
                }
                manual.insert(player_id);
                Ok(format!("{} added to the priority list", player_id))
            }
            SettingCommand::RemoveManual(player_id) => {
                self.manual_priority.write().remove(&player_id);
                Ok(format!("{} removed from the priority list", player_id))
            }
        }
    }

    pub fn manual_contains(&self, player_id: PlayerId) -> bool {
        self.manual_priority.read().contains(&player_id)
    }

    pub fn manual_len(&self) -> usize {
        self.manual_priority.read().len()
    }

    /// Whether `speaker` gets priority over non-favored voices for this
    /// listener. Account snapshots come from the 30s cache.
    pub fn has_priority(
        &self,
        speaker: PlayerId,
        speaker_account: Option<&AccountSnapshot>,
        listener_account: Option<&AccountSnapshot>,
    ) -> bool {
        if self.manual_contains(speaker) {
            return true;
        }

        if self.guild_members_get_priority {
            if let (Some(speaker_account), Some(listener_account)) =
                (speaker_account, listener_account)
            {
                if speaker_account.guild_id != 0
                    && speaker_account.guild_id == listener_account.guild_id
                {
                    return true;
                }
            }
        }

        if self.locked_players_get_priority {
            if let Some(listener_account) = listener_account {
                if listener_account.lock_list.contains(&speaker) {
                    return true;
                }
            }
        }

        false
    }

    pub fn volume_multiplier(&self, has_priority: bool) -> f32 {
        if has_priority {
            self.priority_volume
        } else {
            self.non_priority_volume
        }
    }
}

/// True when a non-priority frame's volume rounds to silence and the send
/// should be skipped entirely.
pub fn should_filter_voice(has_priority: bool, volume: f32) -> bool {
    !has_priority && volume < SILENCE_EPSILON
}

/// Per-world settings registry. Worlds appear on first reference with
/// default settings and live for the process lifetime.
pub struct PriorityRegistry {
    worlds: DashMap<i32, VoicePrioritySettings>,
}

impl PriorityRegistry {
    pub fn new() -> Self {
        Self {
            worlds: DashMap::new(),
        }
    }

    /// Runs `f` against a world's settings, creating defaults on first
    /// reference.
    pub fn with_settings<R>(&self, world_id: i32, f: impl FnOnce(&VoicePrioritySettings) -> R) -> R {
        let settings = self.worlds.entry(world_id).or_default();
        f(&settings)
    }

    /// True iff the world has priority enabled and the nearby count meets
    /// the activation threshold.
    pub fn should_activate(&self, world_id: i32, nearby_count: usize) -> bool {
        self.with_settings(world_id, |settings| {
            settings.enable_priority && nearby_count >= settings.activation_threshold as usize
        })
    }

    /// Applies a configuration command to a world's settings, re-validating
    /// afterwards.
    pub fn configure(&self, world_id: i32, command: SettingCommand) -> Result<String, String> {
        let mut settings = self.worlds.entry(world_id).or_default();
        let result = settings.apply(command);
        settings.validate();
        result
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }
}

impl Default for PriorityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn account(guild_id: u32) -> AccountSnapshot {
        AccountSnapshot {
            guild_id,
            ..AccountSnapshot::default()
        }
    }

    #[test]
    fn test_activation_threshold() {
        let registry = PriorityRegistry::new();
        registry
            .configure(1, SettingCommand::Threshold(8))
            .unwrap();

        assert!(registry.should_activate(1, 9));
        assert!(registry.should_activate(1, 8));
        assert!(!registry.should_activate(1, 7));
    }

    #[test]
    fn test_disabled_priority_never_activates() {
        let registry = PriorityRegistry::new();
        registry
            .configure(1, SettingCommand::Enabled(false))
            .unwrap();
        assert!(!registry.should_activate(1, 100));
    }

    #[test]
    fn test_worlds_created_on_first_reference() {
        let registry = PriorityRegistry::new();
        assert_eq!(registry.world_count(), 0);
        registry.should_activate(3, 0);
        registry.should_activate(4, 0);
        assert_eq!(registry.world_count(), 2);
    }

    #[test]
    fn test_validate_clamps_out_of_range_fields() {
        let mut settings = VoicePrioritySettings::default();
        settings.activation_threshold = 1000;
        settings.max_priority_players = 1;
        settings.priority_volume = 9.0;
        settings.non_priority_volume = -3.0;
        settings.validate();

        assert_eq!(settings.activation_threshold, 30);
        assert_eq!(settings.max_priority_players, 5);
        assert_approx_eq!(settings.priority_volume, 2.0, 1e-6);
        assert_approx_eq!(settings.non_priority_volume, 0.0, 1e-6);
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut settings = VoicePrioritySettings::default();
        settings.activation_threshold = 0;
        settings.validate();
        let once = settings.activation_threshold;
        settings.validate();
        assert_eq!(settings.activation_threshold, once);
    }

    #[test]
    fn test_validate_trims_oversized_manual_list() {
        let mut settings = VoicePrioritySettings::default();
        for id in 0..20u16 {
            settings.manual_priority.get_mut().insert(id);
        }
        settings.max_priority_players = 60; // clamps to 50, list fits
        settings.validate();
        assert_eq!(settings.manual_len(), 20);

        settings.max_priority_players = 1; // clamps to 5, list trims
        settings.validate();
        assert_eq!(settings.manual_len(), 5);
    }

    #[test]
    fn test_manual_add_rejected_when_full() {
        let mut settings = VoicePrioritySettings::default();
        settings.max_priority_players = 5;
        for id in 0..5u16 {
            settings.apply(SettingCommand::AddManual(id)).unwrap();
        }
        assert!(settings.apply(SettingCommand::AddManual(99)).is_err());
        assert_eq!(settings.manual_len(), 5);

        settings.apply(SettingCommand::RemoveManual(0)).unwrap();
        assert!(settings.apply(SettingCommand::AddManual(99)).is_ok());
    }

    #[test]
    fn test_manual_list_grants_priority() {
        let mut settings = VoicePrioritySettings::default();
        settings.apply(SettingCommand::AddManual(7)).unwrap();

        assert!(settings.has_priority(7, None, None));
        assert!(!settings.has_priority(8, None, None));
    }

    #[test]
    fn test_shared_guild_grants_priority() {
        let settings = VoicePrioritySettings::default();
        let speaker = account(12);
        let listener = account(12);
        assert!(settings.has_priority(1, Some(&speaker), Some(&listener)));

        let stranger = account(13);
        assert!(!settings.has_priority(1, Some(&speaker), Some(&stranger)));
    }

    #[test]
    fn test_zero_guild_is_not_shared() {
        let settings = VoicePrioritySettings::default();
        let speaker = account(0);
        let listener = account(0);
        assert!(!settings.has_priority(1, Some(&speaker), Some(&listener)));
    }

    #[test]
    fn test_guild_priority_respects_flag() {
        let mut settings = VoicePrioritySettings::default();
        settings.guild_members_get_priority = false;
        let speaker = account(12);
        let listener = account(12);
        assert!(!settings.has_priority(1, Some(&speaker), Some(&listener)));
    }

    #[test]
    fn test_lock_list_grants_priority() {
        let settings = VoicePrioritySettings::default();
        let mut listener = account(0);
        listener.lock_list.insert(42);

        assert!(settings.has_priority(42, None, Some(&listener)));
        assert!(!settings.has_priority(43, None, Some(&listener)));
    }

    #[test]
    fn test_volume_multiplier() {
        let mut settings = VoicePrioritySettings::default();
        settings.priority_volume = 1.5;
        settings.non_priority_volume = 0.2;

        assert_approx_eq!(settings.volume_multiplier(true), 1.5, 1e-6);
        assert_approx_eq!(settings.volume_multiplier(false), 0.2, 1e-6);
    }

    #[test]
    fn test_silence_filter() {
        assert!(should_filter_voice(false, 0.0));
        assert!(should_filter_voice(false, 0.005));
        assert!(!should_filter_voice(false, 0.2));
        // Priority speakers are never filtered
        assert!(!should_filter_voice(true, 0.0));
    }

    #[test]
    fn test_configure_clamps_threshold() {
        let registry = PriorityRegistry::new();
        registry
            .configure(1, SettingCommand::Threshold(500))
            .unwrap();
        // Clamped, not rejected
        assert!(registry.should_activate(1, 30));
        assert!(!registry.should_activate(1, 29));
    }
}
