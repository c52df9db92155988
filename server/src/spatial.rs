//! Uniform spatial hash over world positions for O(1) proximity queries.
//!
//! Players are bucketed into square cells of `CELL_SIZE` world units. A query
//! enumerates the 3x3 block of cells around the query point and filters by
//! exact Euclidean distance, so as long as the cell size is at least the
//! maximum voice range no in-range player can be missed. Cells are created
//! lazily and pruned opportunistically; pruning is hygiene, not correctness.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::{PlayerId, PlayerPosition};
use std::collections::HashMap;

/// Cell coordinate derived from a world position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellCoord {
    x: i32,
    y: i32,
}

/// Spatial hash grid shared across packet tasks.
///
/// Both maps are guarded at entry granularity; updates for different players
/// in different cells never contend.
pub struct SpatialGrid {
    cell_size: f32,
    cells: DashMap<CellCoord, HashMap<PlayerId, PlayerPosition>>,
    tracked: DashMap<PlayerId, CellCoord>,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: cell_size.max(1.0),
            cells: DashMap::new(),
            tracked: DashMap::new(),
        }
    }

    fn cell_for(&self, x: f32, y: f32) -> CellCoord {
        CellCoord {
            x: (x / self.cell_size).floor() as i32,
            y: (y / self.cell_size).floor() as i32,
        }
    }

    /// Records a player's most recent position, migrating them between cells
    /// when they cross a cell boundary.
    ///
    /// The player's `tracked` entry guard is held across both cell mutations,
    /// so concurrent update/remove calls for one player serialize and the
    /// one-cell-per-player invariant holds. Both paths lock tracked before
    /// cells, never the reverse.
    pub fn update(&self, player_id: PlayerId, position: PlayerPosition) {
        let new_cell = self.cell_for(position.x, position.y);

        match self.tracked.entry(player_id) {
            Entry::Occupied(mut entry) => {
                let old_cell = *entry.get();
                if old_cell != new_cell {
                    if let Some(mut members) = self.cells.get_mut(&old_cell) {
                        members.remove(&player_id);
                    }
                    entry.insert(new_cell);
                }
                self.cells
                    .entry(new_cell)
                    .or_default()
                    .insert(player_id, position);
            }
            Entry::Vacant(entry) => {
                self.cells
                    .entry(new_cell)
                    .or_default()
                    .insert(player_id, position);
                entry.insert(new_cell);
            }
        }
    }

    /// Removes a player from the grid. No-op if untracked.
    pub fn remove(&self, player_id: PlayerId) {
        if let Entry::Occupied(entry) = self.tracked.entry(player_id) {
            let cell = *entry.get();
            if let Some(mut members) = self.cells.get_mut(&cell) {
                members.remove(&player_id);
            }
            entry.remove();
        }
    }

    /// Returns every tracked player within `max_range` of `(x, y)` in
    /// `world_id`, with their exact distance. The query point's own entry is
    /// included if tracked and in range.
    pub fn query(
        &self,
        x: f32,
        y: f32,
        max_range: f32,
        world_id: i32,
    ) -> Vec<(PlayerId, PlayerPosition, f32)> {
        let center = self.cell_for(x, y);
        let origin = PlayerPosition::new(x, y, world_id);
        let mut found = Vec::new();

        for dx in -1..=1 {
            for dy in -1..=1 {
                let cell = CellCoord {
                    x: center.x + dx,
                    y: center.y + dy,
                };
                if let Some(members) = self.cells.get(&cell) {
                    for (&player_id, position) in members.iter() {
                        if position.world_id != world_id {
                            continue;
                        }
                        let distance = origin.distance_to(position);
                        if distance <= max_range {
                            found.push((player_id, *position, distance));
                        }
                    }
                }
            }
        }

        found
    }

    /// Drops cells with no members. Emptiness is re-checked under the entry
    /// lock, so a concurrent insert cannot lose its cell.
    pub fn cleanup_empty_cells(&self) {
        self.cells.retain(|_, members| !members.is_empty());
    }

    /// Number of tracked players.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Number of allocated cells, including empty ones awaiting cleanup.
    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }
}
