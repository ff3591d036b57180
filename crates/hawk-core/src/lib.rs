//! Shared leaf types for pixel-hawk: tile geometry, the fixed canvas
//! palette, and the small sum types persisted as integers.

pub mod geometry;
pub mod palette;

pub use geometry::{GeometryError, Point, Rectangle, Size, Tile, GRID_TILES, TILE_SIZE};
pub use palette::{Palette, PaletteError, PalettedImage, PALETTE};

use serde::{Deserialize, Serialize};

/// Heat value marking a tile that has never been successfully fetched.
pub const HEAT_BURNING: i64 = 999;
/// Heat value for tiles no active project references.
pub const HEAT_INACTIVE: i64 = 0;

/// Monitoring state of a project. Stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectState {
    /// Watched; counts toward the owner's quota.
    Active,
    /// Diffed when a tile updates; does not count toward quota.
    Passive,
    /// Not checked at all.
    Inactive,
}

impl ProjectState {
    pub fn as_i64(self) -> i64 {
        match self {
            ProjectState::Active => 0,
            ProjectState::Passive => 1,
            ProjectState::Inactive => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ProjectState::Active),
            1 => Some(ProjectState::Passive),
            2 => Some(ProjectState::Inactive),
            _ => None,
        }
    }
}

/// Outcome classification of a single diff. Stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffStatus {
    NotStarted,
    InProgress,
    Complete,
}

impl DiffStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            DiffStatus::NotStarted => 0,
            DiffStatus::InProgress => 1,
            DiffStatus::Complete => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DiffStatus::NotStarted),
            1 => Some(DiffStatus::InProgress),
            2 => Some(DiffStatus::Complete),
            _ => None,
        }
    }
}

/// Direction of the most recent committed diff activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Streak {
    Progress,
    Regress,
    Mixed,
}

impl Streak {
    pub fn as_i64(self) -> i64 {
        match self {
            Streak::Progress => 0,
            Streak::Regress => 1,
            Streak::Mixed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Streak::Progress),
            1 => Some(Streak::Regress),
            2 => Some(Streak::Mixed),
            _ => None,
        }
    }

    /// Classify a committed event from its deltas. Callers never pass
    /// a zero/zero event; those are discarded before commit.
    pub fn classify(progress: i64, regress: i64) -> Self {
        match (progress > 0, regress > 0) {
            (true, true) => Streak::Mixed,
            (false, true) => Streak::Regress,
            _ => Streak::Progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_integers_are_stable() {
        for state in [
            ProjectState::Active,
            ProjectState::Passive,
            ProjectState::Inactive,
        ] {
            assert_eq!(ProjectState::from_i64(state.as_i64()), Some(state));
        }
        assert_eq!(ProjectState::from_i64(3), None);
    }

    #[test]
    fn diff_status_integers_are_stable() {
        for status in [
            DiffStatus::NotStarted,
            DiffStatus::InProgress,
            DiffStatus::Complete,
        ] {
            assert_eq!(DiffStatus::from_i64(status.as_i64()), Some(status));
        }
    }

    #[test]
    fn streak_classification() {
        assert_eq!(Streak::classify(5, 0), Streak::Progress);
        assert_eq!(Streak::classify(0, 3), Streak::Regress);
        assert_eq!(Streak::classify(2, 2), Streak::Mixed);
    }
}
