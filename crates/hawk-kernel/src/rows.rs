//! Row types and mappers for the kernel tables.

use hawk_core::{DiffStatus, Point, ProjectState, Rectangle, Size, Streak, Tile};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub discord_id: Option<i64>,
    pub access: i64,
    pub watched_tiles_count: i64,
    pub active_projects_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub owner_id: i64,
    /// Owner display name, joined in for log attribution.
    pub owner_name: String,
    pub name: String,
    pub state: ProjectState,
    pub rect: Rectangle,
    pub first_seen: i64,
    pub last_check: i64,
    pub last_snapshot: i64,
    pub max_completion_pixels: i64,
    pub max_completion_percent: f64,
    pub max_completion_time: i64,
    pub total_progress: i64,
    pub total_regress: i64,
    pub largest_regress_pixels: i64,
    pub largest_regress_time: i64,
    pub streak: Streak,
    pub last_log_message: String,
}

impl Project {
    /// Filename token shared by target and snapshot files.
    pub fn coords_token(&self) -> String {
        Point::new(self.rect.x, self.rect.y).coords_token()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileRecord {
    pub id: i64,
    pub x: i64,
    pub y: i64,
    pub heat: i64,
    pub last_checked: i64,
    pub last_update: i64,
    pub etag: String,
}

impl TileRecord {
    pub fn new(tile: Tile) -> Self {
        Self {
            id: tile.id(),
            x: tile.x as i64,
            y: tile.y as i64,
            heat: hawk_core::HEAT_BURNING,
            last_checked: 0,
            last_update: 0,
            etag: String::new(),
        }
    }

    pub fn tile(&self) -> Tile {
        Tile::new(self.x as u32, self.y as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryChange {
    pub id: i64,
    pub project_id: i64,
    pub timestamp: i64,
    pub status: DiffStatus,
    pub pixels_remaining: i64,
    pub pixels_target: i64,
    pub completion_percent: f64,
    pub progress_pixels: i64,
    pub regress_pixels: i64,
}

/// One diff's result, ready to be committed.
#[derive(Debug, Clone)]
pub struct DiffCommit {
    pub timestamp: i64,
    pub status: DiffStatus,
    pub pixels_remaining: i64,
    pub pixels_target: i64,
    pub completion_percent: f64,
    pub progress_pixels: i64,
    pub regress_pixels: i64,
    pub log_message: String,
}

pub(crate) const PROJECT_COLUMNS: &str = "p.id, p.owner_id, per.name, p.name, p.state, \
    p.x, p.y, p.width, p.height, p.first_seen, p.last_check, p.last_snapshot, \
    p.max_completion_pixels, p.max_completion_percent, p.max_completion_time, \
    p.total_progress, p.total_regress, p.largest_regress_pixels, p.largest_regress_time, \
    p.streak, p.last_log_message";

fn bad_column(idx: usize, what: &'static str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Integer,
        what.into(),
    )
}

pub(crate) fn map_person(row: &Row) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        discord_id: row.get(2)?,
        access: row.get(3)?,
        watched_tiles_count: row.get(4)?,
        active_projects_count: row.get(5)?,
    })
}

pub(crate) fn map_project(row: &Row) -> rusqlite::Result<Project> {
    let state_raw: i64 = row.get(4)?;
    let streak_raw: i64 = row.get(19)?;
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_name: row.get(2)?,
        name: row.get(3)?,
        state: ProjectState::from_i64(state_raw)
            .ok_or_else(|| bad_column(4, "unknown project state"))?,
        rect: Rectangle::from_point_size(
            Point::new(row.get::<_, i64>(5)? as u32, row.get::<_, i64>(6)? as u32),
            Size::new(row.get::<_, i64>(7)? as u32, row.get::<_, i64>(8)? as u32),
        ),
        first_seen: row.get(9)?,
        last_check: row.get(10)?,
        last_snapshot: row.get(11)?,
        max_completion_pixels: row.get(12)?,
        max_completion_percent: row.get(13)?,
        max_completion_time: row.get(14)?,
        total_progress: row.get(15)?,
        total_regress: row.get(16)?,
        largest_regress_pixels: row.get(17)?,
        largest_regress_time: row.get(18)?,
        streak: Streak::from_i64(streak_raw)
            .ok_or_else(|| bad_column(19, "unknown streak value"))?,
        last_log_message: row.get(20)?,
    })
}

pub(crate) fn map_tile(row: &Row) -> rusqlite::Result<TileRecord> {
    Ok(TileRecord {
        id: row.get(0)?,
        x: row.get(1)?,
        y: row.get(2)?,
        heat: row.get(3)?,
        last_checked: row.get(4)?,
        last_update: row.get(5)?,
        etag: row.get(6)?,
    })
}

pub(crate) fn map_history(row: &Row) -> rusqlite::Result<HistoryChange> {
    let status_raw: i64 = row.get(3)?;
    Ok(HistoryChange {
        id: row.get(0)?,
        project_id: row.get(1)?,
        timestamp: row.get(2)?,
        status: DiffStatus::from_i64(status_raw)
            .ok_or_else(|| bad_column(3, "unknown diff status"))?,
        pixels_remaining: row.get(4)?,
        pixels_target: row.get(5)?,
        completion_percent: row.get(6)?,
        progress_pixels: row.get(7)?,
        regress_pixels: row.get(8)?,
    })
}
