//! Geometric primitives for tile math and coordinate conversion.
//!
//! The canvas is a 2048x2048 lattice of tiles, each tile covering
//! 1000x1000 pixels. Project files encode their anchor as a
//! `(tx, ty, px, py)` tuple in the filename; everything internal works
//! in absolute canvas-pixel coordinates.

use serde::{Deserialize, Serialize};

/// Pixels per tile edge.
pub const TILE_SIZE: u32 = 1000;
/// Tiles per canvas edge.
pub const GRID_TILES: u32 = 2048;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("tile coordinate out of range: ({0}, {1})")]
    TileOutOfRange(u32, u32),
    #[error("pixel offset out of range: ({0}, {1})")]
    PixelOutOfRange(u32, u32),
}

/// A tile in the canvas lattice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Stable database key: `x * 10000 + y`.
    pub fn id(&self) -> i64 {
        self.x as i64 * 10_000 + self.y as i64
    }

    pub fn from_id(id: i64) -> Self {
        Self {
            x: (id / 10_000) as u32,
            y: (id % 10_000) as u32,
        }
    }

    /// Canvas-pixel coordinate of an offset within this tile.
    pub fn to_point(&self, px: u32, py: u32) -> Point {
        Point {
            x: self.x * TILE_SIZE + px,
            y: self.y * TILE_SIZE + py,
        }
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}

/// A pixel point in canvas space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Build from the `(tx, ty, px, py)` tuple used in project filenames.
    pub fn from4(tx: u32, ty: u32, px: u32, py: u32) -> Result<Self, GeometryError> {
        if tx >= GRID_TILES || ty >= GRID_TILES {
            return Err(GeometryError::TileOutOfRange(tx, ty));
        }
        if px >= TILE_SIZE || py >= TILE_SIZE {
            return Err(GeometryError::PixelOutOfRange(px, py));
        }
        Ok(Self {
            x: tx * TILE_SIZE + px,
            y: ty * TILE_SIZE + py,
        })
    }

    /// Decompose into the `(tx, ty, px, py)` filename tuple.
    pub fn to4(&self) -> (u32, u32, u32, u32) {
        (
            self.x / TILE_SIZE,
            self.y / TILE_SIZE,
            self.x % TILE_SIZE,
            self.y % TILE_SIZE,
        )
    }

    /// Filename token, e.g. `"12_7_340_951"`.
    pub fn coords_token(&self) -> String {
        let (tx, ty, px, py) = self.to4();
        format!("{tx}_{ty}_{px}_{py}")
    }
}

/// A pixel size.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    pub fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn area(&self) -> usize {
        self.w as usize * self.h as usize
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// An axis-aligned pixel rectangle in canvas space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rectangle {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_point_size(point: Point, size: Size) -> Self {
        Self {
            x: point.x,
            y: point.y,
            w: size.w,
            h: size.h,
        }
    }

    pub fn point(&self) -> Point {
        Point {
            x: self.x,
            y: self.y,
        }
    }

    pub fn size(&self) -> Size {
        Size {
            w: self.w,
            h: self.h,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Tiles this rectangle intersects, row-major.
    pub fn tiles(&self) -> Vec<Tile> {
        if self.is_empty() {
            return Vec::new();
        }
        let left = self.x / TILE_SIZE;
        let top = self.y / TILE_SIZE;
        let right = (self.right() + TILE_SIZE - 1) / TILE_SIZE;
        let bottom = (self.bottom() + TILE_SIZE - 1) / TILE_SIZE;
        let mut out = Vec::with_capacity(((right - left) * (bottom - top)) as usize);
        for ty in top..bottom {
            for tx in left..right {
                out.push(Tile { x: tx, y: ty });
            }
        }
        out
    }

    /// Intersection with another rectangle, in canvas coordinates.
    pub fn intersect(&self, other: &Rectangle) -> Option<Rectangle> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if x >= right || y >= bottom {
            return None;
        }
        Some(Rectangle {
            x,
            y,
            w: right - x,
            h: bottom - y,
        })
    }

    /// Clip to the interior of a tile, in canvas coordinates.
    pub fn clip_to_tile(&self, tile: Tile) -> Option<Rectangle> {
        self.intersect(&Rectangle {
            x: tile.x * TILE_SIZE,
            y: tile.y * TILE_SIZE,
            w: TILE_SIZE,
            h: TILE_SIZE,
        })
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@({},{})", self.w, self.h, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_id_round_trip() {
        for &(x, y) in &[(0, 0), (1, 0), (0, 1), (42, 17), (2047, 2047)] {
            let tile = Tile::new(x, y);
            assert_eq!(Tile::from_id(tile.id()), tile);
        }
        assert_eq!(Tile::new(42, 17).id(), 420_017);
    }

    #[test]
    fn point_tuple_round_trip() {
        let samples = [
            (0, 0, 0, 0),
            (0, 0, 999, 999),
            (12, 7, 340, 951),
            (2047, 2047, 0, 0),
            (1, 2, 3, 4),
        ];
        for &(tx, ty, px, py) in &samples {
            let point = Point::from4(tx, ty, px, py).unwrap();
            assert_eq!(point.to4(), (tx, ty, px, py));
        }
    }

    #[test]
    fn point_tuple_preconditions() {
        assert_eq!(
            Point::from4(2048, 0, 0, 0),
            Err(GeometryError::TileOutOfRange(2048, 0))
        );
        assert_eq!(
            Point::from4(0, 0, 1000, 0),
            Err(GeometryError::PixelOutOfRange(1000, 0))
        );
    }

    #[test]
    fn coords_token_matches_filename_convention() {
        let point = Point::from4(12, 7, 340, 951).unwrap();
        assert_eq!(point.coords_token(), "12_7_340_951");
    }

    #[test]
    fn rectangle_tiles_single() {
        let rect = Rectangle::new(0, 0, 10, 10);
        assert_eq!(rect.tiles(), vec![Tile::new(0, 0)]);
    }

    #[test]
    fn rectangle_tiles_spanning() {
        // 998..1002 spans the boundary in both axes.
        let rect = Rectangle::new(998, 998, 4, 4);
        assert_eq!(
            rect.tiles(),
            vec![
                Tile::new(0, 0),
                Tile::new(1, 0),
                Tile::new(0, 1),
                Tile::new(1, 1)
            ]
        );
    }

    #[test]
    fn rectangle_tiles_empty() {
        assert!(Rectangle::new(5, 5, 0, 7).tiles().is_empty());
    }

    /// Tile enumeration agrees with brute-force membership over the grid.
    #[test]
    fn rectangle_tiles_brute_force() {
        let rects = [
            Rectangle::new(0, 0, 1, 1),
            Rectangle::new(999, 0, 2, 1),
            Rectangle::new(1500, 2300, 777, 1444),
            Rectangle::new(2046 * TILE_SIZE, 2046 * TILE_SIZE, 1500, 1500),
        ];
        for rect in rects {
            let fast: std::collections::HashSet<Tile> = rect.tiles().into_iter().collect();
            let mut brute = std::collections::HashSet::new();
            // Only scan the neighborhood; tiles outside cannot intersect.
            let t0x = rect.x / TILE_SIZE;
            let t0y = rect.y / TILE_SIZE;
            for ty in t0y.saturating_sub(1)..(t0y + rect.h / TILE_SIZE + 3).min(GRID_TILES) {
                for tx in t0x.saturating_sub(1)..(t0x + rect.w / TILE_SIZE + 3).min(GRID_TILES) {
                    let tile = Tile::new(tx, ty);
                    if rect.clip_to_tile(tile).is_some() {
                        brute.insert(tile);
                    }
                }
            }
            assert_eq!(fast, brute, "mismatch for {rect:?}");
        }
    }

    #[test]
    fn clip_to_tile() {
        let rect = Rectangle::new(998, 10, 10, 5);
        assert_eq!(
            rect.clip_to_tile(Tile::new(0, 0)),
            Some(Rectangle::new(998, 10, 2, 5))
        );
        assert_eq!(
            rect.clip_to_tile(Tile::new(1, 0)),
            Some(Rectangle::new(1000, 10, 8, 5))
        );
        assert_eq!(rect.clip_to_tile(Tile::new(2, 0)), None);
    }

    #[test]
    fn intersect_disjoint() {
        let a = Rectangle::new(0, 0, 10, 10);
        let b = Rectangle::new(10, 0, 10, 10);
        assert_eq!(a.intersect(&b), None);
    }
}
