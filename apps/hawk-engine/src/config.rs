//! Nest resolution and filesystem layout.
//!
//! Everything pixel-hawk persists lives under one "nest" directory:
//! project targets, canvas snapshots, the tile cache, the SQLite
//! database, and logs. The nest comes from `--nest`, then `HAWK_NEST`,
//! then `./nest`.

use hawk_core::Tile;
use hawk_kernel::Project;
use std::path::{Path, PathBuf};

pub const NEST_ENV: &str = "HAWK_NEST";

#[derive(Debug, Clone)]
pub struct Nest {
    home: PathBuf,
}

impl Nest {
    /// Resolve the nest root. Flag wins over environment over default.
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        let home = flag
            .or_else(|| std::env::var_os(NEST_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./nest"));
        Self { home }
    }

    /// Use an explicit nest root (tests, embedding).
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Target images, one subdirectory per owner.
    pub fn projects_dir(&self) -> PathBuf {
        self.home.join("projects")
    }

    /// Prior-state mirrors of project rectangles.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.home.join("snapshots")
    }

    /// Cached upstream tiles.
    pub fn tiles_dir(&self) -> PathBuf {
        self.home.join("tiles")
    }

    /// SQLite database.
    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.projects_dir(),
            self.snapshots_dir(),
            self.tiles_dir(),
            self.data_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn tile_path(&self, tile: Tile) -> PathBuf {
        self.tiles_dir().join(format!("tile-{tile}.png"))
    }

    /// `projects/{owner_id}/{tx}_{ty}_{px}_{py}.png`
    pub fn target_path(&self, project: &Project) -> PathBuf {
        self.projects_dir()
            .join(project.owner_id.to_string())
            .join(format!("{}.png", project.coords_token()))
    }

    /// `snapshots/{owner_id}/{tx}_{ty}_{px}_{py}.png`
    pub fn snapshot_path(&self, project: &Project) -> PathBuf {
        self.snapshots_dir()
            .join(project.owner_id.to_string())
            .join(format!("{}.png", project.coords_token()))
    }
}
