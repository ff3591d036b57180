//! Per-project canvas diffing.
//!
//! Assembles the current canvas view over a project's rectangle from
//! cached tiles, compares it against the target image and the previous
//! snapshot, and commits progress/regress deltas plus a fresh snapshot.
//! A diff with no delta writes nothing at all.

use crate::config::Nest;
use anyhow::{Context, Result};
use hawk_core::{DiffStatus, PalettedImage, PaletteError, Rectangle, PALETTE};
use hawk_kernel::{DiffCommit, Kernel, Project};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a diff run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffResult {
    /// Stats updated, history appended, snapshot overwritten.
    Committed(DiffStatus),
    /// Nothing moved since the previous snapshot.
    NoChange,
    /// Target missing or malformed; project skipped this cycle.
    Skipped,
}

/// Run one diff for `project`. Image work happens off the driver.
pub async fn run_diff(
    kernel: &Kernel,
    nest: &Nest,
    project: &Project,
    now: i64,
) -> Result<DiffResult> {
    let rect = project.rect;
    let target_path = nest.target_path(project);
    let snapshot_path = nest.snapshot_path(project);
    let tiles_dir = nest.tiles_dir();
    let label = format!("{}/{}", project.owner_name, project.name);

    let loaded = {
        let label = label.clone();
        tokio::task::spawn_blocking(move || {
            load_inputs(&target_path, &snapshot_path, &tiles_dir, rect, &label)
        })
        .await
        .context("diff image task")?
    };
    let Some(inputs) = loaded? else {
        return Ok(DiffResult::Skipped);
    };

    let counts = compare(&inputs.target, &inputs.current, &inputs.previous);
    if counts.progress == 0 && counts.regress == 0 {
        debug!("{label}: no pixel movement");
        return Ok(DiffResult::NoChange);
    }

    let status = counts.status();
    let commit = DiffCommit {
        timestamp: now,
        status,
        pixels_remaining: counts.remaining(),
        pixels_target: counts.target,
        completion_percent: counts.completion_percent(),
        progress_pixels: counts.progress,
        regress_pixels: counts.regress,
        log_message: counts.log_message(&label),
    };
    info!("{}", commit.log_message);

    // The snapshot lands at its canonical path (temp file + rename)
    // before the stats transaction commits. A crash in between leaves
    // a snapshot ahead of the recorded stats: the next diff sees no
    // delta against it and writes nothing, rather than re-counting
    // already-recorded progress against a stale or missing snapshot.
    let snapshot_path = nest.snapshot_path(project);
    let tmp = snapshot_path.with_extension("png.tmp");
    let encoded = {
        let current = inputs.current;
        tokio::task::spawn_blocking(move || PALETTE.encode(&current))
            .await
            .context("snapshot encode task")?
            .context("snapshot encode")?
    };
    if let Some(parent) = snapshot_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(&tmp, &encoded)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &snapshot_path)
        .await
        .with_context(|| format!("rename into {}", snapshot_path.display()))?;

    kernel.commit_diff_async(project.id, commit).await?;
    Ok(DiffResult::Committed(status))
}

struct DiffInputs {
    target: PalettedImage,
    current: PalettedImage,
    previous: PalettedImage,
}

/// Load target, previous snapshot, and the stitched current view.
/// Returns `None` when the project target is unusable.
fn load_inputs(
    target_path: &Path,
    snapshot_path: &Path,
    tiles_dir: &Path,
    rect: Rectangle,
    label: &str,
) -> Result<Option<DiffInputs>> {
    let target = match read_paletted(target_path) {
        Ok(Some(img)) if img.size == rect.size() => img,
        Ok(Some(img)) => {
            warn!(
                "{label}: target is {} but project is {}; skipping",
                img.size,
                rect.size()
            );
            return Ok(None);
        }
        Ok(None) => {
            warn!("{label}: target image missing; skipping");
            return Ok(None);
        }
        Err(err) => {
            warn!("{label}: target unusable: {err}");
            return Ok(None);
        }
    };

    // A missing snapshot means this is the first diff; compare against
    // an all-blank canvas of the same shape.
    let previous = match read_paletted(snapshot_path) {
        Ok(Some(img)) if img.size == rect.size() => img,
        Ok(_) => PalettedImage::blank(rect.size()),
        Err(err) => {
            warn!("{label}: previous snapshot unreadable ({err}); treating as blank");
            PalettedImage::blank(rect.size())
        }
    };

    let current = stitch_tiles(tiles_dir, rect)?;
    Ok(Some(DiffInputs {
        target,
        current,
        previous,
    }))
}

fn read_paletted(path: &Path) -> Result<Option<PalettedImage>, PaletteError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PaletteError::Io(err)),
    };
    PALETTE.decode(&bytes).map(Some)
}

/// Stitch cached tiles together, exactly covering `rect`. Missing
/// tiles leave transparent pixels.
pub fn stitch_tiles(tiles_dir: &Path, rect: Rectangle) -> Result<PalettedImage> {
    let mut image = PalettedImage::blank(rect.size());
    for tile in rect.tiles() {
        let cache_path: PathBuf = tiles_dir.join(format!("tile-{tile}.png"));
        let tile_img = match read_paletted(&cache_path) {
            Ok(Some(img)) => img,
            Ok(None) => {
                debug!("{tile}: tile missing from cache, leaving transparent");
                continue;
            }
            Err(err) => {
                warn!("{tile}: cached tile unreadable ({err}), leaving transparent");
                continue;
            }
        };
        let origin = tile.to_point(0, 0);
        image.paste(
            &tile_img,
            origin.x as i64 - rect.x as i64,
            origin.y as i64 - rect.y as i64,
        );
    }
    Ok(image)
}

/// Pixel bookkeeping for one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffCounts {
    /// Non-transparent target pixels, floored at 1.
    pub target: i64,
    /// Target pixels the current canvas satisfies.
    pub matched: i64,
    /// Newly matching since the previous snapshot.
    pub progress: i64,
    /// Previously matching, no longer.
    pub regress: i64,
}

impl DiffCounts {
    pub fn remaining(&self) -> i64 {
        self.target - self.matched
    }

    pub fn completion_percent(&self) -> f64 {
        self.matched as f64 / self.target as f64
    }

    pub fn status(&self) -> DiffStatus {
        if self.matched == 0 {
            DiffStatus::NotStarted
        } else if self.matched == self.target {
            DiffStatus::Complete
        } else {
            DiffStatus::InProgress
        }
    }

    fn log_message(&self, label: &str) -> String {
        match self.status() {
            DiffStatus::NotStarted => {
                format!("{label}: Not started [+{}/-{}]", self.progress, self.regress)
            }
            DiffStatus::Complete => format!(
                "{label}: Complete! {} pixels total. [+{}/-{}]",
                self.target, self.progress, self.regress
            ),
            DiffStatus::InProgress => format!(
                "{label}: {}px remaining ({:.2}% complete) [+{}/-{}]",
                self.remaining(),
                self.completion_percent() * 100.0,
                self.progress,
                self.regress
            ),
        }
    }
}

/// Compare current canvas, target, and previous snapshot pixel by
/// pixel. Target index 0 means "no requirement"; those pixels are
/// skipped entirely.
pub fn compare(
    target: &PalettedImage,
    current: &PalettedImage,
    previous: &PalettedImage,
) -> DiffCounts {
    let mut counts = DiffCounts {
        target: 0,
        matched: 0,
        progress: 0,
        regress: 0,
    };
    for ((&t, &c), &p) in target
        .data
        .iter()
        .zip(current.data.iter())
        .zip(previous.data.iter())
    {
        if t == 0 {
            continue;
        }
        counts.target += 1;
        if c == t {
            counts.matched += 1;
            if p != t {
                counts.progress += 1;
            }
        } else if p == t {
            counts.regress += 1;
        }
    }
    counts.target = counts.target.max(1);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawk_core::{ProjectState, Size, Tile, TILE_SIZE};
    use tempfile::TempDir;

    fn image_with(size: Size, painted: &[usize]) -> PalettedImage {
        let mut img = PalettedImage::blank(size);
        for &i in painted {
            img.data[i] = 1;
        }
        img
    }

    struct Fixture {
        _dir: TempDir,
        nest: Nest,
        kernel: Kernel,
        project: Project,
    }

    async fn fixture(target: &PalettedImage) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let nest = Nest::at(dir.path());
        nest.ensure_dirs().expect("nest dirs");
        let kernel = Kernel::open(&nest.data_dir()).expect("kernel open");
        let alice = kernel.insert_person("alice", None, 0).unwrap();
        let rect = Rectangle::new(0, 0, target.size.w, target.size.h);
        let id = kernel
            .insert_project(alice, "mural", rect, ProjectState::Active, 1)
            .unwrap();
        let project = kernel.get_project(id).unwrap().unwrap();

        let target_path = nest.target_path(&project);
        std::fs::create_dir_all(target_path.parent().unwrap()).unwrap();
        std::fs::write(&target_path, PALETTE.encode(target).unwrap()).unwrap();
        Fixture {
            _dir: dir,
            nest,
            kernel,
            project,
        }
    }

    fn write_tile(nest: &Nest, tile: Tile, img: &PalettedImage) {
        std::fs::write(nest.tile_path(tile), PALETTE.encode(img).unwrap()).unwrap();
    }

    fn write_snapshot(fx: &Fixture, img: &PalettedImage) {
        let path = fx.nest.snapshot_path(&fx.project);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, PALETTE.encode(img).unwrap()).unwrap();
    }

    /// Tile-sized canvas holding the project area in its top-left.
    fn tile_canvas(painted: &[usize], row_len: usize) -> PalettedImage {
        let mut img = PalettedImage::blank(Size::new(TILE_SIZE, TILE_SIZE));
        for &i in painted {
            let (row, col) = (i / row_len, i % row_len);
            img.data[row * TILE_SIZE as usize + col] = 1;
        }
        img
    }

    #[tokio::test]
    async fn progress_event_commits_counters_and_snapshot() {
        // Target: 100 painted pixels. Previous snapshot matches 10,
        // current canvas matches 25.
        let size = Size::new(10, 10);
        let all: Vec<usize> = (0..100).collect();
        let target = image_with(size, &all);
        let fx = fixture(&target).await;

        write_snapshot(&fx, &image_with(size, &(0..10).collect::<Vec<_>>()));
        write_tile(
            &fx.nest,
            Tile::new(0, 0),
            &tile_canvas(&(0..25).collect::<Vec<_>>(), 10),
        );

        let result = run_diff(&fx.kernel, &fx.nest, &fx.project, 500).await.unwrap();
        assert_eq!(result, DiffResult::Committed(DiffStatus::InProgress));

        let project = fx.kernel.get_project(fx.project.id).unwrap().unwrap();
        assert_eq!(project.total_progress, 15);
        assert_eq!(project.total_regress, 0);
        assert_eq!(project.max_completion_percent, 0.25);
        assert!(project.last_log_message.contains("[+15/-0]"));
        assert!(project.last_log_message.contains("alice/mural"));

        let history = fx.kernel.history_for_project(fx.project.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].progress_pixels, 15);
        assert_eq!(history[0].regress_pixels, 0);
        assert_eq!(history[0].completion_percent, 0.25);

        // Snapshot now mirrors the stitched current canvas.
        let snapshot = std::fs::read(fx.nest.snapshot_path(&fx.project)).unwrap();
        let decoded = PALETTE.decode(&snapshot).unwrap();
        assert_eq!(decoded, image_with(size, &(0..25).collect::<Vec<_>>()));
    }

    #[tokio::test]
    async fn regression_event_flips_streak() {
        // Previous snapshot matched 80; current matches 70.
        let size = Size::new(10, 10);
        let target = image_with(size, &(0..100).collect::<Vec<_>>());
        let fx = fixture(&target).await;

        write_snapshot(&fx, &image_with(size, &(0..80).collect::<Vec<_>>()));
        write_tile(
            &fx.nest,
            Tile::new(0, 0),
            &tile_canvas(&(0..70).collect::<Vec<_>>(), 10),
        );

        let result = run_diff(&fx.kernel, &fx.nest, &fx.project, 900).await.unwrap();
        assert_eq!(result, DiffResult::Committed(DiffStatus::InProgress));

        let project = fx.kernel.get_project(fx.project.id).unwrap().unwrap();
        assert_eq!(project.total_progress, 0);
        assert_eq!(project.total_regress, 10);
        assert!(project.largest_regress_pixels >= 10);
        assert_eq!(project.largest_regress_time, 900);
        assert_eq!(project.streak, hawk_core::Streak::Regress);
    }

    #[tokio::test]
    async fn diff_is_idempotent() {
        let size = Size::new(10, 10);
        let target = image_with(size, &(0..100).collect::<Vec<_>>());
        let fx = fixture(&target).await;
        write_tile(
            &fx.nest,
            Tile::new(0, 0),
            &tile_canvas(&(0..40).collect::<Vec<_>>(), 10),
        );

        let first = run_diff(&fx.kernel, &fx.nest, &fx.project, 100).await.unwrap();
        assert_eq!(first, DiffResult::Committed(DiffStatus::InProgress));
        let after_first = fx.kernel.get_project(fx.project.id).unwrap().unwrap();

        // Same canvas, same snapshot: the second run is a no-op.
        let second = run_diff(&fx.kernel, &fx.nest, &fx.project, 200).await.unwrap();
        assert_eq!(second, DiffResult::NoChange);
        let after_second = fx.kernel.get_project(fx.project.id).unwrap().unwrap();
        assert_eq!(after_first.total_progress, after_second.total_progress);
        assert_eq!(
            fx.kernel.history_for_project(fx.project.id, 10).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn untouched_project_writes_nothing() {
        // No snapshot, no painted pixels: first diff is a discard, so
        // no snapshot file may appear either.
        let size = Size::new(10, 10);
        let target = image_with(size, &(0..100).collect::<Vec<_>>());
        let fx = fixture(&target).await;
        write_tile(&fx.nest, Tile::new(0, 0), &tile_canvas(&[], 10));

        let result = run_diff(&fx.kernel, &fx.nest, &fx.project, 100).await.unwrap();
        assert_eq!(result, DiffResult::NoChange);
        assert!(!fx.nest.snapshot_path(&fx.project).exists());
        assert!(fx.kernel.history_for_project(fx.project.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_target_is_skipped() {
        let size = Size::new(10, 10);
        let target = image_with(size, &(0..100).collect::<Vec<_>>());
        let fx = fixture(&target).await;
        std::fs::remove_file(fx.nest.target_path(&fx.project)).unwrap();
        let result = run_diff(&fx.kernel, &fx.nest, &fx.project, 100).await.unwrap();
        assert_eq!(result, DiffResult::Skipped);
    }

    #[tokio::test]
    async fn missing_tiles_read_as_transparent() {
        // No cached tile at all: the stitched view is blank, and with a
        // blank previous snapshot there is nothing to commit.
        let size = Size::new(10, 10);
        let target = image_with(size, &(0..100).collect::<Vec<_>>());
        let fx = fixture(&target).await;
        let result = run_diff(&fx.kernel, &fx.nest, &fx.project, 100).await.unwrap();
        assert_eq!(result, DiffResult::NoChange);
    }

    #[test]
    fn compare_counts_pixels() {
        let size = Size::new(4, 1);
        // target: pixels 0..3 required, 3 transparent.
        let mut target = PalettedImage::blank(size);
        target.data = vec![1, 1, 1, 0];
        let mut current = PalettedImage::blank(size);
        current.data = vec![1, 0, 2, 2];
        let mut previous = PalettedImage::blank(size);
        previous.data = vec![0, 1, 1, 0];

        let counts = compare(&target, &current, &previous);
        assert_eq!(counts.target, 3);
        assert_eq!(counts.matched, 1);
        assert_eq!(counts.progress, 1); // pixel 0 newly matches
        assert_eq!(counts.regress, 2); // pixels 1 and 2 lost
        assert_eq!(counts.status(), DiffStatus::InProgress);
    }

    #[test]
    fn compare_all_transparent_target_has_floor() {
        let size = Size::new(2, 1);
        let target = PalettedImage::blank(size);
        let current = PalettedImage::blank(size);
        let previous = PalettedImage::blank(size);
        let counts = compare(&target, &current, &previous);
        assert_eq!(counts.target, 1);
        assert_eq!(counts.completion_percent(), 0.0);
    }
}
