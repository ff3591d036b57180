//! One polling cycle: pick a tile, fetch it, diff what it touches.

use crate::config::Nest;
use crate::differ;
use crate::fetcher::{FetchOutcome, TileFetcher};
use crate::queue::TileQueue;
use anyhow::Result;
use hawk_core::HEAT_BURNING;
use hawk_kernel::Kernel;
use tracing::{debug, warn};

/// What one cycle amounted to, for the engine's error budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    /// Counts toward the consecutive-error budget.
    pub failed: bool,
    /// A fresh tile body was processed this cycle.
    pub changed: bool,
    /// Projects diffed against the changed tile.
    pub projects_diffed: usize,
}

pub struct Checker {
    queue: TileQueue,
    fetcher: TileFetcher,
}

impl Checker {
    pub fn new(fetcher: TileFetcher) -> Self {
        Self {
            queue: TileQueue::new(),
            fetcher,
        }
    }

    /// Load queue state from the store. Call once at startup.
    pub async fn start(&mut self, kernel: &Kernel) -> Result<()> {
        self.queue.start(kernel).await
    }

    /// Run one polling cycle.
    pub async fn check_next_tile(&mut self, kernel: &Kernel, nest: &Nest) -> Result<CycleOutcome> {
        let Some(mut rec) = self.queue.select_next(kernel).await? else {
            warn!("queue returned no tile; no active projects?");
            return Ok(CycleOutcome::default());
        };
        let was_burning = rec.heat == HEAT_BURNING;
        let now = epoch_now();
        let tile = rec.tile();

        match self.fetcher.check(nest, &mut rec, now).await {
            FetchOutcome::Unchanged => {
                // A burning tile graduates on its first successful
                // fetch; it lands hottest and redistribution settles it.
                // A 304 carries no Last-Modified, so stamp the check
                // time as last_update or the tile would never be seen
                // by redistribution again.
                if was_burning {
                    rec.heat = 1;
                    if rec.last_update == 0 {
                        rec.last_update = rec.last_checked;
                    }
                    kernel.commit_tile_change_async(rec).await?;
                } else {
                    kernel.mark_tile_checked_async(rec.id, rec.last_checked).await?;
                }
                debug!("tile {tile}: unchanged");
                Ok(CycleOutcome::default())
            }
            FetchOutcome::Rejected => {
                // Palette or decode trouble is upstream data, not an
                // engine fault; skip the tile without consuming the
                // error budget.
                if !was_burning {
                    kernel.mark_tile_checked_async(rec.id, rec.last_checked).await?;
                }
                Ok(CycleOutcome::default())
            }
            FetchOutcome::TransportError => {
                // Leave never-fetched tiles burning (last_checked 0)
                // so they keep their priority until a fetch lands.
                if !was_burning {
                    kernel.mark_tile_checked_async(rec.id, rec.last_checked).await?;
                }
                Ok(CycleOutcome {
                    failed: true,
                    ..CycleOutcome::default()
                })
            }
            FetchOutcome::Changed(_) => {
                if was_burning {
                    rec.heat = 1;
                }
                kernel.commit_tile_change_async(rec.clone()).await?;

                let projects = kernel.lookup_overlapping_projects_async(rec.id).await?;
                let mut failed = false;
                let mut diffed = 0usize;
                for project in &projects {
                    match differ::run_diff(kernel, nest, project, now).await {
                        Ok(_) => diffed += 1,
                        Err(err) => {
                            warn!(
                                "project {}/{}: diff failed: {err:#}",
                                project.owner_name, project.name
                            );
                            failed = true;
                        }
                    }
                }
                Ok(CycleOutcome {
                    failed,
                    changed: true,
                    projects_diffed: diffed,
                })
            }
        }
    }
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
