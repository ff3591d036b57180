//! Temperature-bucketed tile scheduling.
//!
//! Tiles sit in one burning bucket (heat 999, never fetched) plus K
//! temperature buckets (heat 1 hottest .. K coldest) sized along a
//! Zipf/harmonic curve over `last_update` recency. Selection walks the
//! buckets round-robin — burning first — taking the least recently
//! checked tile of each. A completed pass over all buckets triggers
//! redistribution, which also graduates burning tiles that have been
//! fetched since the last pass.
//!
//! The database is the single source of truth; only the bucket cursor
//! lives in memory.

use anyhow::Result;
use hawk_kernel::{Kernel, TileRecord};
use hawk_core::HEAT_BURNING;
use std::collections::VecDeque;
use tracing::debug;

/// The hottest bucket never holds fewer tiles than this (unless fewer
/// exist in total).
pub const MIN_HOTTEST_BUCKET: usize = 5;

/// Bucket sizes from hottest to coldest for `total` tiles.
///
/// Picks the largest K whose hottest share `(1/K)/H_K` still rounds to
/// at least `min_hottest`, then allocates `total·(1/(K−i+1))/H_K` per
/// bucket and pushes the rounding remainder onto the coldest buckets.
pub fn zipf_bucket_sizes(total: usize, min_hottest: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    if total <= min_hottest {
        return vec![total];
    }

    let mut left = 1usize;
    let mut right = (total / min_hottest).max(1);
    let mut num_buckets = 1usize;
    while left <= right {
        let k = (left + right) / 2;
        let harmonic: f64 = (1..=k).map(|i| 1.0 / i as f64).sum();
        let hottest = total as f64 * (1.0 / k as f64) / harmonic;
        if hottest.round() as usize >= min_hottest {
            num_buckets = k;
            left = k + 1;
        } else {
            right = k - 1;
        }
    }

    let harmonic: f64 = (1..=num_buckets).map(|i| 1.0 / i as f64).sum();
    let mut sizes = Vec::with_capacity(num_buckets);
    let mut allocated = 0usize;
    for i in 1..=num_buckets {
        let proportion = (1.0 / (num_buckets - i + 1) as f64) / harmonic;
        let size = (total as f64 * proportion).round() as usize;
        sizes.push(size);
        allocated += size;
    }
    let mut remainder = total as i64 - allocated as i64;
    for i in (0..sizes.len()).rev() {
        if remainder == 0 {
            break;
        }
        if remainder > 0 {
            sizes[i] += 1;
            remainder -= 1;
        } else if sizes[i] > 1 {
            sizes[i] -= 1;
            remainder += 1;
        }
    }
    sizes
}

/// Round-robin bucket cursor over the database-backed queues.
pub struct TileQueue {
    cycle: VecDeque<i64>,
    pub num_buckets: usize,
}

impl TileQueue {
    pub fn new() -> Self {
        Self {
            cycle: VecDeque::new(),
            num_buckets: 0,
        }
    }

    /// Load queue state from the database. Call once the store is open.
    pub async fn start(&mut self, kernel: &Kernel) -> Result<()> {
        self.redistribute(kernel).await
    }

    /// Next tile to poll, or `None` when nothing is watched.
    pub async fn select_next(&mut self, kernel: &Kernel) -> Result<Option<TileRecord>> {
        if let Some(tile) = self.try_select(kernel).await? {
            return Ok(Some(tile));
        }
        // Cursor exhausted: the pass is complete, rebalance and restart.
        self.redistribute(kernel).await?;
        self.try_select(kernel).await
    }

    async fn try_select(&mut self, kernel: &Kernel) -> Result<Option<TileRecord>> {
        while let Some(heat) = self.cycle.pop_front() {
            let found = if heat == HEAT_BURNING {
                kernel.burning_tile_for_oldest_project_async().await?
            } else {
                kernel.coolest_tile_in_bucket_async(heat).await?
            };
            if let Some(tile) = found {
                debug!("queue: selected tile {} from bucket {heat}", tile.tile());
                return Ok(Some(tile));
            }
        }
        Ok(None)
    }

    /// Reassign heats along the Zipf curve, optimistically: only tiles
    /// whose stored heat differs from the computed one are written.
    pub async fn redistribute(&mut self, kernel: &Kernel) -> Result<()> {
        let tiles = kernel.tiles_for_redistribution_async().await?;
        if tiles.is_empty() {
            self.num_buckets = 0;
            self.cycle = VecDeque::from([HEAT_BURNING]);
            return Ok(());
        }

        let sizes = zipf_bucket_sizes(tiles.len(), MIN_HOTTEST_BUCKET);
        self.num_buckets = sizes.len();

        let mut assignments = Vec::new();
        let mut cursor = 0usize;
        for (bucket_idx, &size) in sizes.iter().enumerate() {
            let target_heat = bucket_idx as i64 + 1;
            for tile in &tiles[cursor..(cursor + size).min(tiles.len())] {
                if tile.heat != target_heat {
                    assignments.push((tile.id, target_heat));
                }
            }
            cursor += size;
        }

        let updated = assignments.len();
        kernel.apply_heat_assignments_async(assignments).await?;
        debug!(
            "queue: redistributed {} tiles into {} buckets ({updated} updated)",
            tiles.len(),
            self.num_buckets
        );

        self.cycle = std::iter::once(HEAT_BURNING)
            .chain(1..=self.num_buckets as i64)
            .collect();
        Ok(())
    }
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new()
    }
}
