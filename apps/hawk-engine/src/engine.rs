//! Process lifecycle: open the store, refresh derived counts, and run
//! the polling loop until told to stop.

use crate::checker::Checker;
use crate::config::Nest;
use crate::fetcher::TileFetcher;
use anyhow::{Context, Result};
use hawk_kernel::Kernel;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Seconds between cycle starts: 60φ = 30·(1+√5) ≈ 97.08, chosen to be
/// maximally dissonant with the upstream 30-second period.
pub fn cycle_period() -> Duration {
    Duration::from_secs_f64(30.0 * (1.0 + 5.0_f64.sqrt()))
}

/// Consecutive cycle failures tolerated before giving up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

pub struct Engine {
    nest: Nest,
    kernel: Kernel,
    checker: Checker,
}

impl Engine {
    /// Open the store, refresh per-person counts, and prime the queue.
    pub async fn start(nest: Nest) -> Result<Self> {
        nest.ensure_dirs()
            .with_context(|| format!("prepare nest {}", nest.home().display()))?;
        let kernel = Kernel::open(&nest.data_dir()).context("open store")?;

        for person in kernel.list_persons_async().await? {
            let refreshed = kernel.recompute_person_totals_async(person.id).await?;
            info!(
                "{}: Watching {} tiles across {} active projects",
                refreshed.name, refreshed.watched_tiles_count, refreshed.active_projects_count
            );
        }

        let mut checker = Checker::new(TileFetcher::new()?);
        checker.start(&kernel).await?;
        Ok(Self {
            nest,
            kernel,
            checker,
        })
    }

    /// Run the cadence loop. Returns the process exit code.
    pub async fn run(mut self) -> Result<u8> {
        let period = cycle_period();
        info!("starting polling loop ({:.1}s cycle, 60φ = 30(1+√5))", period.as_secs_f64());
        let mut ticker = tokio::time::interval(period);
        // A long cycle starts the next one immediately instead of drifting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let mut consecutive_errors = 0u32;
        let exit_code = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("termination signal received, exiting");
                    break 0;
                }
                _ = ticker.tick() => {}
            }

            match self.checker.check_next_tile(&self.kernel, &self.nest).await {
                Ok(outcome) if !outcome.failed => {
                    consecutive_errors = 0;
                }
                Ok(_) => {
                    consecutive_errors += 1;
                    error!("cycle failed ({consecutive_errors} consecutive)");
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!("cycle error: {err:#} ({consecutive_errors} consecutive)");
                }
            }
            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                error!("{MAX_CONSECUTIVE_ERRORS} consecutive cycle failures, giving up");
                break 1;
            }
        };

        self.kernel.close();
        Ok(exit_code)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
