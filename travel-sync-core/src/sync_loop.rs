//! Periodic driver that replicates every syncgroup.
//!
//! Each tick walks the registry and syncs adjacent members of every group
//! in join order, so a write reaches the last member of an `n`-store chain
//! within `n - 1` ticks. Ticks never overlap: a tick requested while
//! another is running is skipped. A failed pair is logged and the tick
//! moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::replication::{sync_stores, TieBreak};
use crate::syncgroup::SyncgroupRegistry;

/// Upper bound the simulated network promises for convergence between
/// two directly synced stores.
pub const SYNC_SLA: Duration = Duration::from_millis(250);

/// Time for one write to reach every member of a chain of `members` stores.
pub fn convergence_bound(members: usize, period: Duration) -> Duration {
    period.saturating_mul(u32::try_from(members).unwrap_or(u32::MAX))
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Store pairs synced.
    pub pairs: usize,
    /// Fields copied between stores.
    pub changes: usize,
    /// Pairs whose sync failed.
    pub failures: usize,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct SyncLoop {
    registry: SyncgroupRegistry,
    tie_break: TieBreak,
    in_progress: Arc<AtomicBool>,
}

impl SyncLoop {
    pub fn new(registry: SyncgroupRegistry, tie_break: TieBreak) -> Self {
        Self {
            registry,
            tie_break,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &SyncgroupRegistry {
        &self.registry
    }

    /// Runs one replication pass over every syncgroup.
    ///
    /// Returns `None` without doing anything if another tick is running.
    pub fn tick(&self) -> Option<TickReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let _guard = TickGuard(&self.in_progress);

        let mut report = TickReport::default();
        let groups = match self.registry.snapshot() {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Sync tick could not read syncgroups: {}", e);
                report.failures += 1;
                return Some(report);
            }
        };

        for group in groups {
            for pair in group.members.windows(2) {
                report.pairs += 1;
                match sync_stores(&pair[0], &pair[1], &group.prefixes, self.tie_break) {
                    Ok(changes) => report.changes += changes,
                    Err(e) => {
                        warn!(
                            "Sync of stores {} and {} in {} failed: {}",
                            pair[0].id(),
                            pair[1].id(),
                            group.key,
                            e
                        );
                        report.failures += 1;
                    }
                }
            }
        }
        trace!(?report, "Sync tick finished");
        Some(report)
    }

    /// Ticks every `period` until `shutdown` turns true or its sender drops.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.tick().is_none() {
                        debug!("Skipping sync tick; previous tick still running");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Sync loop stopped");
    }
}
