//! Counter-cache maintenance.
//!
//! `cached_child_count` is kept up to date two ways:
//!
//! 1. **Incremental** - every successful creation sends its parent on a
//!    channel; [`Reconciler::apply_increment`] bumps the count by one. Fast,
//!    but increments can be lost (full channel, crash) or doubled.
//! 2. **Authoritative sweep** - [`Reconciler::sweep`] recomputes every
//!    parent's exact live-child count and overwrites the cache. Each
//!    parent's read-then-write runs in its own transaction.
//!
//! A cached count therefore equals the true count within one sweep interval
//! of the last successful write.

use crate::common::{
    Error, Result,
    types::{ParentKind, ParentRef},
};
use crate::server::{store::SqliteStore, telemetry::add_counter_drift_corrected};
use core::time::Duration;
use serde::Serialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

/// Outcome of one authoritative sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Parents visited.
    pub parents: u64,
    /// Parents whose cached count was wrong.
    pub corrected: u64,
    /// Sum of `|cached - actual|` over corrected parents.
    pub drift: u64,
    /// Parents skipped after losing a race; the next sweep retries them.
    pub races: u64,
    /// Parents deleted while the sweep ran.
    pub vanished: u64,
}

#[derive(Clone)]
pub struct Reconciler {
    store: SqliteStore,
    interval: Duration,
}

impl Reconciler {
    pub const fn new(store: SqliteStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Applies one incremental update. A missing parent is ignored.
    pub async fn apply_increment(&self, parent: ParentRef) {
        match self.store.increment_cached_count(parent).await {
            Ok(true) => {}
            Ok(false) => tracing::trace!(%parent, "Increment for deleted parent ignored"),
            Err(e) => tracing::debug!(%parent, "Incremental count update failed: {e}"),
        }
    }

    /// Recomputes every parent's cached count.
    ///
    /// A [`Error::ReconciliationRace`] on one parent is counted and skipped;
    /// any other error aborts the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for kind in ParentKind::ALL {
            for id in self.store.parent_ids(kind).await? {
                let parent = ParentRef::new(kind, id);
                report.parents += 1;

                match self.store.reconcile_parent(parent).await {
                    Ok(Some((before, after))) if before != after => {
                        report.corrected += 1;
                        report.drift += before.abs_diff(after);
                        tracing::debug!(%parent, before, after, "Cached count corrected");
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => report.vanished += 1,
                    Err(Error::ReconciliationRace { parent, reason }) => {
                        report.races += 1;
                        tracing::debug!(%parent, "Reconciliation race, deferring: {reason}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        add_counter_drift_corrected(report.corrected);
        tracing::info!(
            parents = report.parents,
            corrected = report.corrected,
            drift = report.drift,
            races = report.races,
            "Counter-cache sweep complete"
        );
        Ok(report)
    }

    /// Runs the reconciler until `shutdown_token` is cancelled: applies
    /// increments as they arrive and sweeps every interval.
    ///
    /// Increments still queued at cancellation are applied before the task
    /// exits.
    pub fn spawn(
        self,
        mut increments: mpsc::Receiver<ParentRef>,
        shutdown_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    Some(parent) = increments.recv() => self.apply_increment(parent).await,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!("Counter-cache sweep failed: {e}");
                        }
                    }
                }
            }

            increments.close();
            while let Some(parent) = increments.recv().await {
                self.apply_increment(parent).await;
            }
            tracing::debug!("Reconciler stopped");
        })
    }
}
