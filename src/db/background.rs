//! Background maintenance.
//!
//! Three periodic workers keep the engine healthy: the flusher drains the
//! frozen-memtable queue to L0, the compactor runs picked compactions
//! until the tree settles, and the metrics worker dumps counters to the
//! log. Workers run on the tokio runtime, check a shared shutdown signal
//! between rounds, and stop together when the database closes. A failed
//! round is logged and retried on the next tick; once the database latches
//! read-only the write-side workers keep ticking but do no work, so reads
//! stay served.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Db;
use crate::error::Result;

/// Handles to the running maintenance workers.
pub(super) struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawns the flush, compaction, and metrics workers for `db`.
    pub(super) fn start(db: &Db) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let intervals = &db.inner.config.scheduler;

        let flusher = {
            let db = db.clone();
            spawn_worker(
                "flush",
                intervals.flush_interval,
                shutdown_rx.clone(),
                move || db.flush_immutables().map(|_| ()),
            )
        };
        let compactor = {
            let db = db.clone();
            spawn_worker(
                "compaction",
                intervals.compaction_interval,
                shutdown_rx.clone(),
                move || {
                    // Drain the picker: one round settles the whole tree,
                    // read-triggered work first.
                    while db.maybe_compact()? {}
                    Ok(())
                },
            )
        };
        let reporter = {
            let db = db.clone();
            spawn_worker(
                "metrics",
                intervals.metrics_interval,
                shutdown_rx,
                move || {
                    db.metrics().log();
                    Ok(())
                },
            )
        };

        Self {
            shutdown_tx,
            workers: vec![flusher, compactor, reporter],
        }
    }

    /// Signals every worker and waits for them to exit.
    pub(super) async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}

fn spawn_worker(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut round: impl FnMut() -> Result<()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = round() {
                        tracing::warn!(worker = name, error = %e, "maintenance round failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!(worker = name, "maintenance worker stopping");
                    break;
                }
            }
        }
    })
}
