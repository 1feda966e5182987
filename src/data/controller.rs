use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::config::Config;
use crate::data::pubsub::Broadcaster;
use crate::data::series::SeriesStore;
use crate::data::source::PriceSource;
use crate::error::CycleStopped;

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub assets: Vec<String>,
    pub update_interval: Duration,
    pub history_days: u32,
    pub history_pacing: Duration,
    pub snapshot_recent_points: usize,
}

impl From<&Config> for CycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            assets: config.tracked_assets.clone(),
            update_interval: config.update_interval,
            history_days: config.history_days,
            history_pacing: config.history_pacing,
            snapshot_recent_points: config.snapshot_recent_points,
        }
    }
}

/// Outcome of one fetch + ingest + broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: bool,
    pub ingested: usize,
    pub delivered: usize,
    pub pruned: usize,
}

type RefreshCommand = oneshot::Sender<TickReport>;

/// Asks the running update cycle for an immediate tick.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<RefreshCommand>,
}

impl RefreshHandle {
    pub async fn refresh(&self) -> Result<TickReport, CycleStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(reply_tx).await.map_err(|_| CycleStopped)?;
        reply_rx.await.map_err(|_| CycleStopped)
    }
}

/// Sole writer of the series store: loads history once, then polls the
/// current prices on a fixed period and broadcasts after every poll.
pub struct UpdateCycle {
    source: Arc<dyn PriceSource>,
    store: Arc<SeriesStore>,
    broadcaster: Broadcaster,
    settings: CycleSettings,
}

impl UpdateCycle {
    pub fn new(
        source: Arc<dyn PriceSource>,
        store: Arc<SeriesStore>,
        broadcaster: Broadcaster,
        settings: CycleSettings,
    ) -> Self {
        Self {
            source,
            store,
            broadcaster,
            settings,
        }
    }

    /// Fetches history for every asset in turn. Failures are logged and skipped.
    pub async fn warm_up(&self) -> usize {
        let mut loaded = 0;

        for (i, id) in self.settings.assets.iter().enumerate() {
            if i > 0 && !self.settings.history_pacing.is_zero() {
                sleep(self.settings.history_pacing).await;
            }

            match self.source.fetch_history(id, self.settings.history_days).await {
                Ok(points) => {
                    if self.store.ingest_history(id, points) {
                        loaded += 1;
                    }
                }
                Err(e) => warn!("Failed to load history for {}: {}", id, e),
            }
        }

        info!(
            "Warm-up complete: history loaded for {}/{} assets",
            loaded,
            self.settings.assets.len()
        );
        loaded
    }

    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.source.fetch_current(&self.settings.assets).await {
            Ok(records) => {
                report.fetched = true;
                report.ingested = records.len();
                for (id, fields) in records {
                    self.store.ingest_current(&id, fields);
                }
            }
            Err(e) => warn!("Price fetch failed, keeping last snapshot: {}", e),
        }

        let snapshot = self.store.snapshot(self.settings.snapshot_recent_points);
        match self.broadcaster.publish(&snapshot) {
            Ok(published) => {
                report.delivered = published.delivered;
                report.pruned = published.pruned;
            }
            Err(e) => error!("Broadcast abandoned: {}", e),
        }

        debug!("Tick finished: {:?}", report);
        report
    }

    pub async fn run(self, mut commands: mpsc::Receiver<RefreshCommand>) {
        self.warm_up().await;

        let mut ticker = interval(self.settings.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Update cycle started for {} assets (every {:?})",
            self.settings.assets.len(),
            self.settings.update_interval
        );

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                Some(reply) = commands.recv() => {
                    info!("Running on-demand refresh");
                    let report = self.run_tick().await;
                    if reply.send(report).is_err() {
                        debug!("Refresh requester went away before the result");
                    }
                }
            }
        }
    }

    pub fn spawn(self) -> (JoinHandle<()>, RefreshHandle) {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(self.run(rx));
        (handle, RefreshHandle { tx })
    }
}
