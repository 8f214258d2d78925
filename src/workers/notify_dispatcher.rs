//! Interval loop driving the merchant notification dispatcher.

use crate::services::notify::NotifyService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct NotifyDispatcher {
    notify: Arc<NotifyService>,
    interval: Duration,
}

impl NotifyDispatcher {
    pub fn new(notify: Arc<NotifyService>, interval_secs: u64) -> Self {
        Self {
            notify,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Run until the shutdown signal flips. One sweep per tick; a failed
    /// sweep is logged and the loop keeps going.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "notify dispatcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.notify.run_due_tasks(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "notify sweep dispatched tasks"),
                        Err(e) => error!(error = %e, "notify sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("notify dispatcher stopping");
                        break;
                    }
                }
            }
        }
    }
}
