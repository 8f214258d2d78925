//! Reconciliation sweeps: order expiry, active order sync against the
//! gateways, and refund sync. These close the gap left by lost webhooks.

use crate::config::ReconcileConfig;
use crate::services::order::OrderService;
use crate::services::refund::RefundService;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct OrderReconcileWorker {
    orders: Arc<OrderService>,
    interval: Duration,
    sync_window: ChronoDuration,
    batch_size: i64,
}

impl OrderReconcileWorker {
    pub fn new(orders: Arc<OrderService>, config: &ReconcileConfig) -> Self {
        Self {
            orders,
            interval: Duration::from_secs(config.order_interval_secs),
            sync_window: ChronoDuration::minutes(config.order_sync_window_mins),
            batch_size: config.batch_size,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "order reconcile worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("order reconcile worker stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();
        match self.orders.expire_orders(now, self.batch_size).await {
            Ok(0) => {}
            Ok(closed) => info!(closed, "expired orders closed"),
            Err(e) => error!(error = %e, "order expiry sweep failed"),
        }
        match self
            .orders
            .sync_recent_orders(now - self.sync_window, self.batch_size)
            .await
        {
            Ok(0) => {}
            Ok(updated) => info!(updated, "orders finalized by active sync"),
            Err(e) => error!(error = %e, "order sync sweep failed"),
        }
    }
}

pub struct RefundReconcileWorker {
    refunds: Arc<RefundService>,
    interval: Duration,
    batch_size: i64,
}

impl RefundReconcileWorker {
    pub fn new(refunds: Arc<RefundService>, config: &ReconcileConfig) -> Self {
        Self {
            refunds,
            interval: Duration::from_secs(config.refund_interval_secs),
            batch_size: config.batch_size,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "refund reconcile worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refunds.sync_refunds(self.batch_size).await {
                        Ok(0) => {}
                        Ok(finalized) => info!(finalized, "refunds finalized by sync"),
                        Err(e) => error!(error = %e, "refund sync sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("refund reconcile worker stopping");
                        break;
                    }
                }
            }
        }
    }
}
