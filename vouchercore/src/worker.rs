//! The redemption worker.
//!
//! Workers drain the fulfillment outbox: claim the oldest due task, run the
//! fulfillment sequence for its order, finish the task. The sequence
//! re-verifies everything from the store because task delivery is
//! at-least-once and the world may have moved since enqueue:
//!
//! 1. Skip if the order already has a success record (redelivery guard).
//! 2. Skip unless the order's payment status is `success`.
//! 3. Skip unless the product is virtual.
//! 4. Claim one voucher; an exhausted pool writes the no-stock record and
//!    leaves the order paid-but-unfulfilled for manual intervention.
//! 5. Call the vendor under a deadline. Success writes the success record;
//!    rejection or timeout writes a failure record and the voucher stays
//!    consumed (see the claimed-is-consumed policy in [`crate::voucher`]).
//! 6. Recompute the product's stock either way.
//!
//! A vendor failure completes the task; there is no automatic re-attempt of
//! a recorded outcome. Lease expiry redelivers only tasks whose worker died
//! mid-run, and the attempt counter bounds that to `max_attempts` claims
//! before the task is abandoned.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::catalog::ProductKind;
use crate::errors::StoreResult;
use crate::order::PaymentStatus;
use crate::outbox::{FulfillmentTask, TaskDisposition};
use crate::redemption::RedemptionRecord;
use crate::store::FulfillmentStore;
use crate::types::{OrderId, Timestamp, VoucherId};
use crate::vendor::{DeliveryRequest, VendorClient, VendorError};
use crate::voucher::ClaimOutcome;

/// Configuration for the redemption worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of polling workers the pool spawns.
    pub workers: usize,
    /// How long an idle worker sleeps before polling the outbox again.
    pub poll_interval: Duration,
    /// Lease granted on a claimed task; an expired lease makes the task
    /// due again.
    pub lease: Duration,
    /// Deadline for a single vendor call; overruns count as vendor failure.
    pub vendor_timeout: Duration,
    /// Maximum number of times a task may be claimed before it is
    /// abandoned.
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(30),
            vendor_timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Why fulfillment was skipped without touching the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The order row does not exist.
    OrderMissing,
    /// The order is not settled to `success`.
    NotPaid(PaymentStatus),
    /// The order's product row does not exist.
    ProductMissing,
    /// The product is not fulfilled automatically.
    NotVirtual(ProductKind),
}

/// Outcome of one fulfillment pass over an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentReport {
    /// Delivered; the order's success record is written.
    Fulfilled {
        /// The voucher that was delivered.
        voucher_id: VoucherId,
    },
    /// The pool was exhausted; the no-stock record is written.
    OutOfStock,
    /// The vendor rejected or timed out; the failure record is written and
    /// the voucher stays consumed.
    VendorRejected {
        /// The voucher that was consumed by the failed attempt.
        voucher_id: VoucherId,
    },
    /// The order already has a success record; nothing was done.
    AlreadyFulfilled,
    /// A precondition failed; nothing was recorded.
    Skipped(SkipReason),
}

/// Runs the fulfillment sequence against a store and a vendor.
pub struct RedemptionWorker<S, V> {
    store: Arc<S>,
    vendor: Arc<V>,
    config: WorkerConfig,
}

impl<S, V> Clone for RedemptionWorker<S, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            vendor: Arc::clone(&self.vendor),
            config: self.config.clone(),
        }
    }
}

impl<S: FulfillmentStore, V: VendorClient> RedemptionWorker<S, V> {
    /// Creates a worker with the default configuration.
    pub fn new(store: Arc<S>, vendor: Arc<V>) -> Self {
        Self::with_config(store, vendor, WorkerConfig::default())
    }

    /// Creates a worker with a custom configuration.
    pub const fn with_config(store: Arc<S>, vendor: Arc<V>, config: WorkerConfig) -> Self {
        Self {
            store,
            vendor,
            config,
        }
    }

    /// The worker's configuration.
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs the fulfillment sequence for one order.
    ///
    /// Fulfillment outcomes are reports and redemption records, never
    /// errors; only store failures propagate.
    #[instrument(name = "worker.fulfill", skip(self), fields(order_id = %order_id))]
    pub async fn fulfill(&self, order_id: &OrderId) -> StoreResult<FulfillmentReport> {
        let prior = self.store.redemptions_for_order(order_id).await?;
        if prior.iter().any(RedemptionRecord::is_success) {
            debug!("order already has a success record");
            return Ok(FulfillmentReport::AlreadyFulfilled);
        }

        let Some(order) = self.store.order(order_id).await? else {
            warn!("order vanished before fulfillment");
            return Ok(FulfillmentReport::Skipped(SkipReason::OrderMissing));
        };
        if order.payment_status != PaymentStatus::Success {
            debug!(status = %order.payment_status, "order not paid, skipping");
            return Ok(FulfillmentReport::Skipped(SkipReason::NotPaid(
                order.payment_status,
            )));
        }

        let Some(product) = self.store.product(&order.product_id).await? else {
            warn!(product_id = %order.product_id, "product vanished before fulfillment");
            return Ok(FulfillmentReport::Skipped(SkipReason::ProductMissing));
        };
        if !product.kind.is_virtual() {
            debug!(kind = %product.kind, "product needs no automated fulfillment");
            return Ok(FulfillmentReport::Skipped(SkipReason::NotVirtual(
                product.kind,
            )));
        }

        let voucher = match self.store.claim_voucher(&product.id).await? {
            ClaimOutcome::Claimed(voucher) => voucher,
            ClaimOutcome::Exhausted => {
                warn!(product_id = %product.id, "voucher pool exhausted");
                self.store
                    .append_redemption(RedemptionRecord::no_stock(order.id.clone()))
                    .await?;
                return Ok(FulfillmentReport::OutOfStock);
            }
        };

        let request =
            DeliveryRequest::new(order.id.clone(), order.phone.clone(), voucher.code.clone());
        let delivery = match timeout(self.config.vendor_timeout, self.vendor.deliver(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(VendorError::TimedOut(self.config.vendor_timeout)),
        };

        let report = match delivery {
            Ok(receipt) => {
                info!(voucher_id = %voucher.id, vendor_ref = %receipt.vendor_ref, "voucher delivered");
                self.store
                    .append_redemption(RedemptionRecord::success(
                        order.id.clone(),
                        voucher.id.clone(),
                        json!({ "vendor_ref": receipt.vendor_ref }),
                    ))
                    .await?;
                FulfillmentReport::Fulfilled {
                    voucher_id: voucher.id,
                }
            }
            Err(error) => {
                warn!(voucher_id = %voucher.id, %error, "vendor delivery failed");
                self.store
                    .append_redemption(RedemptionRecord::vendor_failure(
                        order.id.clone(),
                        voucher.id.clone(),
                        json!({ "reason": error.to_string() }),
                    ))
                    .await?;
                FulfillmentReport::VendorRejected {
                    voucher_id: voucher.id,
                }
            }
        };

        self.store.recompute_stock(&product.id).await?;
        Ok(report)
    }

    /// Claims and processes at most one due task.
    ///
    /// # Returns
    /// Whether a task was handled.
    pub async fn step(&self) -> StoreResult<bool> {
        let now = Timestamp::now();
        let Some(task) = self.store.claim_due_task(now, self.config.lease).await? else {
            return Ok(false);
        };
        self.run_claimed(task).await?;
        Ok(true)
    }

    /// Claims and processes every task that is due right now.
    ///
    /// # Returns
    /// The number of tasks handled. This is the deterministic drain used by
    /// tests and drain-on-demand callers; production workers poll via
    /// [`WorkerPool::spawn`].
    pub async fn run_pending(&self) -> StoreResult<usize> {
        let mut handled = 0;
        while self.step().await? {
            handled += 1;
        }
        Ok(handled)
    }

    /// Processes a claimed task and finishes it.
    ///
    /// A store failure mid-run leaves the task in flight; the lease expiry
    /// redelivers it to another worker.
    async fn run_claimed(&self, task: FulfillmentTask) -> StoreResult<()> {
        if task.attempts > self.config.max_attempts {
            warn!(
                task_id = %task.id,
                order_id = %task.order_id,
                attempts = task.attempts,
                "abandoning fulfillment task"
            );
            return self
                .store
                .finish_task(&task.id, TaskDisposition::Abandoned)
                .await;
        }

        let report = self.fulfill(&task.order_id).await?;
        debug!(task_id = %task.id, ?report, "fulfillment task finished");
        self.store
            .finish_task(&task.id, TaskDisposition::Completed)
            .await
    }
}

/// A pool of polling workers draining the outbox.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.workers` polling loops sharing the worker's store and
    /// vendor.
    pub fn spawn<S, V>(worker: RedemptionWorker<S, V>) -> Self
    where
        S: FulfillmentStore + 'static,
        V: VendorClient + 'static,
    {
        let (shutdown_tx, _) = watch::channel(false);
        let worker_count = worker.config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let worker = worker.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                info!(worker = index, "redemption worker started");
                loop {
                    match worker.step().await {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = shutdown_rx.changed() => break,
                                _ = sleep(worker.config.poll_interval) => {}
                            }
                        }
                        Err(error) => {
                            warn!(worker = index, %error, "worker pass failed");
                            tokio::select! {
                                _ = shutdown_rx.changed() => break,
                                _ = sleep(worker.config.poll_interval) => {}
                            }
                        }
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                info!(worker = index, "redemption worker stopped");
            }));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// The number of worker loops in the pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker to stop and waits for in-flight work to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = futures::future::join_all(self.handles).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = WorkerConfig::default();
        assert!(config.workers >= 1);
        assert!(config.max_attempts >= 1);
        assert!(config.lease > config.poll_interval);
    }
}
