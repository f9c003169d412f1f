//! Fulfillment store abstraction.
//!
//! This module defines the `FulfillmentStore` trait that serves as the port
//! interface for storage backends. The races named in the engine's design
//! (double-claiming a voucher, double-settling an order, losing a dispatch)
//! are closed *here*, by specifying every contended write as a single
//! conditional operation, so services stay free of backend-specific locking.

use async_trait::async_trait;

use crate::catalog::Product;
use crate::errors::StoreResult;
use crate::order::{Order, PaymentVerdict, Settlement};
use crate::outbox::{FulfillmentTask, TaskDisposition};
use crate::redemption::RedemptionRecord;
use crate::types::{OrderId, ProductId, TaskId, Timestamp, VoucherId};
use crate::voucher::{ClaimOutcome, Voucher};

/// The storage port every backend must satisfy.
///
/// All mutating operations are atomic per call. Conditional writes that do
/// not apply report outcome enums (`Settlement::AlreadySettled`,
/// `ClaimOutcome::Exhausted`, `None` from `claim_due_task`) rather than
/// errors, so callers can branch without string-matching.
#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    // --- catalog ---

    /// Inserts a product.
    ///
    /// # Errors
    /// Returns `StoreError::DuplicateProduct` if the id is already taken.
    async fn insert_product(&self, product: Product) -> StoreResult<()>;

    /// Reads a product, or `None` if it does not exist.
    async fn product(&self, id: &ProductId) -> StoreResult<Option<Product>>;

    /// Recounts the product's unused vouchers and persists the count as its
    /// stock. Idempotent; safe to run concurrently with claims (the counter
    /// may be momentarily stale, never the pool itself).
    ///
    /// # Returns
    /// The freshly persisted stock value.
    ///
    /// # Errors
    /// Returns `StoreError::ProductNotFound` if the product does not exist.
    async fn recompute_stock(&self, id: &ProductId) -> StoreResult<u32>;

    /// Counts the product's unused vouchers without persisting anything.
    async fn unused_voucher_count(&self, id: &ProductId) -> StoreResult<u32>;

    // --- orders ---

    /// Inserts an order.
    ///
    /// # Errors
    /// Returns `StoreError::DuplicateOrder` if the id is already taken.
    async fn insert_order(&self, order: Order) -> StoreResult<()>;

    /// Reads an order, or `None` if it does not exist.
    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>>;

    /// Applies a terminal payment transition as one conditional write:
    /// "set the verdict's status where the current status is `pending`".
    ///
    /// When the transition applies and the verdict carries a followup task,
    /// the task is enqueued in the same atomic unit; when the transition
    /// does not apply, no task is enqueued and nothing changes.
    ///
    /// # Returns
    /// `Settlement::Applied` with the settled order, or
    /// `Settlement::AlreadySettled` with the existing terminal status.
    ///
    /// # Errors
    /// Returns `StoreError::OrderNotFound` if the order does not exist.
    async fn settle_order(&self, id: &OrderId, verdict: PaymentVerdict)
        -> StoreResult<Settlement>;

    // --- voucher pool ---

    /// Imports a batch of minted vouchers into their pools.
    ///
    /// # Errors
    /// Returns `StoreError::ProductNotFound` if a voucher references a
    /// missing product, and `StoreError::DuplicateVoucherCode` if a code
    /// already exists in its product's pool. The batch applies atomically.
    async fn insert_vouchers(&self, vouchers: Vec<Voucher>) -> StoreResult<()>;

    /// Claims one unused voucher from `product_id`'s pool as one conditional
    /// write: select an unused voucher, mark it used, return it. Under
    /// concurrent invocation each voucher is handed to exactly one caller.
    ///
    /// # Returns
    /// `ClaimOutcome::Claimed` with the consumed voucher, or
    /// `ClaimOutcome::Exhausted` (no unused voucher; nothing changed).
    async fn claim_voucher(&self, product_id: &ProductId) -> StoreResult<ClaimOutcome>;

    /// Reads a voucher, or `None` if it does not exist.
    async fn voucher(&self, id: &VoucherId) -> StoreResult<Option<Voucher>>;

    // --- redemption log ---

    /// Appends a record to the redemption log. The log is append-only;
    /// there is no update or delete.
    async fn append_redemption(&self, record: RedemptionRecord) -> StoreResult<()>;

    /// Reads an order's redemption records in attempt order.
    async fn redemptions_for_order(&self, order_id: &OrderId)
        -> StoreResult<Vec<RedemptionRecord>>;

    // --- fulfillment outbox ---

    /// Enqueues a task directly. The normal path enqueues through
    /// [`Self::settle_order`]; this is the operator's re-dispatch hook for
    /// orders that need another fulfillment attempt.
    async fn enqueue_task(&self, task: FulfillmentTask) -> StoreResult<()>;

    /// Claims the oldest due task as one conditional write: a task is due
    /// when `queued`, or `in_flight` with a lease expired at `now`. The
    /// claimed task is moved to `in_flight` with its attempt counter bumped
    /// and a fresh lease of `lease` from `now`.
    ///
    /// # Returns
    /// The claimed task, or `None` when nothing is due.
    async fn claim_due_task(
        &self,
        now: Timestamp,
        lease: std::time::Duration,
    ) -> StoreResult<Option<FulfillmentTask>>;

    /// Finishes a claimed task with a terminal disposition.
    ///
    /// # Errors
    /// Returns `StoreError::TaskNotFound` if the task does not exist.
    async fn finish_task(&self, id: &TaskId, disposition: TaskDisposition) -> StoreResult<()>;

    /// Counts tasks that are not yet terminal.
    async fn open_task_count(&self) -> StoreResult<u32>;
}
