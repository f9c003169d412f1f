//! In-memory fulfillment store for `VoucherCore`.
//!
//! This crate provides an in-memory implementation of the
//! [`FulfillmentStore`] trait, suitable for tests, examples, and local
//! development. All state lives behind one `RwLock`, so every conditional
//! write in the trait contract runs as a single critical section and the
//! atomicity guarantees hold without a database.
//!
//! Vouchers and tasks are keyed by their UUIDv7-derived identifiers in
//! ordered maps, which makes "oldest first" scans a plain in-order walk.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use vouchercore::{
    catalog::Product,
    errors::{StoreError, StoreResult},
    order::{Order, PaymentVerdict, Settlement},
    outbox::{FulfillmentTask, TaskDisposition},
    redemption::RedemptionRecord,
    store::FulfillmentStore,
    types::{OrderId, ProductId, TaskId, Timestamp, VoucherCode, VoucherId},
    voucher::{ClaimOutcome, Voucher},
};

/// Everything the store holds, guarded as one unit.
#[derive(Debug, Default)]
struct State {
    /// Maps product ids to catalog rows.
    products: BTreeMap<ProductId, Product>,
    /// Maps order ids to orders.
    orders: BTreeMap<OrderId, Order>,
    /// Maps voucher ids to vouchers; id order is mint order.
    vouchers: BTreeMap<VoucherId, Voucher>,
    /// Redemption log in append order.
    redemptions: Vec<RedemptionRecord>,
    /// Maps task ids to outbox tasks; id order is enqueue order.
    tasks: BTreeMap<TaskId, FulfillmentTask>,
}

/// In-memory implementation of the [`FulfillmentStore`] trait.
///
/// Cloning the store shares the underlying storage, so a cloned handle can
/// be moved into worker tasks while tests keep inspecting the same state.
#[derive(Debug, Clone)]
pub struct InMemoryFulfillmentStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryFulfillmentStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryFulfillmentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn count_unused(state: &State, product_id: &ProductId) -> u32 {
    let count = state
        .vouchers
        .values()
        .filter(|voucher| voucher.product_id == *product_id && !voucher.used)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn insert_product(&self, product: Product) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        if state.products.contains_key(&product.id) {
            return Err(StoreError::DuplicateProduct(product.id));
        }
        state.products.insert(product.id.clone(), product);
        Ok(())
    }

    async fn product(&self, id: &ProductId) -> StoreResult<Option<Product>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.products.get(id).cloned())
    }

    async fn recompute_stock(&self, id: &ProductId) -> StoreResult<u32> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let stock = count_unused(&state, id);
        let product = state
            .products
            .get_mut(id)
            .ok_or_else(|| StoreError::ProductNotFound(id.clone()))?;
        product.stock = stock;
        Ok(stock)
    }

    async fn unused_voucher_count(&self, id: &ProductId) -> StoreResult<u32> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(count_unused(&state, id))
    }

    async fn insert_order(&self, order: Order) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::DuplicateOrder(order.id));
        }
        state.orders.insert(order.id.clone(), order);
        Ok(())
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.orders.get(id).cloned())
    }

    async fn settle_order(
        &self,
        id: &OrderId,
        verdict: PaymentVerdict,
    ) -> StoreResult<Settlement> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let Some(order) = state.orders.get(id) else {
            return Err(StoreError::OrderNotFound(id.clone()));
        };
        if order.payment_status.is_terminal() {
            return Ok(Settlement::AlreadySettled(order.payment_status));
        }
        let settled = order.clone().settled(verdict.status(), Timestamp::now());
        state.orders.insert(id.clone(), settled.clone());
        if let PaymentVerdict::Succeeded {
            followup: Some(task),
        } = verdict
        {
            state.tasks.insert(task.id, task);
        }
        Ok(Settlement::Applied(settled))
    }

    async fn insert_vouchers(&self, vouchers: Vec<Voucher>) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        // Validate the whole batch before touching the pool so a rejected
        // batch leaves nothing behind.
        let mut seen: HashSet<(ProductId, VoucherCode)> = state
            .vouchers
            .values()
            .map(|voucher| (voucher.product_id.clone(), voucher.code.clone()))
            .collect();
        for voucher in &vouchers {
            if !state.products.contains_key(&voucher.product_id) {
                return Err(StoreError::ProductNotFound(voucher.product_id.clone()));
            }
            if !seen.insert((voucher.product_id.clone(), voucher.code.clone())) {
                return Err(StoreError::DuplicateVoucherCode {
                    product: voucher.product_id.clone(),
                    code: voucher.code.clone(),
                });
            }
        }
        for voucher in vouchers {
            state.vouchers.insert(voucher.id.clone(), voucher);
        }
        Ok(())
    }

    async fn claim_voucher(&self, product_id: &ProductId) -> StoreResult<ClaimOutcome> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let claimed = state
            .vouchers
            .values_mut()
            .find(|voucher| voucher.product_id == *product_id && !voucher.used)
            .map(|voucher| {
                *voucher = voucher.clone().into_claimed(Timestamp::now());
                voucher.clone()
            });
        Ok(claimed.map_or(ClaimOutcome::Exhausted, ClaimOutcome::Claimed))
    }

    async fn voucher(&self, id: &VoucherId) -> StoreResult<Option<Voucher>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state.vouchers.get(id).cloned())
    }

    async fn append_redemption(&self, record: RedemptionRecord) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        state.redemptions.push(record);
        Ok(())
    }

    async fn redemptions_for_order(
        &self,
        order_id: &OrderId,
    ) -> StoreResult<Vec<RedemptionRecord>> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .redemptions
            .iter()
            .filter(|record| record.order_id == *order_id)
            .cloned()
            .collect())
    }

    async fn enqueue_task(&self, task: FulfillmentTask) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn claim_due_task(
        &self,
        now: Timestamp,
        lease: Duration,
    ) -> StoreResult<Option<FulfillmentTask>> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let lease_until = now.saturating_add(lease);
        let claimed = state
            .tasks
            .values_mut()
            .find(|task| task.is_due(now))
            .map(|task| {
                *task = task.clone().claimed_until(lease_until);
                task.clone()
            });
        Ok(claimed)
    }

    async fn finish_task(&self, id: &TaskId, disposition: TaskDisposition) -> StoreResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(*id))?;
        task.status = disposition.status();
        task.lease_until = None;
        Ok(())
    }

    async fn open_task_count(&self) -> StoreResult<u32> {
        let state = self.state.read().expect("RwLock poisoned");
        let count = state
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
