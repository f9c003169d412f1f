//! Read-only order tracking.
//!
//! Every view reads through to the store. No cache sits in this path, so a
//! transition committed by intake or the worker is visible on the very next
//! call; a customer refreshing their tracking page never sees a stale
//! `pending` after payment has settled.

use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::catalog::ProductKind;
use crate::errors::{TrackingError, TrackingResult};
use crate::order::PaymentStatus;
use crate::store::FulfillmentStore;
use crate::types::{OrderId, PhoneNumber, Price, ProductId, ProductName, Timestamp};

/// The slice of product data shown on a tracking page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSnapshot {
    /// Product identifier.
    pub product_id: ProductId,
    /// Display name.
    pub name: ProductName,
    /// Fulfillment kind.
    pub kind: ProductKind,
}

/// A customer-facing view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderView {
    /// Order identifier.
    pub order_id: OrderId,
    /// Current payment status.
    pub status: PaymentStatus,
    /// Delivery target.
    pub phone: PhoneNumber,
    /// Price snapshot taken at placement.
    pub price: Price,
    /// The ordered product.
    pub product: ProductSnapshot,
    /// Gateway redirect, present only while the order is `pending`.
    pub redirect_url: Option<String>,
    /// When the order was placed.
    pub created_at: Timestamp,
}

/// Read-only facade over orders for the tracking page.
pub struct OrderTracking<S> {
    store: Arc<S>,
}

impl<S> Clone for OrderTracking<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: FulfillmentStore> OrderTracking<S> {
    /// Creates a tracking facade over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Builds the tracking view for an order.
    #[instrument(name = "tracking.view", skip(self), fields(order_id = %order_id))]
    pub async fn view(&self, order_id: &OrderId) -> TrackingResult<OrderView> {
        let Some(order) = self.store.order(order_id).await? else {
            return Err(TrackingError::UnknownOrder(order_id.clone()));
        };
        let Some(product) = self.store.product(&order.product_id).await? else {
            return Err(TrackingError::UnknownProduct(order.product_id));
        };

        let redirect_url =
            (order.payment_status == PaymentStatus::Pending).then(|| order.redirect_url.clone());

        Ok(OrderView {
            order_id: order.id,
            status: order.payment_status,
            phone: order.phone,
            price: order.price,
            product: ProductSnapshot {
                product_id: product.id,
                name: product.name,
                kind: product.kind,
            },
            redirect_url,
            created_at: order.created_at,
        })
    }
}
