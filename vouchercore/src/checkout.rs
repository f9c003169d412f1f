//! Order creation.
//!
//! Placing an order validates the product (it must exist, be open for sale,
//! and show stock) *before* any row is written; a rejected placement leaves
//! no trace. The stock gate here is advisory display data. The authoritative
//! availability check happens later, when the worker claims from the pool,
//! so two orders racing for the last voucher both place fine and exactly one
//! fulfills.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::errors::{CheckoutError, CheckoutResult};
use crate::order::Order;
use crate::store::FulfillmentStore;
use crate::types::{PhoneNumber, ProductId};

/// Places orders against the catalog.
pub struct Checkout<S> {
    store: Arc<S>,
    redirect_base: String,
}

impl<S> Clone for Checkout<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            redirect_base: self.redirect_base.clone(),
        }
    }
}

impl<S: FulfillmentStore> Checkout<S> {
    /// Creates a checkout service. `redirect_base` is the mock gateway URL
    /// prefix orders direct their customers to.
    pub fn new(store: Arc<S>, redirect_base: impl Into<String>) -> Self {
        Self {
            store,
            redirect_base: redirect_base.into(),
        }
    }

    /// Places a pending order for `product_id`, snapshotting the product's
    /// current price.
    #[instrument(
        name = "checkout.place_order",
        skip(self, phone),
        fields(product_id = %product_id)
    )]
    pub async fn place_order(
        &self,
        product_id: &ProductId,
        phone: PhoneNumber,
    ) -> CheckoutResult<Order> {
        let Some(product) = self.store.product(product_id).await? else {
            return Err(CheckoutError::UnknownProduct(product_id.clone()));
        };
        if !product.active {
            return Err(CheckoutError::ProductInactive(product_id.clone()));
        }
        if product.stock == 0 {
            return Err(CheckoutError::OutOfStock(product_id.clone()));
        }

        let order = Order::place(&product, phone, &self.redirect_base);
        self.store.insert_order(order.clone()).await?;
        info!(order_id = %order.id, provider_ref = %order.provider_ref, "order placed");
        Ok(order)
    }
}
