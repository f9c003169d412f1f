//! Shared fixtures for the end-to-end suite.
//!
//! Builds seeded in-memory stores and deterministic vendor doubles so each
//! test can wire up the full checkout, intake, worker, tracking stack in a
//! couple of lines.

// Allow dead_code because not all test binaries use all exports from this module
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

use vouchercore::{
    DeliveryReceipt, DeliveryRequest, FulfillmentStore, PhoneNumber, Price, Product, ProductId,
    ProductKind, ProductName, VendorClient, VendorError, Voucher, VoucherCode,
};
use vouchercore_memory::InMemoryFulfillmentStore;

/// A virtual airtime bundle with a fresh id, priced at 1500 minor units.
pub fn airtime_product() -> Product {
    Product::new(
        ProductId::generate(),
        ProductName::try_new("Airtime 1500").unwrap(),
        ProductKind::Virtual,
        Price::try_new(1500).unwrap(),
    )
}

/// A physical product with a fresh id and display stock.
pub fn physical_product() -> Product {
    Product::new(
        ProductId::generate(),
        ProductName::try_new("Branded mug").unwrap(),
        ProductKind::Physical,
        Price::try_new(4000).unwrap(),
    )
    .with_stock(5)
}

/// A valid delivery phone number.
pub fn phone() -> PhoneNumber {
    PhoneNumber::try_new("+4915557201984").unwrap()
}

/// A voucher code no other test run can collide with.
pub fn unique_code() -> VoucherCode {
    VoucherCode::try_new(Uuid::now_v7().simple().to_string()).unwrap()
}

/// A store holding one virtual product backed by `pool_size` unused
/// vouchers, with the display stock already recomputed.
pub async fn seeded_store(pool_size: usize) -> (Arc<InMemoryFulfillmentStore>, Product) {
    let store = Arc::new(InMemoryFulfillmentStore::new());
    let product = airtime_product();
    store.insert_product(product.clone()).await.unwrap();

    if pool_size > 0 {
        let batch = (0..pool_size)
            .map(|_| Voucher::mint(product.id.clone(), unique_code()))
            .collect();
        store.insert_vouchers(batch).await.unwrap();
    }
    let stock = store.recompute_stock(&product.id).await.unwrap();

    let product = product.with_stock(stock);
    (store, product)
}

/// A vendor that rejects the first `failing(n)` deliveries and accepts
/// everything after, for exercising operator re-dispatch after vendor
/// trouble.
pub struct FlakyVendor {
    remaining_failures: AtomicU32,
}

impl FlakyVendor {
    /// A vendor that will reject exactly `times` deliveries.
    pub const fn failing(times: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(times),
        }
    }
}

#[async_trait]
impl VendorClient for FlakyVendor {
    async fn deliver(&self, _request: DeliveryRequest) -> Result<DeliveryReceipt, VendorError> {
        let failures_left = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failures_left.is_ok() {
            return Err(VendorError::Rejected {
                reason: "simulated carrier outage".to_string(),
            });
        }
        let vendor_ref = format!("TXN-{}", Uuid::now_v7().simple().to_string().to_uppercase());
        Ok(DeliveryReceipt { vendor_ref })
    }
}
