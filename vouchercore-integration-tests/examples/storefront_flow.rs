//! End-to-end storefront walkthrough.
//!
//! This example shows:
//! - Seeding a catalog and importing a voucher pool
//! - Placing an order and reading its tracking view
//! - Settling the order through an idempotent gateway webhook
//! - Watching the worker pool deliver the voucher in the background
//!
//! Run with `cargo run -p vouchercore-integration-tests --example storefront_flow`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use vouchercore::{
    Checkout, FailureRate, FulfillmentStore, OrderTracking, PaymentIntake, PhoneNumber, Price,
    Product, ProductId, ProductKind, ProductName, RedemptionWorker, SimulatedVendor,
    SimulatedVendorConfig, Voucher, VoucherCode, WorkerConfig, WorkerPool,
};
use vouchercore_memory::InMemoryFulfillmentStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let store = Arc::new(InMemoryFulfillmentStore::new());

    // Seed the catalog with a virtual bundle backed by a small voucher pool
    let product = Product::new(
        ProductId::generate(),
        ProductName::try_new("5GB Data Bundle")?,
        ProductKind::Virtual,
        Price::try_new(2_500)?,
    );
    store.insert_product(product.clone()).await?;
    let batch: Vec<Voucher> = (1..=5)
        .map(|i| {
            VoucherCode::try_new(format!("BUNDLE5GB-{i:03}"))
                .map(|code| Voucher::mint(product.id.clone(), code))
        })
        .collect::<Result<_, _>>()?;
    store.insert_vouchers(batch).await?;
    let stock = store.recompute_stock(&product.id).await?;
    info!(product = %product.name, stock, "catalog ready");

    // Background redemption workers against the simulated vendor
    let vendor = SimulatedVendor::new(SimulatedVendorConfig {
        latency: Duration::from_millis(400),
        failure_rate: FailureRate::try_new(0.0)?,
    });
    let config = WorkerConfig {
        workers: 2,
        poll_interval: Duration::from_millis(100),
        ..WorkerConfig::default()
    };
    let workers = WorkerPool::spawn(RedemptionWorker::with_config(
        Arc::clone(&store),
        Arc::new(vendor),
        config,
    ));

    // A customer places an order
    let checkout = Checkout::new(Arc::clone(&store), "https://gateway.example/pay");
    let tracking = OrderTracking::new(Arc::clone(&store));
    let order = checkout
        .place_order(&product.id, PhoneNumber::try_new("+4915557201984")?)
        .await?;
    println!("order {} placed, pay at {}", order.id, order.redirect_url);

    let view = tracking.view(&order.id).await?;
    println!("tracking: status={} redirect={:?}", view.status, view.redirect_url);

    // The gateway calls back; webhooks are idempotent, so retries are safe
    let intake = PaymentIntake::new(Arc::clone(&store));
    let body = serde_json::json!({ "reference": order.id, "status": "success" }).to_string();
    let first = intake.handle_webhook(body.as_bytes()).await?;
    println!("webhook applied: {first:?}");
    let retry = intake.handle_webhook(body.as_bytes()).await?;
    println!("webhook retried: {retry:?}");

    // Wait for the background workers to drain the outbox
    for _ in 0..100u32 {
        if store.open_task_count().await? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for record in store.redemptions_for_order(&order.id).await? {
        println!(
            "redemption: outcome={} voucher={:?} detail={}",
            record.outcome, record.voucher_id, record.detail
        );
    }
    let view = tracking.view(&order.id).await?;
    let stock = store.recompute_stock(&product.id).await?;
    println!("final: status={} stock={stock}", view.status);

    workers.shutdown().await;
    Ok(())
}
