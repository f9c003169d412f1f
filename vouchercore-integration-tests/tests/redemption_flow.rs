//! End-to-end scenarios over checkout, intake, the worker, and tracking.
//!
//! Every test wires the real services over the in-memory adapter and drives
//! them the way production traffic would: place an order, deliver a gateway
//! webhook, drain the outbox, read the tracking view.

mod common;

use common::{FlakyVendor, phone, physical_product, seeded_store};
use std::sync::Arc;
use std::time::Duration;
use vouchercore::{
    Checkout, CheckoutError, FulfillmentReport, FulfillmentStore, FulfillmentTask, IntakeError,
    IntakeOutcome, OrderId, OrderTracking, PaymentIntake, PaymentStatus, ProductId, ProductKind,
    RedemptionWorker, SimulatedVendor, SkipReason, Timestamp, WorkerConfig, WorkerPool,
};

const GATEWAY: &str = "https://pay.example/checkout";

fn success_webhook(order_id: &OrderId) -> String {
    serde_json::json!({ "reference": order_id, "status": "success" }).to_string()
}

#[tokio::test]
async fn test_paid_order_is_fulfilled_end_to_end() {
    let (store, product) = seeded_store(3).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let tracking = OrderTracking::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(SimulatedVendor::instant()));

    // Given a placed order awaiting payment
    let order = checkout.place_order(&product.id, phone()).await.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Pending);

    let view = tracking.view(&order.id).await.unwrap();
    assert_eq!(view.status, PaymentStatus::Pending);
    assert_eq!(view.price, order.price);
    let redirect = view
        .redirect_url
        .expect("pending orders expose the gateway redirect");
    assert_eq!(redirect, order.redirect_url);
    assert!(redirect.starts_with(GATEWAY));

    // When the gateway confirms payment
    let outcome = intake
        .handle_webhook(success_webhook(&order.id).as_bytes())
        .await
        .unwrap();
    assert!(matches!(outcome, IntakeOutcome::Dispatched { .. }));

    // Then one drain of the outbox fulfills the order
    assert_eq!(worker.run_pending().await.unwrap(), 1);

    let settled = store.order(&order.id).await.unwrap().unwrap();
    assert_eq!(settled.payment_status, PaymentStatus::Success);
    assert!(settled.settled_at.is_some());

    let log = store.redemptions_for_order(&order.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].is_success());
    let vendor_ref = log[0].detail["vendor_ref"]
        .as_str()
        .expect("success records carry the vendor receipt");
    assert!(vendor_ref.starts_with("TXN-"));

    let voucher_id = log[0].voucher_id.clone().expect("success names the voucher");
    let voucher = store.voucher(&voucher_id).await.unwrap().unwrap();
    assert!(voucher.used);
    assert!(voucher.used_at.is_some());

    // The claim shrank the pool and the queue is empty again
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 2);
    assert_eq!(store.product(&product.id).await.unwrap().unwrap().stock, 2);
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    // And the tracking page shows the settled order without a redirect
    let view = tracking.view(&order.id).await.unwrap();
    assert_eq!(view.status, PaymentStatus::Success);
    assert!(view.redirect_url.is_none());
}

#[tokio::test]
async fn test_duplicate_success_webhooks_settle_once() {
    let (store, product) = seeded_store(2).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(SimulatedVendor::instant()));

    let order = checkout.place_order(&product.id, phone()).await.unwrap();
    let body = success_webhook(&order.id);

    let first = intake.handle_webhook(body.as_bytes()).await.unwrap();
    assert!(matches!(first, IntakeOutcome::Dispatched { .. }));

    // The gateway retries before fulfillment has run
    assert_eq!(
        intake.handle_webhook(body.as_bytes()).await.unwrap(),
        IntakeOutcome::AlreadySettled {
            status: PaymentStatus::Success
        }
    );
    assert_eq!(store.open_task_count().await.unwrap(), 1);

    assert_eq!(worker.run_pending().await.unwrap(), 1);

    // And again afterwards
    assert_eq!(
        intake.handle_webhook(body.as_bytes()).await.unwrap(),
        IntakeOutcome::AlreadySettled {
            status: PaymentStatus::Success
        }
    );
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    let log = store.redemptions_for_order(&order.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].is_success());
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_last_voucher_goes_to_one_of_two_paid_orders() {
    let (store, product) = seeded_store(1).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(SimulatedVendor::instant()));

    // Placement only gates on display stock, so both orders go through
    let first = checkout.place_order(&product.id, phone()).await.unwrap();
    let second = checkout.place_order(&product.id, phone()).await.unwrap();
    intake.simulate_success(first.id.clone()).await.unwrap();
    intake.simulate_success(second.id.clone()).await.unwrap();

    assert_eq!(worker.run_pending().await.unwrap(), 2);

    let first_log = store.redemptions_for_order(&first.id).await.unwrap();
    let second_log = store.redemptions_for_order(&second.id).await.unwrap();
    assert_eq!(first_log.len(), 1);
    assert_eq!(second_log.len(), 1);

    // Exactly one order won the voucher; the other got the no-stock record
    let winners = first_log
        .iter()
        .chain(second_log.iter())
        .filter(|record| record.is_success())
        .count();
    assert_eq!(winners, 1);
    let loser = first_log
        .iter()
        .chain(second_log.iter())
        .find(|record| !record.is_success())
        .unwrap();
    assert!(loser.voucher_id.is_none());

    // Both orders stay paid; the unfulfilled one is an operator problem
    for id in [&first.id, &second.id] {
        let order = store.order(id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Success);
    }
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 0);
    assert_eq!(store.open_task_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_vendor_rejection_consumes_voucher_until_operator_redispatch() {
    let (store, product) = seeded_store(2).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(FlakyVendor::failing(1)));

    let order = checkout.place_order(&product.id, phone()).await.unwrap();
    intake.simulate_success(order.id.clone()).await.unwrap();

    // The first delivery is rejected; the claimed voucher is not returned
    assert_eq!(worker.run_pending().await.unwrap(), 1);
    let log = store.redemptions_for_order(&order.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].is_success());
    let burned = log[0].voucher_id.clone().expect("the failed attempt names its voucher");
    assert!(store.voucher(&burned).await.unwrap().unwrap().used);
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    // An operator re-dispatches; the retry claims the next voucher
    store
        .enqueue_task(FulfillmentTask::for_order(order.id.clone()))
        .await
        .unwrap();
    assert_eq!(worker.run_pending().await.unwrap(), 1);

    let log = store.redemptions_for_order(&order.id).await.unwrap();
    assert_eq!(log.len(), 2);
    let delivered = log.iter().find(|record| record.is_success()).unwrap();
    assert_ne!(delivered.voucher_id.as_ref(), Some(&burned));
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 0);

    // Once delivered, further fulfillment attempts are no-ops
    assert_eq!(
        worker.fulfill(&order.id).await.unwrap(),
        FulfillmentReport::AlreadyFulfilled
    );
    assert_eq!(store.redemptions_for_order(&order.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_checkout_rejects_unknown_inactive_and_sold_out_products() {
    let (store, sold_out) = seeded_store(0).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);

    let missing = ProductId::generate();
    match checkout.place_order(&missing, phone()).await.unwrap_err() {
        CheckoutError::UnknownProduct(id) => assert_eq!(id, missing),
        other => panic!("Expected UnknownProduct, got {other:?}"),
    }

    let shelved = physical_product().with_active(false);
    store.insert_product(shelved.clone()).await.unwrap();
    assert!(matches!(
        checkout.place_order(&shelved.id, phone()).await.unwrap_err(),
        CheckoutError::ProductInactive(_)
    ));

    assert!(matches!(
        checkout.place_order(&sold_out.id, phone()).await.unwrap_err(),
        CheckoutError::OutOfStock(_)
    ));
}

#[tokio::test]
async fn test_failed_payment_settles_without_fulfillment() {
    let (store, product) = seeded_store(1).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let tracking = OrderTracking::new(Arc::clone(&store));

    let order = checkout.place_order(&product.id, phone()).await.unwrap();
    let body = serde_json::json!({ "reference": order.id, "status": "failed" }).to_string();
    assert_eq!(
        intake.handle_webhook(body.as_bytes()).await.unwrap(),
        IntakeOutcome::MarkedFailed
    );

    let settled = store.order(&order.id).await.unwrap().unwrap();
    assert_eq!(settled.payment_status, PaymentStatus::Failed);
    assert!(settled.settled_at.is_some());
    assert_eq!(store.open_task_count().await.unwrap(), 0);
    assert!(store.redemptions_for_order(&order.id).await.unwrap().is_empty());

    // A late success webhook cannot resurrect a failed order
    assert_eq!(
        intake
            .handle_webhook(success_webhook(&order.id).as_bytes())
            .await
            .unwrap(),
        IntakeOutcome::AlreadySettled {
            status: PaymentStatus::Failed
        }
    );
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    let view = tracking.view(&order.id).await.unwrap();
    assert_eq!(view.status, PaymentStatus::Failed);
    assert!(view.redirect_url.is_none());
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_intake_rejects_unknown_orders_and_bad_payloads() {
    let (store, _product) = seeded_store(1).await;
    let intake = PaymentIntake::new(Arc::clone(&store));

    let ghost = OrderId::generate();
    match intake
        .handle_webhook(success_webhook(&ghost).as_bytes())
        .await
        .unwrap_err()
    {
        IntakeError::UnknownOrder(id) => assert_eq!(id, ghost),
        other => panic!("Expected UnknownOrder, got {other:?}"),
    }
    // A rejected event dispatches nothing
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    assert!(matches!(
        intake.handle_webhook(b"definitely not json").await.unwrap_err(),
        IntakeError::MalformedPayload(_)
    ));

    let refund = serde_json::json!({ "reference": ghost, "status": "refunded" }).to_string();
    assert!(matches!(
        intake.handle_webhook(refund.as_bytes()).await.unwrap_err(),
        IntakeError::UnrecognizedOutcome(_)
    ));
}

#[tokio::test]
async fn test_worker_skips_orders_with_nothing_to_fulfill() {
    let (store, product) = seeded_store(1).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(SimulatedVendor::instant()));

    // Physical goods settle like anything else but are never auto-fulfilled
    let mug = physical_product();
    store.insert_product(mug.clone()).await.unwrap();
    let mug_order = checkout.place_order(&mug.id, phone()).await.unwrap();
    intake.simulate_success(mug_order.id.clone()).await.unwrap();
    assert!(worker.step().await.unwrap());
    assert_eq!(
        worker.fulfill(&mug_order.id).await.unwrap(),
        FulfillmentReport::Skipped(SkipReason::NotVirtual(ProductKind::Physical))
    );
    assert!(store.redemptions_for_order(&mug_order.id).await.unwrap().is_empty());
    assert_eq!(store.open_task_count().await.unwrap(), 0);

    // Unpaid orders are skipped, and the pool is left alone
    let pending = checkout.place_order(&product.id, phone()).await.unwrap();
    assert_eq!(
        worker.fulfill(&pending.id).await.unwrap(),
        FulfillmentReport::Skipped(SkipReason::NotPaid(PaymentStatus::Pending))
    );
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);

    // As are orders the store has never seen
    assert_eq!(
        worker.fulfill(&OrderId::generate()).await.unwrap(),
        FulfillmentReport::Skipped(SkipReason::OrderMissing)
    );
}

#[tokio::test]
async fn test_tasks_exceeding_the_attempt_budget_are_abandoned() {
    let (store, product) = seeded_store(1).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));
    let worker = RedemptionWorker::new(Arc::clone(&store), Arc::new(SimulatedVendor::instant()));
    let max_attempts = worker.config().max_attempts;

    let order = checkout.place_order(&product.id, phone()).await.unwrap();
    intake.simulate_success(order.id.clone()).await.unwrap();

    // Exhaust the attempt budget with claims whose workers "died": claim in
    // the past so each lease has already expired by the next claim.
    let mut when = Timestamp::new(chrono::Utc::now() - chrono::Duration::minutes(10));
    for expected in 1..=max_attempts {
        let task = store
            .claim_due_task(when, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("the task lease has expired and it is due again");
        assert_eq!(task.attempts, expected);
        when = when.saturating_add(Duration::from_secs(31));
    }

    // The next claim exceeds the budget, so the worker abandons the task
    // without touching the order or the pool
    assert!(worker.step().await.unwrap());
    assert_eq!(store.open_task_count().await.unwrap(), 0);
    assert!(store.redemptions_for_order(&order.id).await.unwrap().is_empty());
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);
    assert!(!worker.step().await.unwrap());
}

#[tokio::test]
async fn test_worker_pool_drains_the_outbox_in_the_background() {
    let (store, product) = seeded_store(4).await;
    let checkout = Checkout::new(Arc::clone(&store), GATEWAY);
    let intake = PaymentIntake::new(Arc::clone(&store));

    let mut orders = Vec::new();
    for _ in 0..3 {
        let order = checkout.place_order(&product.id, phone()).await.unwrap();
        intake.simulate_success(order.id.clone()).await.unwrap();
        orders.push(order);
    }
    assert_eq!(store.open_task_count().await.unwrap(), 3);

    let config = WorkerConfig {
        workers: 3,
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    };
    let pool = WorkerPool::spawn(RedemptionWorker::with_config(
        Arc::clone(&store),
        Arc::new(SimulatedVendor::instant()),
        config,
    ));
    assert_eq!(pool.worker_count(), 3);

    let mut polls = 0;
    while store.open_task_count().await.unwrap() > 0 {
        polls += 1;
        assert!(polls < 500, "outbox never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await;

    for order in &orders {
        let log = store.redemptions_for_order(&order.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_success());
    }
    assert_eq!(store.unused_voucher_count(&product.id).await.unwrap(), 1);
}
