//! `VoucherCore` - order payment and voucher redemption engine
//!
//! Checkout creates pending orders against a catalog; payment events settle
//! them through an idempotent conditional gate; paid virtual orders are
//! fulfilled asynchronously by claiming codes from a per-product voucher
//! pool and injecting them through a telecom vendor, with every attempt
//! recorded in an append-only redemption log.
//!
//! The storage boundary is the [`store::FulfillmentStore`] port; the
//! `vouchercore-memory` and `vouchercore-postgres` crates provide adapters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod checkout;
pub mod errors;
pub mod intake;
pub mod order;
pub mod outbox;
pub mod redemption;
pub mod store;
pub mod tracking;
pub mod types;
pub mod vendor;
pub mod voucher;
pub mod worker;

pub use catalog::{Product, ProductKind};
pub use checkout::Checkout;
pub use errors::{
    CheckoutError, CheckoutResult, IntakeError, IntakeResult, StoreError, StoreResult,
    TrackingError, TrackingResult,
};
pub use intake::{IntakeOutcome, PaymentIntake, PaymentNotice, PaymentOutcome};
pub use order::{Order, PaymentStatus, PaymentVerdict, Settlement};
pub use outbox::{FulfillmentTask, TaskDisposition, TaskStatus};
pub use redemption::{RedemptionOutcome, RedemptionRecord};
pub use store::FulfillmentStore;
pub use tracking::{OrderTracking, OrderView, ProductSnapshot};
pub use types::{
    AttemptId, OrderId, PhoneNumber, Price, ProductId, ProductName, ProviderRef, TaskId,
    Timestamp, VoucherCode, VoucherId,
};
pub use vendor::{
    DeliveryReceipt, DeliveryRequest, FailureRate, SimulatedVendor, SimulatedVendorConfig,
    VendorClient, VendorError,
};
pub use voucher::{ClaimOutcome, Voucher};
pub use worker::{FulfillmentReport, RedemptionWorker, SkipReason, WorkerConfig, WorkerPool};
