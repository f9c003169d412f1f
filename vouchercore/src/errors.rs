//! Error types for `VoucherCore`.
//!
//! The error design follows these principles:
//!
//! - **Rich error information**: Include context to help diagnose issues
//! - **Type safety**: Different error types for different subsystems
//! - **Composable**: Errors can be converted between layers
//!
//! # Error Categories
//!
//! - **StoreError**: Storage and persistence layer failures
//! - **IntakeError**: Payment event intake failures
//! - **CheckoutError**: Order creation failures
//! - **TrackingError**: Order tracking lookup failures
//!
//! Fulfillment-path outcomes (out of stock, vendor rejection) are
//! deliberately *not* errors: the worker records them in the redemption log
//! and moves on. Only infrastructure failures propagate as `StoreError`.

use crate::types::{OrderId, ProductId, TaskId, VoucherCode};
use thiserror::Error;

/// Errors that can occur when interacting with the fulfillment store.
///
/// `StoreError` represents failures at the persistence layer. Conditional
/// writes that simply do not apply (an already-settled order, an exhausted
/// voucher pool, no due task) are expressed as outcome enums on the store
/// trait, not as errors.
///
/// # Common Scenarios
///
/// - **OrderNotFound / ProductNotFound**: The referenced row does not exist
/// - **DuplicateOrder / DuplicateProduct**: Insert hit an existing id
/// - **DuplicateVoucherCode**: A code was imported twice into one pool
/// - **ConnectionFailed**: Network or database issues
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The requested order was not found.
    #[error("Order '{0}' not found")]
    OrderNotFound(OrderId),

    /// The requested product was not found.
    #[error("Product '{0}' not found")]
    ProductNotFound(ProductId),

    /// The requested fulfillment task was not found.
    #[error("Fulfillment task '{0}' not found")]
    TaskNotFound(TaskId),

    /// An order with the given id already exists.
    #[error("Order '{0}' already exists")]
    DuplicateOrder(OrderId),

    /// A product with the given id already exists.
    #[error("Product '{0}' already exists")]
    DuplicateProduct(ProductId),

    /// A voucher with the given code already exists in the product's pool.
    #[error("Voucher code '{code}' already exists in the pool of product '{product}'")]
    DuplicateVoucherCode {
        /// The pool the duplicate was imported into
        product: ProductId,
        /// The colliding code
        code: VoucherCode,
    },

    /// The connection to the store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization of a diagnostic payload failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization of a stored row failed.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors that can occur while ingesting a payment event.
///
/// # Error Handling Strategy
///
/// - **UnknownOrder**: The provider referenced an order this system never
///   issued; respond not-found and investigate
/// - **MalformedPayload / UnrecognizedOutcome**: Reject the webhook so the
///   provider retries or alerts; never guess a payment outcome
/// - **Store**: Infrastructure failure, retry-worthy
///
/// A duplicate event is *not* an error: `PaymentIntake::apply` reports it as
/// [`crate::intake::IntakeOutcome::AlreadySettled`].
#[derive(Debug, Clone, Error)]
pub enum IntakeError {
    /// The event referenced an order that does not exist.
    #[error("Unknown order reference: {0}")]
    UnknownOrder(OrderId),

    /// The webhook body could not be parsed.
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// The webhook carried a payment status this system does not recognize.
    #[error("Unrecognized payment outcome: '{0}'")]
    UnrecognizedOutcome(String),

    /// An error occurred in the fulfillment store.
    #[error("Store error: {0}")]
    Store(StoreError),
}

/// Errors that can occur while placing an order.
#[derive(Debug, Clone, Error)]
pub enum CheckoutError {
    /// The product does not exist.
    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    /// The product exists but is not open for sale.
    #[error("Product '{0}' is not open for sale")]
    ProductInactive(ProductId),

    /// The product has no stock left.
    #[error("Product '{0}' is out of stock")]
    OutOfStock(ProductId),

    /// An error occurred in the fulfillment store.
    #[error("Store error: {0}")]
    Store(StoreError),
}

/// Errors that can occur while looking up an order for tracking.
#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    /// The order does not exist.
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    /// The order references a product that no longer exists.
    #[error("Order references unknown product: {0}")]
    UnknownProduct(ProductId),

    /// An error occurred in the fulfillment store.
    #[error("Store error: {0}")]
    Store(StoreError),
}

/// Type alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Type alias for payment intake results.
pub type IntakeResult<T> = Result<T, IntakeError>;

/// Type alias for checkout results.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Type alias for tracking results.
pub type TrackingResult<T> = Result<T, TrackingError>;

impl From<StoreError> for IntakeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(id) => Self::UnknownOrder(id),
            other => Self::Store(other),
        }
    }
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProductNotFound(id) => Self::UnknownProduct(id),
            other => Self::Store(other),
        }
    }
}

impl From<StoreError> for TrackingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OrderNotFound(id) => Self::UnknownOrder(id),
            StoreError::ProductNotFound(id) => Self::UnknownProduct(id),
            other => Self::Store(other),
        }
    }
}
