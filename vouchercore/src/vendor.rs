//! The telecom vendor seam.
//!
//! Real deployments would implement [`VendorClient`] against the carrier's
//! injection API. This crate ships [`SimulatedVendor`], which reproduces the
//! two properties that matter to the engine: multi-second latency and
//! occasional rejection. Tests pin the failure rate to `0.0` or `1.0` to get
//! deterministic outcomes.

use async_trait::async_trait;
use nutype::nutype;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{OrderId, PhoneNumber, VoucherCode};

/// Probability in `[0.0, 1.0]` that a simulated delivery is rejected.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, Into)
)]
pub struct FailureRate(f64);

/// Errors a vendor delivery can fail with.
#[derive(Debug, Clone, Error)]
pub enum VendorError {
    /// The vendor rejected the injection.
    #[error("Vendor rejected the delivery: {reason}")]
    Rejected {
        /// Vendor-side reason, recorded in the redemption log.
        reason: String,
    },

    /// The vendor did not answer within the configured deadline.
    #[error("Vendor call timed out after {0:?}")]
    TimedOut(Duration),
}

/// What the worker asks the vendor to deliver.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// The order being fulfilled, for vendor-side correlation.
    pub order_id: OrderId,
    /// The phone number to inject the code into.
    pub phone: PhoneNumber,
    /// The claimed voucher code.
    pub code: VoucherCode,
}

impl DeliveryRequest {
    /// Creates a delivery request.
    pub const fn new(order_id: OrderId, phone: PhoneNumber, code: VoucherCode) -> Self {
        Self {
            order_id,
            phone,
            code,
        }
    }
}

/// The vendor's acknowledgment of a successful delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Vendor-side transaction reference, recorded in the redemption log.
    pub vendor_ref: String,
}

/// Port for the external delivery service.
#[async_trait]
pub trait VendorClient: Send + Sync {
    /// Delivers a voucher code to a phone number.
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt, VendorError>;
}

/// Configuration for the simulated vendor.
#[derive(Debug, Clone)]
pub struct SimulatedVendorConfig {
    /// Artificial call latency.
    pub latency: Duration,
    /// Probability that a delivery is rejected.
    pub failure_rate: FailureRate,
}

impl Default for SimulatedVendorConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(2),
            failure_rate: FailureRate::try_new(0.05).expect("0.05 is a valid failure rate"),
        }
    }
}

/// A stand-in for the carrier's injection API.
#[derive(Debug, Clone, Default)]
pub struct SimulatedVendor {
    config: SimulatedVendorConfig,
}

impl SimulatedVendor {
    /// Creates a simulated vendor with the given configuration.
    pub const fn new(config: SimulatedVendorConfig) -> Self {
        Self { config }
    }

    /// A vendor with no latency that always delivers. For tests.
    pub fn instant() -> Self {
        Self::new(SimulatedVendorConfig {
            latency: Duration::ZERO,
            failure_rate: FailureRate::try_new(0.0).expect("0.0 is a valid failure rate"),
        })
    }

    /// A vendor with no latency that rejects every delivery. For tests.
    pub fn always_rejecting() -> Self {
        Self::new(SimulatedVendorConfig {
            latency: Duration::ZERO,
            failure_rate: FailureRate::try_new(1.0).expect("1.0 is a valid failure rate"),
        })
    }

    fn roll_failure(&self) -> bool {
        use rand::Rng;
        let mut rng = rand::rng();
        let roll: f64 = rng.random_range(0.0..1.0);
        roll < self.config.failure_rate.into_inner()
    }
}

#[async_trait]
impl VendorClient for SimulatedVendor {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt, VendorError> {
        debug!(order_id = %request.order_id, "simulated vendor call");
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        if self.roll_failure() {
            warn!(order_id = %request.order_id, "simulated vendor rejection");
            return Err(VendorError::Rejected {
                reason: "carrier declined the injection".to_string(),
            });
        }

        let vendor_ref = format!("TXN-{}", Uuid::now_v7().simple().to_string().to_uppercase());
        Ok(DeliveryReceipt { vendor_ref })
    }
}
