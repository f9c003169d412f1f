//! Orders and the terminal payment transition.
//!
//! An order's payment status starts at `pending` and moves exactly once to
//! `success` or `failed`. The transition is a conditional write owned by the
//! store (`set terminal where status = pending`), so replayed or racing
//! payment events collapse into a single applied transition; everyone else
//! observes [`Settlement::AlreadySettled`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::catalog::Product;
use crate::outbox::FulfillmentTask;
use crate::types::{OrderId, PhoneNumber, Price, ProductId, ProviderRef, Timestamp};

/// Payment status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Awaiting a payment event from the provider.
    Pending,
    /// Payment confirmed; terminal.
    Success,
    /// Payment failed or expired; terminal.
    Failed,
}

impl PaymentStatus {
    /// The lowercase token stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Whether this status can never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown payment status token.
#[derive(Debug, Clone, Error)]
#[error("Unknown payment status: '{0}'")]
pub struct UnknownPaymentStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownPaymentStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownPaymentStatus(other.to_string())),
        }
    }
}

/// The resolution a payment event asks the settle gate to apply.
///
/// A successful payment may carry a fulfillment task; the store enqueues it
/// in the same atomic unit as the status transition, and only when the
/// transition actually applies.
#[derive(Debug, Clone)]
pub enum PaymentVerdict {
    /// The provider confirmed payment.
    Succeeded {
        /// Task to enqueue atomically with the transition.
        followup: Option<FulfillmentTask>,
    },
    /// The payment failed or expired.
    Failed,
}

impl PaymentVerdict {
    /// The terminal status this verdict settles the order to.
    pub const fn status(&self) -> PaymentStatus {
        match self {
            Self::Succeeded { .. } => PaymentStatus::Success,
            Self::Failed => PaymentStatus::Failed,
        }
    }
}

/// Outcome of the conditional settle write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// The transition applied; the order row after the write.
    Applied(Order),
    /// The order was already terminal; nothing changed.
    AlreadySettled(PaymentStatus),
}

impl Settlement {
    /// Whether the transition applied.
    pub const fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier, echoed back by provider webhooks.
    pub id: OrderId,
    /// The product this order is for.
    pub product_id: ProductId,
    /// Delivery target for virtual fulfillment.
    pub phone: PhoneNumber,
    /// Price snapshot taken at placement; later catalog edits do not apply.
    pub price: Price,
    /// Current payment status.
    pub payment_status: PaymentStatus,
    /// Provider transaction reference issued at placement.
    pub provider_ref: ProviderRef,
    /// Gateway URL the customer is redirected to for payment.
    pub redirect_url: String,
    /// When the order was placed.
    pub created_at: Timestamp,
    /// When the payment status became terminal, if it has.
    pub settled_at: Option<Timestamp>,
}

impl Order {
    /// Creates a pending order for `product`, snapshotting its price and
    /// deriving the gateway redirect from `redirect_base`.
    pub fn place(product: &Product, phone: PhoneNumber, redirect_base: &str) -> Self {
        let provider_ref = ProviderRef::generate();
        let redirect_url = format!(
            "{}/{}",
            redirect_base.trim_end_matches('/'),
            provider_ref.as_ref()
        );
        Self {
            id: OrderId::generate(),
            product_id: product.id.clone(),
            phone,
            price: product.price,
            payment_status: PaymentStatus::Pending,
            provider_ref,
            redirect_url,
            created_at: Timestamp::now(),
            settled_at: None,
        }
    }

    /// Returns a copy settled to `status` at `at`. Used by store adapters
    /// after the conditional transition check has passed.
    #[must_use]
    pub fn settled(mut self, status: PaymentStatus, at: Timestamp) -> Self {
        self.payment_status = status;
        self.settled_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductKind;
    use crate::types::ProductName;

    fn sample_product() -> Product {
        Product::new(
            ProductId::try_new("PRD-DATA1GB").unwrap(),
            ProductName::try_new("1 GB data bundle").unwrap(),
            ProductKind::Virtual,
            Price::try_new(1500).unwrap(),
        )
        .with_stock(3)
    }

    #[test]
    fn placed_order_is_pending_with_price_snapshot() {
        let product = sample_product();
        let order = Order::place(
            &product,
            PhoneNumber::try_new("+4915551234567").unwrap(),
            "https://pay.example.test",
        );

        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(order.price, product.price);
        assert_eq!(order.product_id, product.id);
        assert!(order.settled_at.is_none());
        assert_eq!(
            order.redirect_url,
            format!("https://pay.example.test/{}", order.provider_ref)
        );
    }

    #[test]
    fn redirect_base_trailing_slash_is_normalized() {
        let order = Order::place(
            &sample_product(),
            PhoneNumber::try_new("+4915551234567").unwrap(),
            "https://pay.example.test/",
        );
        assert!(!order.redirect_url.contains(".test//"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Success.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
    }

    #[test]
    fn status_tokens_round_trip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Success,
            PaymentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn verdict_maps_to_terminal_status() {
        assert_eq!(
            PaymentVerdict::Succeeded { followup: None }.status(),
            PaymentStatus::Success
        );
        assert_eq!(PaymentVerdict::Failed.status(), PaymentStatus::Failed);
    }

    #[test]
    fn settled_copy_carries_status_and_time() {
        let order = Order::place(
            &sample_product(),
            PhoneNumber::try_new("491701112223").unwrap(),
            "https://pay.example.test",
        );
        let at = Timestamp::now();
        let settled = order.settled(PaymentStatus::Success, at);
        assert_eq!(settled.payment_status, PaymentStatus::Success);
        assert_eq!(settled.settled_at, Some(at));
    }
}
