//! Payment event intake.
//!
//! Normalizes provider notifications into a [`PaymentNotice`] and applies
//! them through the store's settle gate. The conditional transition is the
//! sole idempotency mechanism: however many times a provider retries a
//! webhook, and however many intake calls race, exactly one observes
//! `Settlement::Applied` and dispatches fulfillment; the rest see
//! [`IntakeOutcome::AlreadySettled`] and change nothing.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::errors::{IntakeError, IntakeResult};
use crate::order::{PaymentStatus, PaymentVerdict, Settlement};
use crate::outbox::FulfillmentTask;
use crate::store::FulfillmentStore;
use crate::types::{OrderId, TaskId};

/// Payment outcome reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The customer paid.
    Success,
    /// The payment was declined or aborted.
    Failed,
    /// The payment window lapsed without payment.
    Expired,
}

impl PaymentOutcome {
    /// Parses a provider status token, case-insensitively.
    fn from_token(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// The raw webhook body shape.
///
/// The mock gateway posts `{"reference": "<order id>", "status": "<token>"}`.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    reference: String,
    status: String,
}

/// A normalized payment notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    /// The order the provider is reporting on.
    pub order_id: OrderId,
    /// The reported outcome.
    pub outcome: PaymentOutcome,
}

impl PaymentNotice {
    /// Parses a webhook body into a normalized notice.
    ///
    /// Signature verification is deliberately absent: the mock gateway signs
    /// nothing. A real provider integration must authenticate the request
    /// before this call.
    pub fn parse_webhook(body: &[u8]) -> IntakeResult<Self> {
        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| IntakeError::MalformedPayload(e.to_string()))?;
        let order_id = OrderId::try_new(payload.reference)
            .map_err(|e| IntakeError::MalformedPayload(e.to_string()))?;
        let outcome = PaymentOutcome::from_token(&payload.status)
            .ok_or_else(|| IntakeError::UnrecognizedOutcome(payload.status.clone()))?;
        Ok(Self { order_id, outcome })
    }
}

/// What applying a payment notice did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// The order was marked paid and a fulfillment task was enqueued with it.
    Dispatched {
        /// The enqueued task.
        task_id: TaskId,
    },
    /// The order was marked failed; there is nothing to fulfill.
    MarkedFailed,
    /// The order was already terminal; duplicate event, nothing changed.
    AlreadySettled {
        /// The status the order already had.
        status: PaymentStatus,
    },
}

/// Ingests payment events, from provider webhooks or operator action.
pub struct PaymentIntake<S> {
    store: Arc<S>,
}

impl<S> Clone for PaymentIntake<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: FulfillmentStore> PaymentIntake<S> {
    /// Creates an intake over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Applies a payment notice through the settle gate.
    ///
    /// A `Success` outcome carries a fulfillment task into the gate, so the
    /// paid transition and the dispatch are one atomic unit. `Failed` and
    /// `Expired` settle the order to `failed` with no redemption attempt.
    #[instrument(
        name = "intake.apply",
        skip(self, notice),
        fields(order_id = %notice.order_id, outcome = ?notice.outcome)
    )]
    pub async fn apply(&self, notice: PaymentNotice) -> IntakeResult<IntakeOutcome> {
        match notice.outcome {
            PaymentOutcome::Success => {
                let task = FulfillmentTask::for_order(notice.order_id.clone());
                let task_id = task.id;
                let verdict = PaymentVerdict::Succeeded {
                    followup: Some(task),
                };
                match self.store.settle_order(&notice.order_id, verdict).await? {
                    Settlement::Applied(_) => {
                        info!(task_id = %task_id, "order marked paid, fulfillment dispatched");
                        Ok(IntakeOutcome::Dispatched { task_id })
                    }
                    Settlement::AlreadySettled(status) => {
                        debug!(%status, "duplicate payment event ignored");
                        Ok(IntakeOutcome::AlreadySettled { status })
                    }
                }
            }
            PaymentOutcome::Failed | PaymentOutcome::Expired => {
                match self
                    .store
                    .settle_order(&notice.order_id, PaymentVerdict::Failed)
                    .await?
                {
                    Settlement::Applied(_) => {
                        info!("order marked failed");
                        Ok(IntakeOutcome::MarkedFailed)
                    }
                    Settlement::AlreadySettled(status) => {
                        debug!(%status, "duplicate payment event ignored");
                        Ok(IntakeOutcome::AlreadySettled { status })
                    }
                }
            }
        }
    }

    /// Parses and applies a webhook body in one call.
    pub async fn handle_webhook(&self, body: &[u8]) -> IntakeResult<IntakeOutcome> {
        let notice = PaymentNotice::parse_webhook(body)?;
        self.apply(notice).await
    }

    /// Operator trigger: mark an order paid as if the provider had
    /// confirmed it. Same path as a `success` webhook.
    pub async fn simulate_success(&self, order_id: OrderId) -> IntakeResult<IntakeOutcome> {
        info!(%order_id, "operator payment simulation");
        self.apply(PaymentNotice {
            order_id,
            outcome: PaymentOutcome::Success,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_webhook() {
        let body = br#"{"reference": "ORD-ABC123", "status": "success"}"#;
        let notice = PaymentNotice::parse_webhook(body).unwrap();
        assert_eq!(notice.order_id.as_ref(), "ORD-ABC123");
        assert_eq!(notice.outcome, PaymentOutcome::Success);
    }

    #[test]
    fn status_tokens_are_case_insensitive() {
        let body = br#"{"reference": "ORD-ABC123", "status": " EXPIRED "}"#;
        let notice = PaymentNotice::parse_webhook(body).unwrap();
        assert_eq!(notice.outcome, PaymentOutcome::Expired);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = PaymentNotice::parse_webhook(b"not json").unwrap_err();
        assert!(matches!(err, IntakeError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = PaymentNotice::parse_webhook(br#"{"reference": "ORD-ABC123"}"#).unwrap_err();
        assert!(matches!(err, IntakeError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_invalid_order_reference() {
        let body = br#"{"reference": "order-17", "status": "success"}"#;
        let err = PaymentNotice::parse_webhook(body).unwrap_err();
        assert!(matches!(err, IntakeError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_unknown_status_token() {
        let body = br#"{"reference": "ORD-ABC123", "status": "refunded"}"#;
        match PaymentNotice::parse_webhook(body).unwrap_err() {
            IntakeError::UnrecognizedOutcome(token) => assert_eq!(token, "refunded"),
            other => panic!("Expected UnrecognizedOutcome, got {other:?}"),
        }
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let body =
            br#"{"reference": "ORD-ABC123", "status": "failed", "amount": 500, "psp": "mock"}"#;
        let notice = PaymentNotice::parse_webhook(body).unwrap();
        assert_eq!(notice.outcome, PaymentOutcome::Failed);
    }
}
