//! The append-only redemption log.
//!
//! Every fulfillment attempt leaves exactly one record: success or failure,
//! which voucher (if any) was consumed, and a free-form JSON diagnostic.
//! Records are never updated or deleted. A record with no voucher reference
//! is the no-stock sentinel: the worker found the pool exhausted.
//!
//! The hard invariant, enforced by the worker's re-entry guard and asserted
//! in tests, is that an order has at most one `success` record.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{AttemptId, OrderId, Timestamp, VoucherId};

/// Outcome of one fulfillment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionOutcome {
    /// The vendor accepted the injection.
    Success,
    /// The attempt failed; the diagnostic says why.
    Failure,
}

impl RedemptionOutcome {
    /// The lowercase token stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for RedemptionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown redemption outcome token.
#[derive(Debug, Clone, Error)]
#[error("Unknown redemption outcome: '{0}'")]
pub struct UnknownRedemptionOutcome(pub String);

impl FromStr for RedemptionOutcome {
    type Err = UnknownRedemptionOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(UnknownRedemptionOutcome(other.to_string())),
        }
    }
}

/// One row of the redemption log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    /// Attempt identifier; UUIDv7, so the log sorts chronologically.
    pub attempt_id: AttemptId,
    /// The order this attempt fulfilled.
    pub order_id: OrderId,
    /// The voucher consumed by this attempt. `None` is the no-stock
    /// sentinel: the pool was exhausted and nothing was consumed.
    pub voucher_id: Option<VoucherId>,
    /// Whether the attempt succeeded.
    pub outcome: RedemptionOutcome,
    /// Free-form diagnostic payload (vendor receipt, rejection reason).
    pub detail: serde_json::Value,
    /// When the attempt was recorded.
    pub recorded_at: Timestamp,
}

impl RedemptionRecord {
    /// Records a successful delivery of `voucher_id` for `order_id`.
    pub fn success(order_id: OrderId, voucher_id: VoucherId, detail: serde_json::Value) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            order_id,
            voucher_id: Some(voucher_id),
            outcome: RedemptionOutcome::Success,
            detail,
            recorded_at: Timestamp::now(),
        }
    }

    /// Records that the pool was exhausted when fulfillment ran.
    pub fn no_stock(order_id: OrderId) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            order_id,
            voucher_id: None,
            outcome: RedemptionOutcome::Failure,
            detail: json!({ "reason": "voucher pool exhausted" }),
            recorded_at: Timestamp::now(),
        }
    }

    /// Records a vendor rejection. The voucher stays consumed.
    pub fn vendor_failure(
        order_id: OrderId,
        voucher_id: VoucherId,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            order_id,
            voucher_id: Some(voucher_id),
            outcome: RedemptionOutcome::Failure,
            detail,
            recorded_at: Timestamp::now(),
        }
    }

    /// Whether this record is the order's success record.
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, RedemptionOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VoucherId;

    fn order_id() -> OrderId {
        OrderId::try_new("ORD-TEST1").unwrap()
    }

    #[test]
    fn success_record_references_the_voucher() {
        let voucher_id = VoucherId::generate();
        let record = RedemptionRecord::success(
            order_id(),
            voucher_id.clone(),
            json!({ "vendor_ref": "TXN-1" }),
        );
        assert!(record.is_success());
        assert_eq!(record.voucher_id, Some(voucher_id));
    }

    #[test]
    fn no_stock_record_has_sentinel_and_failure_outcome() {
        let record = RedemptionRecord::no_stock(order_id());
        assert!(!record.is_success());
        assert!(record.voucher_id.is_none());
        assert_eq!(record.detail["reason"], "voucher pool exhausted");
    }

    #[test]
    fn vendor_failure_keeps_voucher_reference() {
        let voucher_id = VoucherId::generate();
        let record = RedemptionRecord::vendor_failure(
            order_id(),
            voucher_id.clone(),
            json!({ "reason": "vendor declined" }),
        );
        assert!(!record.is_success());
        assert_eq!(record.voucher_id, Some(voucher_id));
    }

    #[test]
    fn outcome_tokens_round_trip() {
        for outcome in [RedemptionOutcome::Success, RedemptionOutcome::Failure] {
            assert_eq!(
                outcome.as_str().parse::<RedemptionOutcome>().unwrap(),
                outcome
            );
        }
        assert!("partial".parse::<RedemptionOutcome>().is_err());
    }

    #[test]
    fn attempt_ids_order_chronologically() {
        let first = RedemptionRecord::no_stock(order_id());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RedemptionRecord::no_stock(order_id());
        assert!(first.attempt_id < second.attempt_id);
    }
}
