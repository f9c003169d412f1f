//! Vouchers and the claim contract.
//!
//! # Claimed is consumed
//!
//! A voucher leaves the pool the instant it is claimed: the claim operation
//! flips `used` in the same conditional write that selects the voucher, and
//! nothing ever flips it back. If the vendor later rejects the injection the
//! voucher stays consumed and the failure is recorded in the redemption log;
//! support staff resolve such orders manually, re-dispatching with a fresh
//! voucher when appropriate. Automatic release would risk handing a code to
//! two customers, which is the one failure this engine must never produce.

use serde::{Deserialize, Serialize};

use crate::types::{ProductId, Timestamp, VoucherCode, VoucherId};

/// A single redeemable code in a product's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher identifier.
    pub id: VoucherId,
    /// The product whose pool this voucher belongs to.
    pub product_id: ProductId,
    /// The vendor-issued code. Unique within the product's pool.
    pub code: VoucherCode,
    /// Whether the voucher has been consumed. Transitions false to true
    /// exactly once.
    pub used: bool,
    /// When the voucher was consumed, if it has been.
    pub used_at: Option<Timestamp>,
}

impl Voucher {
    /// Mints an unused voucher for a product's pool.
    pub fn mint(product_id: ProductId, code: VoucherCode) -> Self {
        Self {
            id: VoucherId::generate(),
            product_id,
            code,
            used: false,
            used_at: None,
        }
    }

    /// Returns the consumed form of this voucher. Store adapters apply this
    /// inside the conditional claim write.
    #[must_use]
    pub const fn into_claimed(mut self, at: Timestamp) -> Self {
        self.used = true;
        self.used_at = Some(at);
        self
    }
}

/// Outcome of attempting to claim one unused voucher from a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// One voucher was atomically marked used and handed to the caller.
    Claimed(Voucher),
    /// The pool has no unused voucher; nothing changed.
    Exhausted,
}

impl ClaimOutcome {
    /// Whether the pool was exhausted.
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_voucher_is_unused() {
        let voucher = Voucher::mint(
            ProductId::try_new("PRD-AIRTIME5").unwrap(),
            VoucherCode::try_new("1111-2222-3333").unwrap(),
        );
        assert!(!voucher.used);
        assert!(voucher.used_at.is_none());
        assert!(voucher.id.as_ref().starts_with("VCH-"));
    }

    #[test]
    fn claimed_voucher_records_consumption_time() {
        let voucher = Voucher::mint(
            ProductId::try_new("PRD-AIRTIME5").unwrap(),
            VoucherCode::try_new("4444-5555-6666").unwrap(),
        );
        let at = Timestamp::now();
        let claimed = voucher.into_claimed(at);
        assert!(claimed.used);
        assert_eq!(claimed.used_at, Some(at));
    }

    #[test]
    fn exhausted_outcome_reports_itself() {
        assert!(ClaimOutcome::Exhausted.is_exhausted());
        let voucher = Voucher::mint(
            ProductId::try_new("PRD-AIRTIME5").unwrap(),
            VoucherCode::try_new("7777-8888-9999").unwrap(),
        );
        assert!(!ClaimOutcome::Claimed(voucher).is_exhausted());
    }
}
