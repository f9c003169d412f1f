//! Catalog entities as seen by the fulfillment engine.
//!
//! Products are owned by the storefront catalog. This engine reads them to
//! validate order placement and, for virtual products, recomputes the derived
//! stock counter after every claim.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::types::{Price, ProductId, ProductName};

/// How a product is fulfilled once paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Shipped goods; fulfillment is a manual process outside this engine.
    Physical,
    /// Voucher-backed goods redeemed automatically against the vendor.
    Virtual,
    /// Services scheduled by staff; no automated fulfillment.
    Service,
}

impl ProductKind {
    /// The lowercase token stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Physical => "physical",
            Self::Virtual => "virtual",
            Self::Service => "service",
        }
    }

    /// Whether paid orders of this kind go through automated redemption.
    pub const fn is_virtual(self) -> bool {
        matches!(self, Self::Virtual)
    }
}

impl std::fmt::Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown product kind token.
#[derive(Debug, Clone, Error)]
#[error("Unknown product kind: '{0}'")]
pub struct UnknownProductKind(pub String);

impl FromStr for ProductKind {
    type Err = UnknownProductKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "physical" => Ok(Self::Physical),
            "virtual" => Ok(Self::Virtual),
            "service" => Ok(Self::Service),
            other => Err(UnknownProductKind(other.to_string())),
        }
    }
}

/// A sellable product.
///
/// For virtual products `stock` is derived from the count of unused vouchers
/// and is recomputed by the engine; it is display data, never the
/// authoritative availability check (the voucher pool is).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier.
    pub id: ProductId,
    /// Display name.
    pub name: ProductName,
    /// Fulfillment kind.
    pub kind: ProductKind,
    /// Unit price in minor currency units.
    pub price: Price,
    /// Remaining stock counter.
    pub stock: u32,
    /// Whether the product is open for sale.
    pub active: bool,
}

impl Product {
    /// Creates an active product with zero stock.
    pub const fn new(id: ProductId, name: ProductName, kind: ProductKind, price: Price) -> Self {
        Self {
            id,
            name,
            kind,
            price,
            stock: 0,
            active: true,
        }
    }

    /// Sets the stock counter.
    #[must_use]
    pub const fn with_stock(mut self, stock: u32) -> Self {
        self.stock = stock;
        self
    }

    /// Sets the active flag.
    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}
