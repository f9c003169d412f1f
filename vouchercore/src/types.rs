//! Core identifier and value types for the `VoucherCore` engine.
//!
//! Every type here uses a smart constructor so that validity is established
//! at construction time, following the "parse, don't validate" principle.
//! Identifiers generated by this crate are backed by UUIDv7, which gives
//! audit rows and queue entries a chronological sort order for free.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order identifier.
///
/// Format: `ORD-{UPPERCASE_ALPHANUMERIC}`, for example `ORD-0198C2F1A4B27E5D`.
/// Order ids are opaque to the payment provider; webhooks echo them back in
/// the `reference` field.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64, regex = r"^ORD-[A-Z0-9]+$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct OrderId(String);

impl OrderId {
    /// Generates a new order id from a UUIDv7, so ids sort by creation time.
    pub fn generate() -> Self {
        let uuid = Uuid::now_v7().simple().to_string().to_uppercase();
        Self::try_new(format!("ORD-{uuid}")).expect("Generated OrderId should be valid")
    }
}

/// A product identifier.
///
/// Format: `PRD-{UPPERCASE_ALPHANUMERIC}`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64, regex = r"^PRD-[A-Z0-9]+$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct ProductId(String);

impl ProductId {
    /// Generates a new product id from a UUIDv7.
    pub fn generate() -> Self {
        let uuid = Uuid::now_v7().simple().to_string().to_uppercase();
        Self::try_new(format!("PRD-{uuid}")).expect("Generated ProductId should be valid")
    }
}

/// A voucher identifier.
///
/// Format: `VCH-{UPPERCASE_ALPHANUMERIC}`. Because the suffix is a UUIDv7,
/// lexicographic order over voucher ids matches mint order, which the
/// adapters rely on to hand out the oldest unused voucher first.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64, regex = r"^VCH-[A-Z0-9]+$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct VoucherId(String);

impl VoucherId {
    /// Generates a new voucher id from a UUIDv7.
    pub fn generate() -> Self {
        let uuid = Uuid::now_v7().simple().to_string().to_uppercase();
        Self::try_new(format!("VCH-{uuid}")).expect("Generated VoucherId should be valid")
    }
}

/// The payment provider's transaction reference attached to an order.
///
/// Format: `INV-{UPPERCASE_ALPHANUMERIC}`. Generated at order creation in
/// place of a real gateway invoice id.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64, regex = r"^INV-[A-Z0-9]+$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct ProviderRef(String);

impl ProviderRef {
    /// Generates a new provider reference from a UUIDv7.
    pub fn generate() -> Self {
        let uuid = Uuid::now_v7().simple().to_string().to_uppercase();
        Self::try_new(format!("INV-{uuid}")).expect("Generated ProviderRef should be valid")
    }
}

/// A globally unique fulfillment attempt identifier using UUIDv7 format.
///
/// `AttemptId` values are guaranteed to be UUIDv7, which provides:
/// - Time-based ordering, so the redemption log reads chronologically
/// - Globally unique identification
/// - Monotonic sort order for attempts recorded in sequence
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Creates a new `AttemptId` with the current timestamp.
    pub fn new() -> Self {
        // This will always succeed as Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

/// A fulfillment task identifier using UUIDv7 format.
///
/// Ordering tasks by id is ordering them by enqueue time, which is how the
/// outbox picks the oldest due task.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new `TaskId` with the current timestamp.
    pub fn new() -> Self {
        // This will always succeed as Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// A redeemable voucher code as imported from the telecom vendor.
///
/// Codes are unique within their product's pool; the adapters enforce that.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct VoucherCode(String);

/// A customer phone number in loosely international form.
///
/// Digits with an optional leading `+`, 6 to 20 digits. The engine never
/// interprets the number; it is the delivery target handed to the vendor.
#[nutype(
    sanitize(trim),
    validate(regex = r"^\+?[0-9]{6,20}$"),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct PhoneNumber(String);

/// A human-readable product name.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 120),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Display,
        AsRef,
        Deref,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct ProductName(String);

/// A price in integer minor currency units (for example cents).
///
/// Zero is not a sellable price; free giveaways are out of scope here.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Price(u64);

impl Price {
    /// Returns the price in minor units.
    pub fn minor_units(self) -> u64 {
        self.into()
    }
}

/// A timestamp for when something happened in the engine.
///
/// This wrapper ensures consistent timestamp handling throughout the system
/// and enables future enhancements like custom serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Adds a standard-library duration, saturating at the maximum
    /// representable instant. Used for outbox lease arithmetic.
    #[must_use]
    pub fn saturating_add(self, duration: std::time::Duration) -> Self {
        chrono::Duration::from_std(duration).map_or(Self(DateTime::<Utc>::MAX_UTC), |d| {
            Self(self.0.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC))
        })
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl AsRef<DateTime<Utc>> for Timestamp {
    fn as_ref(&self) -> &DateTime<Utc> {
        self.as_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
