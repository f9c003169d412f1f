//! The durable fulfillment outbox.
//!
//! Marking an order paid and scheduling its fulfillment must not be two
//! separate writes: a crash between them would strand a paid order with no
//! one ever redeeming it. The settle gate therefore enqueues the task in the
//! same atomic unit as the status transition, and workers consume tasks with
//! a lease so a worker crash redelivers the task instead of losing it.
//!
//! Delivery is at-least-once. The worker's re-entry guard (skip orders that
//! already have a success record) makes redelivery safe, and the attempt
//! counter bounds crash loops: a task claimed more than the configured
//! maximum is finished as `abandoned`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::types::{OrderId, TaskId, Timestamp};

/// Lifecycle status of a fulfillment task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed by a worker; redelivered if the lease expires.
    InFlight,
    /// The worker finished processing; terminal.
    Completed,
    /// Given up after too many claims; terminal.
    Abandoned,
}

impl TaskStatus {
    /// The lowercase token stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether this status can never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown task status token.
#[derive(Debug, Clone, Error)]
#[error("Unknown task status: '{0}'")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// How a worker finishes a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// The fulfillment attempt ran to a recorded outcome.
    Completed,
    /// The task was claimed too many times; give up.
    Abandoned,
}

impl TaskDisposition {
    /// The terminal status this disposition settles the task to.
    pub const fn status(self) -> TaskStatus {
        match self {
            Self::Completed => TaskStatus::Completed,
            Self::Abandoned => TaskStatus::Abandoned,
        }
    }
}

/// One entry in the fulfillment outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentTask {
    /// Task identifier; UUIDv7, so id order is enqueue order.
    pub id: TaskId,
    /// The order to fulfill.
    pub order_id: OrderId,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// How many times a worker has claimed this task.
    pub attempts: u32,
    /// When the task was enqueued.
    pub enqueued_at: Timestamp,
    /// Lease expiry while in flight; an expired lease makes the task due
    /// again.
    pub lease_until: Option<Timestamp>,
}

impl FulfillmentTask {
    /// Creates a queued task for `order_id`.
    pub fn for_order(order_id: OrderId) -> Self {
        Self {
            id: TaskId::new(),
            order_id,
            status: TaskStatus::Queued,
            attempts: 0,
            enqueued_at: Timestamp::now(),
            lease_until: None,
        }
    }

    /// Whether a worker may claim this task at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.status {
            TaskStatus::Queued => true,
            TaskStatus::InFlight => self.lease_until.map_or(true, |lease| lease <= now),
            TaskStatus::Completed | TaskStatus::Abandoned => false,
        }
    }

    /// Returns the in-flight form of this task: one more attempt, leased
    /// until `lease_until`. Store adapters apply this inside the conditional
    /// claim write.
    #[must_use]
    pub const fn claimed_until(mut self, lease_until: Timestamp) -> Self {
        self.status = TaskStatus::InFlight;
        self.attempts += 1;
        self.lease_until = Some(lease_until);
        self
    }
}
