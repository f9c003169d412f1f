//! PostgreSQL adapter for the `VoucherCore` fulfillment engine.
//!
//! This crate implements the [`FulfillmentStore`] trait on top of a
//! PostgreSQL connection pool. The contended writes in the trait contract
//! (voucher claims, order settlement, task leasing) are expressed as single
//! conditional statements using `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never hand out the same voucher or task twice and never block
//! each other on hot rows.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use vouchercore::{
    catalog::{Product, ProductKind},
    errors::{StoreError, StoreResult},
    order::{Order, PaymentStatus, PaymentVerdict, Settlement},
    outbox::{FulfillmentTask, TaskDisposition, TaskStatus},
    redemption::{RedemptionOutcome, RedemptionRecord},
    store::FulfillmentStore,
    types::{
        AttemptId, OrderId, PhoneNumber, Price, ProductId, ProductName, ProviderRef, TaskId,
        Timestamp, VoucherCode, VoucherId,
    },
    voucher::{ClaimOutcome, Voucher},
};

/// Error type for constructing the PostgreSQL store.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying
/// type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Schema statements applied by [`PostgresFulfillmentStore::initialize`].
///
/// Every statement is idempotent, so initialize can run on every startup.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS vouchercore_products (
        product_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        price_minor BIGINT NOT NULL,
        stock BIGINT NOT NULL DEFAULT 0,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS vouchercore_orders (
        order_id TEXT PRIMARY KEY,
        product_id TEXT NOT NULL,
        phone TEXT NOT NULL,
        price_minor BIGINT NOT NULL,
        payment_status TEXT NOT NULL,
        provider_ref TEXT NOT NULL UNIQUE,
        redirect_url TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        settled_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS vouchercore_vouchers (
        voucher_id TEXT PRIMARY KEY,
        product_id TEXT NOT NULL REFERENCES vouchercore_products (product_id),
        code TEXT NOT NULL,
        used BOOLEAN NOT NULL DEFAULT FALSE,
        used_at TIMESTAMPTZ,
        UNIQUE (product_id, code)
    )",
    "CREATE INDEX IF NOT EXISTS idx_vouchercore_vouchers_unused
        ON vouchercore_vouchers (product_id, voucher_id)
        WHERE NOT used",
    "CREATE TABLE IF NOT EXISTS vouchercore_redemptions (
        attempt_id UUID PRIMARY KEY,
        order_id TEXT NOT NULL,
        voucher_id TEXT,
        outcome TEXT NOT NULL,
        detail JSONB NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_vouchercore_redemptions_order
        ON vouchercore_redemptions (order_id, attempt_id)",
    "CREATE TABLE IF NOT EXISTS vouchercore_tasks (
        task_id UUID PRIMARY KEY,
        order_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts BIGINT NOT NULL DEFAULT 0,
        enqueued_at TIMESTAMPTZ NOT NULL,
        lease_until TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_vouchercore_tasks_open
        ON vouchercore_tasks (task_id)
        WHERE status IN ('queued', 'in_flight')",
];

/// PostgreSQL implementation of the [`FulfillmentStore`] trait.
#[derive(Debug, Clone)]
pub struct PostgresFulfillmentStore {
    pool: Pool<Postgres>,
}

impl PostgresFulfillmentStore {
    /// Creates a new store with default pool configuration.
    ///
    /// # Errors
    /// Returns `PostgresStoreError::ConnectionFailed` if the pool cannot be
    /// created.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Creates a new store with custom pool configuration.
    ///
    /// # Errors
    /// Returns `PostgresStoreError::ConnectionFailed` if the pool cannot be
    /// created.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Creates a store from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want
    /// to share a pool across multiple components.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Checks that the database responds.
    ///
    /// # Errors
    /// Returns `StoreError::ConnectionFailed` if the round trip fails.
    pub async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, "ping"))?;
        Ok(())
    }

    /// Creates the engine's tables and indexes if they do not exist.
    ///
    /// Safe to call on every startup.
    ///
    /// # Errors
    /// Returns `StoreError` if a schema statement fails.
    #[instrument(name = "postgres.initialize", skip(self))]
    pub async fn initialize(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            query(statement)
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, "initialize"))?;
        }
        debug!("schema is in place");
        Ok(())
    }
}

/// Database row representing a product.
#[derive(Debug)]
struct ProductRow {
    product_id: String,
    name: String,
    kind: String,
    price_minor: i64,
    stock: i64,
    active: bool,
}

impl TryFrom<PgRow> for ProductRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            product_id: row.try_get("product_id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            price_minor: row.try_get("price_minor")?,
            stock: row.try_get("stock")?,
            active: row.try_get("active")?,
        })
    }
}

impl ProductRow {
    fn into_product(self) -> StoreResult<Product> {
        let id = ProductId::try_new(self.product_id)
            .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
        let name = ProductName::try_new(self.name)
            .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
        let kind: ProductKind = self
            .kind
            .parse()
            .map_err(|e: vouchercore::catalog::UnknownProductKind| {
                StoreError::DeserializationFailed(e.to_string())
            })?;
        let price = price_from_db(self.price_minor)?;
        let stock = u32::try_from(self.stock)
            .map_err(|_| StoreError::DeserializationFailed("negative stock".to_string()))?;
        Ok(Product::new(id, name, kind, price)
            .with_stock(stock)
            .with_active(self.active))
    }
}

/// Database row representing an order.
#[derive(Debug)]
struct OrderRow {
    order_id: String,
    product_id: String,
    phone: String,
    price_minor: i64,
    payment_status: String,
    provider_ref: String,
    redirect_url: String,
    created_at: chrono::DateTime<chrono::Utc>,
    settled_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<PgRow> for OrderRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            order_id: row.try_get("order_id")?,
            product_id: row.try_get("product_id")?,
            phone: row.try_get("phone")?,
            price_minor: row.try_get("price_minor")?,
            payment_status: row.try_get("payment_status")?,
            provider_ref: row.try_get("provider_ref")?,
            redirect_url: row.try_get("redirect_url")?,
            created_at: row.try_get("created_at")?,
            settled_at: row.try_get("settled_at")?,
        })
    }
}

impl OrderRow {
    fn into_order(self) -> StoreResult<Order> {
        Ok(Order {
            id: OrderId::try_new(self.order_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            product_id: ProductId::try_new(self.product_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            phone: PhoneNumber::try_new(self.phone)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            price: price_from_db(self.price_minor)?,
            payment_status: parse_payment_status(&self.payment_status)?,
            provider_ref: ProviderRef::try_new(self.provider_ref)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            redirect_url: self.redirect_url,
            created_at: Timestamp::new(self.created_at),
            settled_at: self.settled_at.map(Timestamp::new),
        })
    }
}

/// Database row representing a voucher.
#[derive(Debug)]
struct VoucherRow {
    voucher_id: String,
    product_id: String,
    code: String,
    used: bool,
    used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<PgRow> for VoucherRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            voucher_id: row.try_get("voucher_id")?,
            product_id: row.try_get("product_id")?,
            code: row.try_get("code")?,
            used: row.try_get("used")?,
            used_at: row.try_get("used_at")?,
        })
    }
}

impl VoucherRow {
    fn into_voucher(self) -> StoreResult<Voucher> {
        Ok(Voucher {
            id: VoucherId::try_new(self.voucher_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            product_id: ProductId::try_new(self.product_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            code: VoucherCode::try_new(self.code)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            used: self.used,
            used_at: self.used_at.map(Timestamp::new),
        })
    }
}

/// Database row representing a redemption record.
#[derive(Debug)]
struct RedemptionRow {
    attempt_id: uuid::Uuid,
    order_id: String,
    voucher_id: Option<String>,
    outcome: String,
    detail: Value,
    recorded_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<PgRow> for RedemptionRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            attempt_id: row.try_get("attempt_id")?,
            order_id: row.try_get("order_id")?,
            voucher_id: row.try_get("voucher_id")?,
            outcome: row.try_get("outcome")?,
            detail: row.try_get("detail")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl RedemptionRow {
    fn into_record(self) -> StoreResult<RedemptionRecord> {
        let voucher_id = match self.voucher_id {
            Some(raw) => Some(
                VoucherId::try_new(raw)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            ),
            None => None,
        };
        let outcome: RedemptionOutcome = self
            .outcome
            .parse()
            .map_err(|e: vouchercore::redemption::UnknownRedemptionOutcome| {
                StoreError::DeserializationFailed(e.to_string())
            })?;
        Ok(RedemptionRecord {
            attempt_id: AttemptId::try_new(self.attempt_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            order_id: OrderId::try_new(self.order_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            voucher_id,
            outcome,
            detail: self.detail,
            recorded_at: Timestamp::new(self.recorded_at),
        })
    }
}

/// Database row representing a fulfillment task.
#[derive(Debug)]
struct TaskRow {
    task_id: uuid::Uuid,
    order_id: String,
    status: String,
    attempts: i64,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    lease_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<PgRow> for TaskRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: row.try_get("task_id")?,
            order_id: row.try_get("order_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            enqueued_at: row.try_get("enqueued_at")?,
            lease_until: row.try_get("lease_until")?,
        })
    }
}

impl TaskRow {
    fn into_task(self) -> StoreResult<FulfillmentTask> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: vouchercore::outbox::UnknownTaskStatus| {
                StoreError::DeserializationFailed(e.to_string())
            })?;
        Ok(FulfillmentTask {
            id: TaskId::try_new(self.task_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            order_id: OrderId::try_new(self.order_id)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?,
            status,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| StoreError::DeserializationFailed("negative attempts".to_string()))?,
            enqueued_at: Timestamp::new(self.enqueued_at),
            lease_until: self.lease_until.map(Timestamp::new),
        })
    }
}

fn price_from_db(price_minor: i64) -> StoreResult<Price> {
    let minor = u64::try_from(price_minor)
        .map_err(|_| StoreError::DeserializationFailed("negative price".to_string()))?;
    Price::try_new(minor).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

fn price_to_db(price: Price) -> StoreResult<i64> {
    i64::try_from(price.minor_units())
        .map_err(|_| StoreError::SerializationFailed("price exceeds bigint range".to_string()))
}

fn parse_payment_status(token: &str) -> StoreResult<PaymentStatus> {
    token
        .parse()
        .map_err(|e: vouchercore::order::UnknownPaymentStatus| {
            StoreError::DeserializationFailed(e.to_string())
        })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_error) = error {
        return db_error.code().as_deref() == Some("23505");
    }
    false
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_error) = error {
        return db_error.code().as_deref() == Some("23503");
    }
    false
}

fn map_sqlx_error(error: sqlx::Error, operation: &'static str) -> StoreError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            error!(
                error = %error,
                operation,
                "[postgres.connection_error] database connection failed"
            );
            StoreError::ConnectionFailed(error.to_string())
        }
        _ => {
            error!(
                error = %error,
                operation,
                "[postgres.database_error] database operation failed"
            );
            StoreError::Internal(format!("{operation}: {error}"))
        }
    }
}

#[async_trait]
impl FulfillmentStore for PostgresFulfillmentStore {
    #[instrument(name = "postgres.insert_product", skip(self, product), fields(product_id = %product.id))]
    async fn insert_product(&self, product: Product) -> StoreResult<()> {
        query(
            "INSERT INTO vouchercore_products (product_id, name, kind, price_minor, stock, active)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(product.id.as_ref())
        .bind(product.name.as_ref())
        .bind(product.kind.as_str())
        .bind(price_to_db(product.price)?)
        .bind(i64::from(product.stock))
        .bind(product.active)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                return StoreError::DuplicateProduct(product.id.clone());
            }
            map_sqlx_error(error, "insert_product")
        })?;
        Ok(())
    }

    async fn product(&self, id: &ProductId) -> StoreResult<Option<Product>> {
        let row = query(
            "SELECT product_id, name, kind, price_minor, stock, active
             FROM vouchercore_products WHERE product_id = $1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "product"))?;

        match row {
            Some(row) => {
                let product = ProductRow::try_from(row)
                    .map_err(|error| map_sqlx_error(error, "product"))?
                    .into_product()?;
                Ok(Some(product))
            }
            None => Ok(None),
        }
    }

    #[instrument(name = "postgres.recompute_stock", skip(self), fields(product_id = %id))]
    async fn recompute_stock(&self, id: &ProductId) -> StoreResult<u32> {
        let row = query(
            "UPDATE vouchercore_products p
             SET stock = (
                 SELECT COUNT(*) FROM vouchercore_vouchers v
                 WHERE v.product_id = p.product_id AND NOT v.used
             )
             WHERE p.product_id = $1
             RETURNING p.stock",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "recompute_stock"))?;

        let Some(row) = row else {
            return Err(StoreError::ProductNotFound(id.clone()));
        };
        let stock: i64 = row
            .try_get("stock")
            .map_err(|error| map_sqlx_error(error, "recompute_stock"))?;
        u32::try_from(stock)
            .map_err(|_| StoreError::DeserializationFailed("negative stock".to_string()))
    }

    async fn unused_voucher_count(&self, id: &ProductId) -> StoreResult<u32> {
        let row = query(
            "SELECT COUNT(*) AS unused FROM vouchercore_vouchers
             WHERE product_id = $1 AND NOT used",
        )
        .bind(id.as_ref())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "unused_voucher_count"))?;

        let count: i64 = row
            .try_get("unused")
            .map_err(|error| map_sqlx_error(error, "unused_voucher_count"))?;
        u32::try_from(count)
            .map_err(|_| StoreError::DeserializationFailed("negative count".to_string()))
    }

    #[instrument(name = "postgres.insert_order", skip(self, order), fields(order_id = %order.id))]
    async fn insert_order(&self, order: Order) -> StoreResult<()> {
        query(
            "INSERT INTO vouchercore_orders
             (order_id, product_id, phone, price_minor, payment_status, provider_ref,
              redirect_url, created_at, settled_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(order.id.as_ref())
        .bind(order.product_id.as_ref())
        .bind(order.phone.as_ref())
        .bind(price_to_db(order.price)?)
        .bind(order.payment_status.as_str())
        .bind(order.provider_ref.as_ref())
        .bind(&order.redirect_url)
        .bind(*order.created_at.as_datetime())
        .bind(order.settled_at.map(Timestamp::into_datetime))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                return StoreError::DuplicateOrder(order.id.clone());
            }
            map_sqlx_error(error, "insert_order")
        })?;
        Ok(())
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>> {
        let row = query(
            "SELECT order_id, product_id, phone, price_minor, payment_status, provider_ref,
                    redirect_url, created_at, settled_at
             FROM vouchercore_orders WHERE order_id = $1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "order"))?;

        match row {
            Some(row) => {
                let order = OrderRow::try_from(row)
                    .map_err(|error| map_sqlx_error(error, "order"))?
                    .into_order()?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    #[instrument(name = "postgres.settle_order", skip(self, verdict), fields(order_id = %id, status = %verdict.status()))]
    async fn settle_order(
        &self,
        id: &OrderId,
        verdict: PaymentVerdict,
    ) -> StoreResult<Settlement> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, "settle_order"))?;

        let updated = query(
            "UPDATE vouchercore_orders
             SET payment_status = $2, settled_at = $3
             WHERE order_id = $1 AND payment_status = 'pending'
             RETURNING order_id, product_id, phone, price_minor, payment_status, provider_ref,
                       redirect_url, created_at, settled_at",
        )
        .bind(id.as_ref())
        .bind(verdict.status().as_str())
        .bind(*Timestamp::now().as_datetime())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, "settle_order"))?;

        let Some(row) = updated else {
            // The conditional update did not fire: the order is either
            // already settled or missing. Read which inside the same
            // transaction.
            let existing = query("SELECT payment_status FROM vouchercore_orders WHERE order_id = $1")
                .bind(id.as_ref())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, "settle_order"))?;
            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(error, "settle_order"))?;

            let Some(existing) = existing else {
                return Err(StoreError::OrderNotFound(id.clone()));
            };
            let token: String = existing
                .try_get("payment_status")
                .map_err(|error| map_sqlx_error(error, "settle_order"))?;
            let status = parse_payment_status(&token)?;
            debug!(order_id = %id, status = %status, "settlement already applied");
            return Ok(Settlement::AlreadySettled(status));
        };

        if let PaymentVerdict::Succeeded {
            followup: Some(task),
        } = verdict
        {
            query(
                "INSERT INTO vouchercore_tasks
                 (task_id, order_id, status, attempts, enqueued_at, lease_until)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(*task.id.as_ref())
            .bind(task.order_id.as_ref())
            .bind(task.status.as_str())
            .bind(i64::from(task.attempts))
            .bind(*task.enqueued_at.as_datetime())
            .bind(task.lease_until.map(Timestamp::into_datetime))
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, "settle_order"))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, "settle_order"))?;

        let order = OrderRow::try_from(row)
            .map_err(|error| map_sqlx_error(error, "settle_order"))?
            .into_order()?;
        Ok(Settlement::Applied(order))
    }

    #[instrument(name = "postgres.insert_vouchers", skip(self, vouchers), fields(count = vouchers.len()))]
    async fn insert_vouchers(&self, vouchers: Vec<Voucher>) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, "insert_vouchers"))?;

        for voucher in &vouchers {
            query(
                "INSERT INTO vouchercore_vouchers (voucher_id, product_id, code, used, used_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(voucher.id.as_ref())
            .bind(voucher.product_id.as_ref())
            .bind(voucher.code.as_ref())
            .bind(voucher.used)
            .bind(voucher.used_at.map(Timestamp::into_datetime))
            .execute(&mut *tx)
            .await
            .map_err(|error| {
                if is_foreign_key_violation(&error) {
                    return StoreError::ProductNotFound(voucher.product_id.clone());
                }
                if is_unique_violation(&error) {
                    warn!(
                        product_id = %voucher.product_id,
                        "[postgres.duplicate_voucher] code already in pool"
                    );
                    return StoreError::DuplicateVoucherCode {
                        product: voucher.product_id.clone(),
                        code: voucher.code.clone(),
                    };
                }
                map_sqlx_error(error, "insert_vouchers")
            })?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, "insert_vouchers"))
    }

    #[instrument(name = "postgres.claim_voucher", skip(self), fields(product_id = %product_id))]
    async fn claim_voucher(&self, product_id: &ProductId) -> StoreResult<ClaimOutcome> {
        let row = query(
            "UPDATE vouchercore_vouchers
             SET used = TRUE, used_at = $2
             WHERE voucher_id = (
                 SELECT voucher_id FROM vouchercore_vouchers
                 WHERE product_id = $1 AND NOT used
                 ORDER BY voucher_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING voucher_id, product_id, code, used, used_at",
        )
        .bind(product_id.as_ref())
        .bind(*Timestamp::now().as_datetime())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "claim_voucher"))?;

        match row {
            Some(row) => {
                let voucher = VoucherRow::try_from(row)
                    .map_err(|error| map_sqlx_error(error, "claim_voucher"))?
                    .into_voucher()?;
                debug!(voucher_id = %voucher.id, "claimed voucher");
                Ok(ClaimOutcome::Claimed(voucher))
            }
            None => Ok(ClaimOutcome::Exhausted),
        }
    }

    async fn voucher(&self, id: &VoucherId) -> StoreResult<Option<Voucher>> {
        let row = query(
            "SELECT voucher_id, product_id, code, used, used_at
             FROM vouchercore_vouchers WHERE voucher_id = $1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "voucher"))?;

        match row {
            Some(row) => {
                let voucher = VoucherRow::try_from(row)
                    .map_err(|error| map_sqlx_error(error, "voucher"))?
                    .into_voucher()?;
                Ok(Some(voucher))
            }
            None => Ok(None),
        }
    }

    #[instrument(name = "postgres.append_redemption", skip(self, record), fields(order_id = %record.order_id, outcome = %record.outcome))]
    async fn append_redemption(&self, record: RedemptionRecord) -> StoreResult<()> {
        query(
            "INSERT INTO vouchercore_redemptions
             (attempt_id, order_id, voucher_id, outcome, detail, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(*record.attempt_id.as_ref())
        .bind(record.order_id.as_ref())
        .bind(record.voucher_id.as_ref().map(AsRef::as_ref))
        .bind(record.outcome.as_str())
        .bind(&record.detail)
        .bind(*record.recorded_at.as_datetime())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "append_redemption"))?;
        Ok(())
    }

    async fn redemptions_for_order(
        &self,
        order_id: &OrderId,
    ) -> StoreResult<Vec<RedemptionRecord>> {
        let rows = query(
            "SELECT attempt_id, order_id, voucher_id, outcome, detail, recorded_at
             FROM vouchercore_redemptions
             WHERE order_id = $1
             ORDER BY attempt_id",
        )
        .bind(order_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "redemptions_for_order"))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = RedemptionRow::try_from(row)
                .map_err(|error| map_sqlx_error(error, "redemptions_for_order"))?
                .into_record()?;
            records.push(record);
        }
        Ok(records)
    }

    #[instrument(name = "postgres.enqueue_task", skip(self, task), fields(task_id = %task.id, order_id = %task.order_id))]
    async fn enqueue_task(&self, task: FulfillmentTask) -> StoreResult<()> {
        query(
            "INSERT INTO vouchercore_tasks
             (task_id, order_id, status, attempts, enqueued_at, lease_until)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(*task.id.as_ref())
        .bind(task.order_id.as_ref())
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(*task.enqueued_at.as_datetime())
        .bind(task.lease_until.map(Timestamp::into_datetime))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "enqueue_task"))?;
        Ok(())
    }

    #[instrument(name = "postgres.claim_due_task", skip(self, now, lease))]
    async fn claim_due_task(
        &self,
        now: Timestamp,
        lease: Duration,
    ) -> StoreResult<Option<FulfillmentTask>> {
        let lease_until = now.saturating_add(lease);
        let row = query(
            "UPDATE vouchercore_tasks
             SET status = 'in_flight', attempts = attempts + 1, lease_until = $2
             WHERE task_id = (
                 SELECT task_id FROM vouchercore_tasks
                 WHERE status = 'queued'
                    OR (status = 'in_flight' AND lease_until <= $1)
                 ORDER BY task_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING task_id, order_id, status, attempts, enqueued_at, lease_until",
        )
        .bind(*now.as_datetime())
        .bind(*lease_until.as_datetime())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "claim_due_task"))?;

        match row {
            Some(row) => {
                let task = TaskRow::try_from(row)
                    .map_err(|error| map_sqlx_error(error, "claim_due_task"))?
                    .into_task()?;
                debug!(task_id = %task.id, attempts = task.attempts, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(name = "postgres.finish_task", skip(self), fields(task_id = %id))]
    async fn finish_task(&self, id: &TaskId, disposition: TaskDisposition) -> StoreResult<()> {
        let result = query(
            "UPDATE vouchercore_tasks SET status = $2, lease_until = NULL WHERE task_id = $1",
        )
        .bind(*id.as_ref())
        .bind(disposition.status().as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "finish_task"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(*id));
        }
        Ok(())
    }

    async fn open_task_count(&self) -> StoreResult<u32> {
        let row = query(
            "SELECT COUNT(*) AS open FROM vouchercore_tasks
             WHERE status IN ('queued', 'in_flight')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, "open_task_count"))?;

        let count: i64 = row
            .try_get("open")
            .map_err(|error| map_sqlx_error(error, "open_task_count"))?;
        u32::try_from(count)
            .map_err(|_| StoreError::DeserializationFailed("negative count".to_string()))
    }
}
