//! Relational store seams for the sales dataset and the refresh journal.
//!
//! [`SalesStore`] hands out a [`SalesTransaction`] that owns the whole
//! clear-then-load cycle; nothing it writes is visible until `commit`.
//! [`RefreshLogStore`] writes outside that transaction so an in-flight refresh
//! is observable while it runs.

use async_trait::async_trait;
use sales_core::{Customer, NewRefreshLog, Order, OrderItem, Product, RefreshLog, RefreshLogUpdate};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryOp, MemoryStore, MemoryTransaction, StoredOrderItem};
pub use postgres::{run_migrations, PgRefreshLogStore, PgSalesStore, PgSalesTransaction, MIGRATOR};

pub const CRATE_NAME: &str = "sales-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate {entity} key {key}")]
    Conflict { entity: &'static str, key: String },
    #[error("{entity} {key} references missing {target}")]
    MissingReference {
        entity: &'static str,
        key: String,
        target: String,
    },
    #[error("{entity} {key} violates {constraint}")]
    CheckViolation {
        entity: &'static str,
        key: String,
        constraint: &'static str,
    },
    #[error("refresh log {0} is not open")]
    LogNotOpen(i64),
    #[error("undecodable row: {0}")]
    Decode(String),
    #[error("injected failure during {0:?}")]
    Injected(MemoryOp),
}

/// Rows removed by [`SalesTransaction::clear_dataset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedRows {
    pub order_items: u64,
    pub orders: u64,
    pub products: u64,
    pub customers: u64,
}

#[async_trait]
pub trait SalesStore: Send + Sync {
    type Tx: SalesTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Committed order rows.
    async fn count_orders(&self) -> Result<i64, StoreError>;
}

/// One explicit transaction over the four domain tables.
///
/// Each `insert_*` is a single grouped insert. A failed customer or product
/// insert must leave the transaction usable for the inserts that follow.
#[async_trait]
pub trait SalesTransaction: Send {
    /// Deletes order items, orders, products, customers, in that order.
    async fn clear_dataset(&mut self) -> Result<ClearedRows, StoreError>;

    async fn insert_customers(&mut self, rows: &[Customer]) -> Result<u64, StoreError>;

    async fn insert_products(&mut self, rows: &[Product]) -> Result<u64, StoreError>;

    async fn insert_orders(&mut self, rows: &[Order]) -> Result<u64, StoreError>;

    async fn insert_order_items(&mut self, rows: &[OrderItem]) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Append-only journal of refresh attempts.
#[async_trait]
pub trait RefreshLogStore: Send + Sync {
    /// Persists an `in_progress` row and returns its id.
    async fn append(&self, log: NewRefreshLog) -> Result<i64, StoreError>;

    /// Finalizes an open row. Fails with [`StoreError::LogNotOpen`] if the row
    /// is missing or already terminal.
    async fn update(&self, id: i64, update: RefreshLogUpdate) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<RefreshLog>, StoreError>;
}
