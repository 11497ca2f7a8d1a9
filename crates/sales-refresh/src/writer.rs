//! Bounded batching of resolved entities into grouped inserts.

use sales_core::{Customer, Order, OrderItem, Product};
use sales_ingest::ResolvedRecord;
use sales_storage::{SalesTransaction, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Largest batch whose grouped order insert (6 binds per row) stays within
/// Postgres' 65535 bind parameters per statement.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / 6;

/// A fatal insert failure. Customer and product failures never produce one.
#[derive(Debug, Error)]
#[error("failed to insert {entity}: {source}")]
pub struct WriteError {
    pub entity: &'static str,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    /// Records per flush, in flush order.
    pub flushes: Vec<usize>,
    pub customers_inserted: u64,
    pub products_inserted: u64,
    pub orders_inserted: u64,
    pub order_items_inserted: u64,
    pub customer_insert_failures: u64,
    pub product_insert_failures: u64,
}

/// Four parallel buffers flushed every `batch_size` records, parents first.
#[derive(Debug)]
pub struct BatchWriter {
    batch_size: usize,
    pending_records: usize,
    customers: Vec<Customer>,
    products: Vec<Product>,
    orders: Vec<Order>,
    order_items: Vec<OrderItem>,
    stats: WriteStats,
}

impl BatchWriter {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        Self {
            batch_size,
            pending_records: 0,
            customers: Vec::new(),
            products: Vec::new(),
            orders: Vec::with_capacity(batch_size),
            order_items: Vec::with_capacity(batch_size),
            stats: WriteStats::default(),
        }
    }

    pub async fn push<T: SalesTransaction>(
        &mut self,
        tx: &mut T,
        record: ResolvedRecord,
    ) -> Result<(), WriteError> {
        if let Some(customer) = record.customer {
            self.customers.push(customer);
        }
        if let Some(product) = record.product {
            self.products.push(product);
        }
        self.orders.push(record.order);
        self.order_items.push(record.item);
        self.pending_records += 1;

        if self.pending_records >= self.batch_size {
            self.flush(tx).await?;
        }
        Ok(())
    }

    /// Flushes the trailing partial batch and returns the totals.
    pub async fn finish<T: SalesTransaction>(mut self, tx: &mut T) -> Result<WriteStats, WriteError> {
        if self.pending_records > 0 || !self.customers.is_empty() || !self.products.is_empty() {
            self.flush(tx).await?;
        }
        Ok(self.stats)
    }

    async fn flush<T: SalesTransaction>(&mut self, tx: &mut T) -> Result<(), WriteError> {
        let records = self.pending_records;
        debug!(
            records,
            customers = self.customers.len(),
            products = self.products.len(),
            "flushing batch"
        );

        if !self.customers.is_empty() {
            match tx.insert_customers(&self.customers).await {
                Ok(n) => self.stats.customers_inserted += n,
                Err(err) => {
                    self.stats.customer_insert_failures += 1;
                    error!(rows = self.customers.len(), error = %err, "failed to insert customers");
                }
            }
        }
        if !self.products.is_empty() {
            match tx.insert_products(&self.products).await {
                Ok(n) => self.stats.products_inserted += n,
                Err(err) => {
                    self.stats.product_insert_failures += 1;
                    error!(rows = self.products.len(), error = %err, "failed to insert products");
                }
            }
        }
        if !self.orders.is_empty() {
            self.stats.orders_inserted += tx
                .insert_orders(&self.orders)
                .await
                .map_err(|source| WriteError {
                    entity: "orders",
                    source,
                })?;
        }
        if !self.order_items.is_empty() {
            self.stats.order_items_inserted += tx
                .insert_order_items(&self.order_items)
                .await
                .map_err(|source| WriteError {
                    entity: "order items",
                    source,
                })?;
        }

        self.customers.clear();
        self.products.clear();
        self.orders.clear();
        self.order_items.clear();
        self.pending_records = 0;
        self.stats.flushes.push(records);
        Ok(())
    }
}
