//! In-memory store with the same key and reference rules as the SQL schema.
//!
//! Transactions work on a snapshot of the committed dataset and swap it in on
//! commit. Every operation can be made to fail with [`MemoryStore::fail_on`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use bigdecimal::BigDecimal;
use sales_core::{
    fits_numeric, Customer, NewRefreshLog, Order, OrderItem, Product, RefreshLog, RefreshLogUpdate,
    RefreshStatus, CURRENCY_PRECISION, CURRENCY_SCALE, DISCOUNT_PRECISION, DISCOUNT_SCALE,
};
use tokio::sync::RwLock;

use crate::{ClearedRows, RefreshLogStore, SalesStore, SalesTransaction, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Begin,
    Clear,
    InsertCustomers,
    InsertProducts,
    InsertOrders,
    InsertOrderItems,
    Commit,
    CountOrders,
    AppendLog,
    UpdateLog,
    RecentLogs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOrderItem {
    pub id: i64,
    pub item: OrderItem,
}

#[derive(Debug, Clone, Default)]
struct Dataset {
    customers: BTreeMap<String, Customer>,
    emails: HashSet<String>,
    products: BTreeMap<String, Product>,
    orders: BTreeMap<String, Order>,
    order_items: Vec<StoredOrderItem>,
    next_item_id: i64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    dataset: RwLock<Dataset>,
    logs: RwLock<Vec<RefreshLog>>,
    faults: RwLock<HashSet<MemoryOp>>,
    inserts: RwLock<Vec<(MemoryOp, usize)>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, op: MemoryOp) {
        self.inner.faults.write().await.insert(op);
    }

    pub async fn clear_faults(&self) {
        self.inner.faults.write().await.clear();
    }

    async fn check(&self, op: MemoryOp) -> Result<(), StoreError> {
        if self.inner.faults.read().await.contains(&op) {
            return Err(StoreError::Injected(op));
        }
        Ok(())
    }

    pub async fn customers(&self) -> Vec<Customer> {
        self.inner.dataset.read().await.customers.values().cloned().collect()
    }

    pub async fn products(&self) -> Vec<Product> {
        self.inner.dataset.read().await.products.values().cloned().collect()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.inner.dataset.read().await.orders.values().cloned().collect()
    }

    pub async fn order_items(&self) -> Vec<StoredOrderItem> {
        self.inner.dataset.read().await.order_items.clone()
    }

    /// Sizes of every grouped insert attempted for `op`, committed or not.
    pub async fn insert_sizes(&self, op: MemoryOp) -> Vec<usize> {
        self.inner
            .inserts
            .read()
            .await
            .iter()
            .filter(|(recorded, _)| *recorded == op)
            .map(|(_, size)| *size)
            .collect()
    }

    async fn record_insert(&self, op: MemoryOp, size: usize) {
        self.inner.inserts.write().await.push((op, size));
    }
}

#[async_trait]
impl SalesStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.check(MemoryOp::Begin).await?;
        let working = self.inner.dataset.read().await.clone();
        Ok(MemoryTransaction {
            store: self.clone(),
            working,
        })
    }

    async fn count_orders(&self) -> Result<i64, StoreError> {
        self.check(MemoryOp::CountOrders).await?;
        Ok(self.inner.dataset.read().await.orders.len() as i64)
    }
}

pub struct MemoryTransaction {
    store: MemoryStore,
    working: Dataset,
}

#[async_trait]
impl SalesTransaction for MemoryTransaction {
    async fn clear_dataset(&mut self) -> Result<ClearedRows, StoreError> {
        self.store.check(MemoryOp::Clear).await?;
        let cleared = ClearedRows {
            order_items: self.working.order_items.len() as u64,
            orders: self.working.orders.len() as u64,
            products: self.working.products.len() as u64,
            customers: self.working.customers.len() as u64,
        };
        self.working.order_items.clear();
        self.working.orders.clear();
        self.working.products.clear();
        self.working.customers.clear();
        self.working.emails.clear();
        Ok(cleared)
    }

    async fn insert_customers(&mut self, rows: &[Customer]) -> Result<u64, StoreError> {
        self.store.record_insert(MemoryOp::InsertCustomers, rows.len()).await;
        self.store.check(MemoryOp::InsertCustomers).await?;

        let mut ids = HashSet::new();
        let mut emails = HashSet::new();
        for c in rows {
            if self.working.customers.contains_key(&c.customer_id) || !ids.insert(&c.customer_id) {
                return Err(StoreError::Conflict {
                    entity: "customer",
                    key: c.customer_id.clone(),
                });
            }
            if self.working.emails.contains(&c.email) || !emails.insert(&c.email) {
                return Err(StoreError::Conflict {
                    entity: "customer email",
                    key: c.email.clone(),
                });
            }
        }
        for c in rows {
            self.working.emails.insert(c.email.clone());
            self.working.customers.insert(c.customer_id.clone(), c.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_products(&mut self, rows: &[Product]) -> Result<u64, StoreError> {
        self.store.record_insert(MemoryOp::InsertProducts, rows.len()).await;
        self.store.check(MemoryOp::InsertProducts).await?;

        let mut ids = HashSet::new();
        for p in rows {
            if self.working.products.contains_key(&p.product_id) || !ids.insert(&p.product_id) {
                return Err(StoreError::Conflict {
                    entity: "product",
                    key: p.product_id.clone(),
                });
            }
        }
        for p in rows {
            self.working.products.insert(p.product_id.clone(), p.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_orders(&mut self, rows: &[Order]) -> Result<u64, StoreError> {
        self.store.record_insert(MemoryOp::InsertOrders, rows.len()).await;
        self.store.check(MemoryOp::InsertOrders).await?;

        let mut ids = HashSet::new();
        for o in rows {
            if self.working.orders.contains_key(&o.order_id) || !ids.insert(&o.order_id) {
                return Err(StoreError::Conflict {
                    entity: "order",
                    key: o.order_id.clone(),
                });
            }
            if !fits_numeric(&o.shipping_cost, CURRENCY_PRECISION, CURRENCY_SCALE) {
                return Err(check_violation("order", &o.order_id, "shipping_cost NUMERIC(10,2)"));
            }
            if !self.working.customers.contains_key(&o.customer_id) {
                return Err(StoreError::MissingReference {
                    entity: "order",
                    key: o.order_id.clone(),
                    target: format!("customer {}", o.customer_id),
                });
            }
        }
        for o in rows {
            self.working.orders.insert(o.order_id.clone(), o.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_order_items(&mut self, rows: &[OrderItem]) -> Result<u64, StoreError> {
        self.store.record_insert(MemoryOp::InsertOrderItems, rows.len()).await;
        self.store.check(MemoryOp::InsertOrderItems).await?;

        for i in rows {
            if i.quantity_sold < 0 {
                return Err(check_violation("order item", &i.order_id, "quantity_sold >= 0"));
            }
            if !fits_numeric(&i.unit_price, CURRENCY_PRECISION, CURRENCY_SCALE) {
                return Err(check_violation("order item", &i.order_id, "unit_price NUMERIC(10,2)"));
            }
            if !fits_numeric(&i.discount, DISCOUNT_PRECISION, DISCOUNT_SCALE)
                || i.discount < BigDecimal::from(0_i32)
                || i.discount > BigDecimal::from(1_i32)
            {
                return Err(check_violation("order item", &i.order_id, "discount in [0, 1]"));
            }
            if !self.working.orders.contains_key(&i.order_id) {
                return Err(StoreError::MissingReference {
                    entity: "order item",
                    key: i.order_id.clone(),
                    target: format!("order {}", i.order_id),
                });
            }
            if !self.working.products.contains_key(&i.product_id) {
                return Err(StoreError::MissingReference {
                    entity: "order item",
                    key: i.order_id.clone(),
                    target: format!("product {}", i.product_id),
                });
            }
        }
        for i in rows {
            self.working.next_item_id += 1;
            let id = self.working.next_item_id;
            self.working.order_items.push(StoredOrderItem {
                id,
                item: i.clone(),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.store.check(MemoryOp::Commit).await?;
        *self.store.inner.dataset.write().await = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn check_violation(entity: &'static str, key: &str, constraint: &'static str) -> StoreError {
    StoreError::CheckViolation {
        entity,
        key: key.to_string(),
        constraint,
    }
}

#[async_trait]
impl RefreshLogStore for MemoryStore {
    async fn append(&self, log: NewRefreshLog) -> Result<i64, StoreError> {
        self.check(MemoryOp::AppendLog).await?;
        let mut logs = self.inner.logs.write().await;
        let id = logs.len() as i64 + 1;
        logs.push(RefreshLog {
            id,
            status: RefreshStatus::InProgress,
            start_time: log.start_time,
            end_time: None,
            records_count: 0,
            error_message: String::new(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update(&self, id: i64, update: RefreshLogUpdate) -> Result<(), StoreError> {
        self.check(MemoryOp::UpdateLog).await?;
        let mut logs = self.inner.logs.write().await;
        let log = logs
            .iter_mut()
            .find(|l| l.id == id && l.status == RefreshStatus::InProgress)
            .ok_or(StoreError::LogNotOpen(id))?;
        log.status = update.status;
        log.end_time = Some(update.end_time);
        log.records_count = update.records_count;
        log.error_message = update.error_message;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RefreshLog>, StoreError> {
        self.check(MemoryOp::RecentLogs).await?;
        let mut logs = self.inner.logs.read().await.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit);
        Ok(logs)
    }
}
