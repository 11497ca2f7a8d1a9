//! sqlx/Postgres implementation of the store seams.

use std::time::Duration;

use async_trait::async_trait;
use sales_core::{
    Customer, NewRefreshLog, Order, OrderItem, Product, RefreshLog, RefreshLogUpdate, RefreshStatus,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::{ClearedRows, RefreshLogStore, SalesStore, SalesTransaction, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgSalesStore {
    pool: PgPool,
}

impl PgSalesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SalesStore for PgSalesStore {
    type Tx = PgSalesTransaction;

    async fn begin(&self) -> Result<PgSalesTransaction, StoreError> {
        Ok(PgSalesTransaction {
            tx: self.pool.begin().await?,
        })
    }

    async fn count_orders(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

pub struct PgSalesTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgSalesTransaction {
    async fn delete_all(&mut self, table: &'static str) -> Result<u64, StoreError> {
        let done = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *self.tx)
            .await?;
        debug!(table, rows = done.rows_affected(), "cleared table");
        Ok(done.rows_affected())
    }

    /// Runs a grouped insert under a savepoint so a failure does not poison the
    /// surrounding transaction.
    async fn execute_in_savepoint(
        &mut self,
        mut query: QueryBuilder<'_, Postgres>,
    ) -> Result<u64, StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        match query.build().execute(&mut *savepoint).await {
            Ok(done) => {
                savepoint.commit().await?;
                Ok(done.rows_affected())
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl SalesTransaction for PgSalesTransaction {
    async fn clear_dataset(&mut self) -> Result<ClearedRows, StoreError> {
        Ok(ClearedRows {
            order_items: self.delete_all("order_items").await?,
            orders: self.delete_all("orders").await?,
            products: self.delete_all("products").await?,
            customers: self.delete_all("customers").await?,
        })
    }

    async fn insert_customers(&mut self, rows: &[Customer]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query =
            QueryBuilder::<Postgres>::new("INSERT INTO customers (customer_id, name, email, address) ");
        query.push_values(rows, |mut b, c| {
            b.push_bind(c.customer_id.clone())
                .push_bind(c.name.clone())
                .push_bind(c.email.clone())
                .push_bind(c.address.clone());
        });
        self.execute_in_savepoint(query).await
    }

    async fn insert_products(&mut self, rows: &[Product]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO products (product_id, name, category) ");
        query.push_values(rows, |mut b, p| {
            b.push_bind(p.product_id.clone())
                .push_bind(p.name.clone())
                .push_bind(p.category.clone());
        });
        self.execute_in_savepoint(query).await
    }

    async fn insert_orders(&mut self, rows: &[Order]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO orders (order_id, customer_id, region, date_of_sale, payment_method, shipping_cost) ",
        );
        query.push_values(rows, |mut b, o| {
            b.push_bind(o.order_id.clone())
                .push_bind(o.customer_id.clone())
                .push_bind(o.region.clone())
                .push_bind(o.date_of_sale)
                .push_bind(o.payment_method.clone())
                .push_bind(o.shipping_cost.clone());
        });
        let done = query.build().execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn insert_order_items(&mut self, rows: &[OrderItem]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO order_items (order_id, product_id, quantity_sold, unit_price, discount) ",
        );
        query.push_values(rows, |mut b, i| {
            b.push_bind(i.order_id.clone())
                .push_bind(i.product_id.clone())
                .push_bind(i.quantity_sold)
                .push_bind(i.unit_price.clone())
                .push_bind(i.discount.clone());
        });
        let done = query.build().execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgRefreshLogStore {
    pool: PgPool,
}

impl PgRefreshLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshLogStore for PgRefreshLogStore {
    async fn append(&self, log: NewRefreshLog) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO refresh_logs (status, start_time, records_count, error_message)
            VALUES ($1, $2, 0, '')
            RETURNING id
            "#,
        )
        .bind(RefreshStatus::InProgress.as_str())
        .bind(log.start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update(&self, id: i64, update: RefreshLogUpdate) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_logs
               SET status = $2,
                   end_time = $3,
                   records_count = $4,
                   error_message = $5
             WHERE id = $1
               AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.end_time)
        .bind(update.records_count)
        .bind(&update.error_message)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::LogNotOpen(id));
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RefreshLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, start_time, end_time, records_count, error_message, created_at
              FROM refresh_logs
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(refresh_log_from_row).collect()
    }
}

fn refresh_log_from_row(row: &PgRow) -> Result<RefreshLog, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(RefreshLog {
        id: row.try_get("id")?,
        status: status
            .parse()
            .map_err(|err: sales_core::UnknownRefreshStatus| StoreError::Decode(err.to_string()))?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        records_count: row.try_get("records_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}
