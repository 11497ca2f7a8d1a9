//! Replace-then-load refresh cycle and its journal entry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sales_core::{NewRefreshLog, RefreshLogUpdate, RefreshStatus};
use sales_ingest::{EntityResolver, SalesCsvReader, SourceError};
use sales_storage::{ClearedRows, RefreshLogStore, SalesStore, SalesTransaction, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::writer::{BatchWriter, WriteError, WriteStats};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("failed to clear existing data: {0}")]
    Clear(#[source] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    InProgress,
    Success,
    Failed,
}

/// Per-invocation state threaded through one refresh.
#[derive(Debug, Clone)]
pub struct RefreshRun {
    pub run_id: Uuid,
    pub source: PathBuf,
    pub started_at: DateTime<Utc>,
    log_id: Option<i64>,
    state: RefreshState,
}

impl RefreshRun {
    fn new(source: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.to_path_buf(),
            started_at: Utc::now(),
            log_id: None,
            state: RefreshState::Idle,
        }
    }

    fn start(&mut self, log_id: i64) {
        debug_assert_eq!(self.state, RefreshState::Idle);
        self.log_id = Some(log_id);
        self.state = RefreshState::InProgress;
    }

    fn finish(&mut self, status: RefreshStatus) {
        debug_assert_eq!(self.state, RefreshState::InProgress);
        self.state = match status {
            RefreshStatus::Success => RefreshState::Success,
            _ => RefreshState::Failed,
        };
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn log_id(&self) -> Option<i64> {
        self.log_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub records: u64,
    pub malformed_records: u64,
    pub field_warnings: u64,
    #[serde(skip)]
    pub cleared: ClearedRows,
    pub writes: WriteStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Succeeded {
        log_id: i64,
        records_count: i64,
        summary: LoadSummary,
    },
    Failed {
        log_id: Option<i64>,
        error: String,
    },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Succeeded { .. })
    }

    pub fn log_id(&self) -> Option<i64> {
        match self {
            RefreshOutcome::Succeeded { log_id, .. } => Some(*log_id),
            RefreshOutcome::Failed { log_id, .. } => *log_id,
        }
    }
}

pub struct RefreshOrchestrator<S, L> {
    store: S,
    logs: L,
    batch_size: usize,
}

impl<S: SalesStore, L: RefreshLogStore> RefreshOrchestrator<S, L> {
    pub fn new(store: S, logs: L, batch_size: usize) -> Self {
        Self {
            store,
            logs,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn logs(&self) -> &L {
        &self.logs
    }

    /// Clears the dataset and reloads it from `source` in one transaction,
    /// journaling the attempt. Never retries.
    pub async fn run_refresh(&self, source: &Path) -> RefreshOutcome {
        let mut run = RefreshRun::new(source);
        let span = info_span!("refresh", run_id = %run.run_id, source = %source.display());
        async move {
            let log_id = match self.logs.append(NewRefreshLog::started_at(run.started_at)).await {
                Ok(id) => id,
                Err(err) => {
                    error!(error = %err, "failed to open refresh log; refresh not started");
                    return RefreshOutcome::Failed {
                        log_id: None,
                        error: format!("failed to open refresh log: {err}"),
                    };
                }
            };
            run.start(log_id);
            info!(log_id, "starting data refresh");

            match self.replace_dataset(&run).await {
                Ok(summary) => {
                    let records_count = match self.store.count_orders().await {
                        Ok(count) => count,
                        Err(err) => {
                            warn!(error = %err, "failed to count orders; using rows written");
                            summary.writes.orders_inserted as i64
                        }
                    };
                    self.finalize(&mut run, RefreshLogUpdate::success(records_count, Utc::now()))
                        .await;
                    info!(
                        log_id,
                        records_count,
                        malformed_records = summary.malformed_records,
                        field_warnings = summary.field_warnings,
                        "data refresh completed successfully"
                    );
                    RefreshOutcome::Succeeded {
                        log_id,
                        records_count,
                        summary,
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(log_id, error = %message, "data refresh failed");
                    self.finalize(&mut run, RefreshLogUpdate::failed(message.clone(), Utc::now()))
                        .await;
                    RefreshOutcome::Failed {
                        log_id: Some(log_id),
                        error: message,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finalize(&self, run: &mut RefreshRun, update: RefreshLogUpdate) {
        run.finish(update.status);
        let Some(log_id) = run.log_id() else { return };
        if let Err(err) = self.logs.update(log_id, update).await {
            error!(log_id, error = %err, "failed to finalize refresh log");
        }
    }

    async fn replace_dataset(&self, run: &RefreshRun) -> Result<LoadSummary, RefreshError> {
        let mut tx = self.store.begin().await.map_err(RefreshError::Begin)?;
        match self.load(&mut tx, run).await {
            Ok(summary) => {
                tx.commit().await.map_err(RefreshError::Commit)?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn load(&self, tx: &mut S::Tx, run: &RefreshRun) -> Result<LoadSummary, RefreshError> {
        info!("clearing existing data");
        let cleared = tx.clear_dataset().await.map_err(RefreshError::Clear)?;
        info!(
            order_items = cleared.order_items,
            orders = cleared.orders,
            products = cleared.products,
            customers = cleared.customers,
            "existing data cleared"
        );

        let reader = SalesCsvReader::open(&run.source)?;
        let mut resolver = EntityResolver::new(run.started_at.date_naive());
        let mut writer = BatchWriter::new(self.batch_size);
        let mut records = 0u64;
        let mut malformed_records = 0u64;

        for next in reader.records() {
            let raw = match next {
                Ok(raw) => raw,
                Err(err) if !err.is_fatal() => {
                    malformed_records += 1;
                    warn!(error = %err, "skipping malformed record");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            writer.push(tx, resolver.resolve(raw)).await?;
            records += 1;
        }
        let writes = writer.finish(tx).await?;

        info!(
            records,
            customers = resolver.distinct_customers(),
            products = resolver.distinct_products(),
            flushes = writes.flushes.len(),
            "loaded records from source"
        );
        Ok(LoadSummary {
            records,
            malformed_records,
            field_warnings: resolver.field_warnings(),
            cleared,
            writes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sales_storage::{MemoryOp, MemoryStore};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "order_id,product_id,customer_id,product_name,category,region,date_of_sale,quantity,unit_price,discount,shipping_cost,payment_method,customer_name,customer_email,customer_address";

    fn row(order: usize, customer: &str, product: &str, quantity: &str) -> String {
        format!(
            "O{order},{product},{customer},Widget {product},Gadgets,North,2024-05-0{day},{quantity},19.99,0.05,4.5,Card,Name {customer},{customer}@example.com,Street {customer}",
            day = order % 9 + 1
        )
    }

    fn source(rows: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for r in rows {
            writeln!(file, "{r}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn orchestrator(store: &MemoryStore, batch_size: usize) -> RefreshOrchestrator<MemoryStore, MemoryStore> {
        RefreshOrchestrator::new(store.clone(), store.clone(), batch_size)
    }

    fn spread(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| row(i, &format!("C{}", i % 50), &format!("P{}", i % 20), "1"))
            .collect()
    }

    #[tokio::test]
    async fn loads_2500_records_in_three_flushes() {
        let store = MemoryStore::new();
        let file = source(&spread(2500));
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;

        let RefreshOutcome::Succeeded { records_count, summary, log_id } = outcome else {
            panic!("refresh failed: {outcome:?}");
        };
        assert_eq!(records_count, 2500);
        assert_eq!(summary.writes.flushes, vec![1000, 1000, 500]);
        assert_eq!(store.insert_sizes(MemoryOp::InsertOrders).await, vec![1000, 1000, 500]);
        assert_eq!(store.orders().await.len(), 2500);
        assert_eq!(store.order_items().await.len(), 2500);
        assert_eq!(store.customers().await.len(), 50);
        assert_eq!(store.products().await.len(), 20);

        let logs = store.recent(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, log_id);
        assert_eq!(logs[0].status, RefreshStatus::Success);
        assert_eq!(logs[0].records_count, 2500);
        assert!(logs[0].end_time.unwrap() >= logs[0].start_time);
        assert!(logs[0].error_message.is_empty());
    }

    #[tokio::test]
    async fn shared_customer_yields_one_row() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "1"), row(2, "C1", "P2", "3")]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        assert!(outcome.is_success());

        let customers = store.customers().await;
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].customer_id, "C1");
        assert_eq!(store.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn malformed_quantity_becomes_zero() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "abc")]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;

        let RefreshOutcome::Succeeded { summary, .. } = outcome else {
            panic!("refresh failed: {outcome:?}");
        };
        assert_eq!(summary.field_warnings, 1);
        assert_eq!(store.order_items().await[0].item.quantity_sold, 0);
    }

    #[tokio::test]
    async fn amounts_too_large_for_their_column_become_zero() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "1").replace(",19.99,", ",123456789012,")]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;

        let RefreshOutcome::Succeeded { summary, .. } = outcome else {
            panic!("refresh failed: {outcome:?}");
        };
        assert_eq!(summary.field_warnings, 1);
        let items = store.order_items().await;
        assert_eq!(items[0].item.unit_price, bigdecimal::BigDecimal::from(0_i32));
    }

    #[tokio::test]
    async fn exponent_overflow_does_not_stall_the_refresh() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "1").replace(",4.5,", ",1e999999999,")]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(store.orders().await[0].shipping_cost, bigdecimal::BigDecimal::from(0_i32));
    }

    #[tokio::test]
    async fn short_rows_are_skipped() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "1"), "O2,P1,C1".to_string()]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;

        let RefreshOutcome::Succeeded { summary, records_count, .. } = outcome else {
            panic!("refresh failed: {outcome:?}");
        };
        assert_eq!(summary.malformed_records, 1);
        assert_eq!(records_count, 1);
    }

    #[tokio::test]
    async fn rerunning_replaces_instead_of_appending() {
        let store = MemoryStore::new();
        let file = source(&spread(120));
        let orch = orchestrator(&store, 50);

        assert!(orch.run_refresh(file.path()).await.is_success());
        let first = (store.customers().await, store.products().await, store.orders().await);
        assert!(orch.run_refresh(file.path()).await.is_success());
        let second = (store.customers().await, store.products().await, store.orders().await);

        assert_eq!(first, second);
        assert_eq!(store.order_items().await.len(), 120);
        assert_eq!(store.recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreadable_source_fails_and_keeps_previous_dataset() {
        let store = MemoryStore::new();
        let file = source(&spread(10));
        let orch = orchestrator(&store, 1000);
        assert!(orch.run_refresh(file.path()).await.is_success());

        let missing = file.path().with_extension("missing");
        let outcome = orch.run_refresh(&missing).await;
        let RefreshOutcome::Failed { log_id, error } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("failed to open sales source"));
        assert_eq!(store.orders().await.len(), 10);

        let latest = &store.recent(10).await.unwrap()[0];
        assert_eq!(Some(latest.id), log_id);
        assert_eq!(latest.status, RefreshStatus::Failed);
        assert_eq!(latest.records_count, 0);
        assert!(!latest.error_message.is_empty());
        assert!(latest.end_time.is_some());
    }

    #[tokio::test]
    async fn malformed_header_fails_the_refresh() {
        let store = MemoryStore::new();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "order_id,product_id").unwrap();
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        match outcome {
            RefreshOutcome::Failed { error, .. } => {
                assert!(error.contains("header"), "{error}")
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_order_ids_fail_the_refresh_and_roll_back() {
        let store = MemoryStore::new();
        let file = source(&[row(1, "C1", "P1", "1"), row(1, "C1", "P2", "1")]);
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        let RefreshOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("failed to insert orders"), "{error}");
        assert!(store.customers().await.is_empty());
        assert!(store.orders().await.is_empty());
    }

    #[tokio::test]
    async fn clear_failure_marks_failed_before_loading() {
        let store = MemoryStore::new();
        store.fail_on(MemoryOp::Clear).await;
        let file = source(&spread(5));
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        let RefreshOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(error.starts_with("failed to clear existing data"));
        assert!(store.insert_sizes(MemoryOp::InsertOrders).await.is_empty());
    }

    #[tokio::test]
    async fn commit_failure_is_fatal() {
        let store = MemoryStore::new();
        store.fail_on(MemoryOp::Commit).await;
        let file = source(&spread(5));
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        assert!(!outcome.is_success());
        assert!(store.orders().await.is_empty());
        assert_eq!(store.recent(1).await.unwrap()[0].status, RefreshStatus::Failed);
    }

    #[tokio::test]
    async fn count_failure_falls_back_to_rows_written() {
        let store = MemoryStore::new();
        store.fail_on(MemoryOp::CountOrders).await;
        let file = source(&spread(7));
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        let RefreshOutcome::Succeeded { records_count, .. } = outcome else {
            panic!("refresh failed: {outcome:?}");
        };
        assert_eq!(records_count, 7);
    }

    #[tokio::test]
    async fn journal_failure_reports_without_a_log_id() {
        let store = MemoryStore::new();
        store.fail_on(MemoryOp::AppendLog).await;
        let file = source(&spread(3));
        let outcome = orchestrator(&store, 1000).run_refresh(file.path()).await;
        assert_eq!(outcome.log_id(), None);
        assert!(!outcome.is_success());
        assert!(store.orders().await.is_empty());
    }

    #[test]
    fn run_state_transitions() {
        let mut run = RefreshRun::new(Path::new("data.csv"));
        assert_eq!(run.state(), RefreshState::Idle);
        run.start(7);
        assert_eq!(run.state(), RefreshState::InProgress);
        assert_eq!(run.log_id(), Some(7));
        run.finish(RefreshStatus::Failed);
        assert_eq!(run.state(), RefreshState::Failed);
    }
}
