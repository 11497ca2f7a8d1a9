//! Axum surface over the refresh service.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sales_core::RefreshLog;
use sales_refresh::{RefreshConfig, RefreshService};
use sales_storage::{RefreshLogStore, SalesStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "sales-web";

pub struct AppState<S, L> {
    pub service: RefreshService<S, L>,
    pub default_source: PathBuf,
}

impl<S, L> AppState<S, L> {
    pub fn new(service: RefreshService<S, L>, default_source: impl Into<PathBuf>) -> Self {
        Self {
            service,
            default_source: default_source.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    file_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub message: String,
    pub status: String,
    pub file_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub data: Vec<RefreshLog>,
}

pub fn app<S, L>(state: AppState<S, L>) -> Router
where
    S: SalesStore + 'static,
    L: RefreshLogStore + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/refresh", post(trigger_refresh_handler::<S, L>))
        .route("/api/v1/refresh/status", get(refresh_status_handler::<S, L>))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve<S, L>(service: RefreshService<S, L>, config: &RefreshConfig) -> anyhow::Result<()>
where
    S: SalesStore + 'static,
    L: RefreshLogStore + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "http server listening");
    axum::serve(listener, app(AppState::new(service, &config.source_path))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn trigger_refresh_handler<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Query(query): Query<RefreshQuery>,
) -> Response
where
    S: SalesStore + 'static,
    L: RefreshLogStore + 'static,
{
    let source = query
        .file_path
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.default_source.clone());
    let handle = state.service.trigger(source);

    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            message: "Data refresh triggered successfully".to_string(),
            status: if handle.queued { "queued" } else { "in_progress" }.to_string(),
            file_path: handle.source.display().to_string(),
        }),
    )
        .into_response()
}

async fn refresh_status_handler<S, L>(State(state): State<Arc<AppState<S, L>>>) -> Response
where
    S: SalesStore + 'static,
    L: RefreshLogStore + 'static,
{
    match state.service.status().await {
        Ok(data) => Json(StatusResponse { data }).into_response(),
        Err(err) => {
            error!(error = %err, "failed to load refresh status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to get refresh status" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use sales_core::RefreshStatus;
    use sales_storage::{MemoryOp, MemoryStore};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    fn fixture() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "order_id,product_id,customer_id,product_name,category,region,date_of_sale,quantity,unit_price,discount,shipping_cost,payment_method,customer_name,customer_email,customer_address"
        )
        .unwrap();
        writeln!(
            file,
            "1001,P10,C7,Kettle,Kitchen,South,2024-02-11,1,39.90,0,6.00,PayPal,Ana Ruiz,ana@example.com,\"12 Rose St, Leeds\""
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    fn test_app(store: &MemoryStore, default_source: &std::path::Path) -> Router {
        let service = RefreshService::new(store.clone(), store.clone(), 1000);
        app(AppState::new(service, default_source))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_for_terminal(store: &MemoryStore) -> RefreshLog {
        for _ in 0..200 {
            if let Some(log) = store.recent(1).await.unwrap().into_iter().next() {
                if log.status.is_terminal() {
                    return log;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh did not finish");
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let store = MemoryStore::new();
        let resp = test_app(&store, std::path::Path::new("data/sales_data.csv"))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp).await;
        assert_eq!(body, json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn trigger_uses_default_source_and_runs_in_background() {
        let store = MemoryStore::new();
        let file = fixture();
        let resp = test_app(&store, file.path())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: TriggerResponse = body_json(resp).await;
        assert_eq!(body.message, "Data refresh triggered successfully");
        assert_eq!(body.status, "in_progress");
        assert_eq!(body.file_path, file.path().display().to_string());

        let log = wait_for_terminal(&store).await;
        assert_eq!(log.status, RefreshStatus::Success);
        assert_eq!(log.records_count, 1);
        assert_eq!(store.customers().await[0].address, "12 Rose St, Leeds");
    }

    #[tokio::test]
    async fn trigger_honours_file_path_query() {
        let store = MemoryStore::new();
        let resp = test_app(&store, std::path::Path::new("data/sales_data.csv"))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/refresh?file_path=missing/export.csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: TriggerResponse = body_json(resp).await;
        assert_eq!(body.file_path, "missing/export.csv");

        let log = wait_for_terminal(&store).await;
        assert_eq!(log.status, RefreshStatus::Failed);
        assert!(log.error_message.contains("missing/export.csv"));
    }

    #[tokio::test]
    async fn status_lists_journal_rows() {
        let store = MemoryStore::new();
        let file = fixture();
        let service = RefreshService::new(store.clone(), store.clone(), 1000);
        assert!(service.run_refresh(file.path()).await.is_success());

        let resp = app(AppState::new(service, file.path()))
            .oneshot(
                Request::builder()
                    .uri("/api/v1/refresh/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: StatusResponse = body_json(resp).await;
        assert_eq!(body.data.len(), 1);
        assert_eq!(body.data[0].status, RefreshStatus::Success);
    }

    #[tokio::test]
    async fn status_store_failure_is_a_500() {
        let store = MemoryStore::new();
        store.fail_on(MemoryOp::RecentLogs).await;
        let resp = test_app(&store, std::path::Path::new("data/sales_data.csv"))
            .oneshot(
                Request::builder()
                    .uri("/api/v1/refresh/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = body_json(resp).await;
        assert_eq!(body, json!({ "error": "Failed to get refresh status" }));
    }
}
