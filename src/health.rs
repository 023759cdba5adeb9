use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use jmx_cluster_worker::{HealthReporter, HealthStatus};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::info;

/// 健康检查端点的共享状态
#[derive(Clone)]
pub struct HealthState {
    reporters: Arc<Vec<HealthReporter>>,
    metrics: Option<PrometheusHandle>,
}

impl HealthState {
    pub fn new(reporters: Vec<HealthReporter>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            reporters: Arc::new(reporters),
            metrics,
        }
    }
}

/// 安装全局Prometheus记录器，返回用于渲染的句柄
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("安装指标记录器失败: {e}"))
}

pub fn create_routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 任一Worker不健康时返回503，降级仍视为可服务
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let workers: BTreeMap<String, HealthStatus> = state
        .reporters
        .iter()
        .map(|reporter| (reporter.worker_alias().to_string(), reporter.status()))
        .collect();
    let serving = workers.values().all(HealthStatus::is_serving);
    let code = if serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if serving { "ok" } else { "unhealthy" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "jmx-cluster",
            "version": env!("CARGO_PKG_VERSION"),
            "workers": workers,
        })),
    )
}

async fn render_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "指标未启用".to_string()),
    }
}

/// 启动健康检查服务器，直到收到关闭信号
pub async fn serve(
    bind_address: &str,
    state: HealthState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("健康检查监听地址无效: {bind_address}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("绑定健康检查端口失败: {addr}"))?;
    info!("健康检查服务监听于 {}", addr);

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("健康检查服务运行失败")?;

    info!("健康检查服务已停止");
    Ok(())
}
