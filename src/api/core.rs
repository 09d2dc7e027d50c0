// 核心 API：健康检查与运行时配置回显。
use crate::i18n;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/flowrelay/health", get(health))
        .route("/flowrelay/config", get(config_echo))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "flowrelay-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 仅回显前端需要的运行参数，不暴露内部地址。
async fn config_echo(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config_store.get().await;
    Json(json!({
        "dispatch": {
            "timeout_s": config.dispatch.timeout_s,
            "max_history_entries": config.dispatch.max_history_entries,
        },
        "polling": {
            "interval_s": config.polling.interval_s,
            "max_attempts": config.polling.max_attempts,
        },
        "attachments": {
            "max_files": config.attachments.max_files,
            "max_upload_bytes": config.attachments.max_upload_bytes,
        },
        "i18n": {
            "default_language": config.i18n.default_language,
            "supported_languages": config.i18n.supported_languages,
            "current_language": i18n::get_language(),
        },
    }))
}
