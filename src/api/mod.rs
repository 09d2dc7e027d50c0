// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod chat;
pub mod core;
pub mod errors;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .merge(core::router())
        .merge(chat::router(max_upload_bytes))
        .with_state(state)
}
