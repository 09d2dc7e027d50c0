// 统一错误响应：结构化 JSON 主体加 trace/错误码响应头。
use crate::orchestrator::{ChatError, SendFailure};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
) -> ErrorMeta {
    let message = message.into();
    let code = code
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_error_code(status))
        .to_string();
    ErrorMeta {
        code,
        message,
        status: status.as_u16(),
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

/// 领域错误码到 HTTP 状态的固定映射。
pub(crate) fn status_for_error_code(code: &str) -> StatusCode {
    let normalized = code.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "ATTACHMENT_PENDING_EXISTS" | "ATTACHMENT_LIMIT_REACHED" => StatusCode::CONFLICT,
        "ATTACHMENT_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
        "ENDPOINT_NOT_CONFIGURED" => StatusCode::SERVICE_UNAVAILABLE,
        "DISPATCH_TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "DISPATCH_TRANSPORT_ERROR" | "DISPATCH_NON_SUCCESS" => StatusCode::BAD_GATEWAY,
        "INTERNAL_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    error_response_with_detail(status, None, message, None)
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    detail: Option<Value>,
) -> Response {
    let meta = build_error_meta(status, code, message);
    let detail = build_detail_payload(&meta.message, detail);
    let payload = json!({
        "ok": false,
        "error": meta.to_value(),
        "detail": detail,
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

/// 编排错误按错误码映射状态后走统一响应。
pub fn chat_error_response(error: &ChatError) -> Response {
    let status = status_for_error_code(error.code());
    let payload = error.to_payload();
    let detail = payload.get("detail").cloned();
    error_response_with_detail(status, Some(error.code()), error.message(), detail)
}

/// 发送失败除错误外把部分更新后的会话一并带回，UI 仍能渲染用户消息。
pub fn send_failure_response(failure: &SendFailure) -> Response {
    let status = status_for_error_code(failure.error.code());
    let mut detail = failure
        .error
        .to_payload()
        .get("detail")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Some(conversation) = &failure.conversation {
        if let Value::Object(ref mut map) = detail {
            map.insert(
                "conversation".to_string(),
                serde_json::to_value(conversation).unwrap_or(Value::Null),
            );
        }
    }
    error_response_with_detail(
        status,
        Some(failure.error.code()),
        failure.error.message(),
        Some(detail),
    )
}

fn build_detail_payload(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(Value::Object(mut map)) => {
            map.entry("message".to_string())
                .or_insert_with(|| Value::String(message.to_string()));
            Value::Object(map)
        }
        Some(value) => json!({
            "message": message,
            "detail": value,
        }),
        None => json!({
            "message": message,
        }),
    }
}

fn default_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
        StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        StatusCode::GATEWAY_TIMEOUT => "UPSTREAM_TIMEOUT",
        _ if status.is_server_error() => "INTERNAL_ERROR",
        _ => "REQUEST_ERROR",
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
