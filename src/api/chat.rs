// 会话 API：会话 CRUD、消息发送、附件与轮询接口。
use crate::api::errors::{chat_error_response, error_response, send_failure_response};
use crate::i18n;
use crate::poller::PollOutcome;
use crate::state::AppState;
use crate::storage::AgentBinding;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 调用方身份头，鉴权由上游网关完成，这里只取结论。
pub(crate) const OWNER_HEADER: &str = "x-flowrelay-user";

pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    // 传输层限制放宽到 multipart 编码开销之上，业务上限由编排器判定。
    let body_limit = max_upload_bytes.saturating_add(64 * 1024);
    Router::new()
        .route(
            "/flowrelay/chat/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/rename",
            post(rename_conversation),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/archive",
            post(set_archived),
        )
        .route("/flowrelay/chat/messages", post(send_message))
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/poll",
            get(poll_conversation),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/attachments",
            post(upload_attachment).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/attachments/{attachment_id}",
            delete(remove_attachment),
        )
        .route(
            "/flowrelay/chat/conversations/{conversation_id}/attachments/{attachment_id}/error",
            post(mark_attachment_error),
        )
}

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    agent: Option<AgentBinding>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_archived: Option<bool>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveRequest {
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    conversation_id: Option<String>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    text: String,
}

fn owner_from_headers(headers: &HeaderMap) -> Result<String, Response> {
    let owner = headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if owner.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            i18n::t("error.owner_required"),
        ));
    }
    Ok(owner.to_string())
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .create_conversation(&owner, request.title, request.agent)
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let (items, total) = state
        .orchestrator
        .list_conversations(
            &owner,
            query.include_archived.unwrap_or(false),
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(50),
        )
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "items": items, "total": total })).into_response())
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .get_conversation(&owner, &conversation_id)
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    state
        .orchestrator
        .delete_conversation(&owner, &conversation_id)
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .rename_conversation(&owner, &conversation_id, &request.title)
        .await
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}

async fn set_archived(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(request): Json<ArchiveRequest>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .set_archived(&owner, &conversation_id, request.archived)
        .await
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let conversation_id = request.conversation_id.unwrap_or_default();
    let outcome = state
        .orchestrator
        .send_message(&owner, &conversation_id, &request.content)
        .await
        .map_err(|failure| send_failure_response(&failure))?;
    info!(
        "message relayed: owner={owner}, conversation={}",
        outcome.conversation.conversation_id
    );
    Ok(Json(json!({
        "reply": outcome.assistant_text,
        "conversation": outcome.conversation,
    }))
    .into_response())
}

/// 轮询回复。超时/失败是界面层终态，不回写会话，只返回合成 system 提示。
async fn poll_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let text = query.text.trim().to_string();
    if text.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            i18n::t("error.content_required"),
        ));
    }
    let cancel = CancellationToken::new();
    let outcome = state
        .poller
        .wait_for_reply(&owner, &conversation_id, &text, cancel)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let payload = match outcome {
        PollOutcome::ReplyReceived { reply } => json!({
            "status": "reply",
            "reply": reply,
        }),
        PollOutcome::TimedOut { attempts } => json!({
            "status": "timeout",
            "attempts": attempts,
            "notice": {
                "role": "system",
                "content": i18n::t("chat.poll_timeout_notice"),
            },
        }),
        PollOutcome::Failed {
            consecutive_failures,
        } => {
            let mut params = HashMap::new();
            params.insert(
                "detail".to_string(),
                consecutive_failures.to_string(),
            );
            json!({
                "status": "failed",
                "notice": {
                    "role": "system",
                    "content": i18n::t_with_params("chat.poll_failed_notice", &params),
                },
            })
        }
        PollOutcome::Cancelled => json!({ "status": "cancelled" }),
    };
    Ok(Json(payload).into_response())
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, format!("invalid multipart: {err}"))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|err| {
            error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload aborted: {err}"),
            )
        })?;
        let (attachment, record) = state
            .orchestrator
            .upload_attachment(
                &owner,
                &conversation_id,
                &name,
                &mime_type,
                bytes.len() as u64,
            )
            .await
            .map_err(|err| chat_error_response(&err))?;
        return Ok(Json(json!({
            "attachment": attachment,
            "conversation": record,
        }))
        .into_response());
    }
    Err(error_response(
        StatusCode::BAD_REQUEST,
        i18n::t("error.attachment_name_required"),
    ))
}

async fn remove_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, attachment_id)): Path<(String, String)>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .remove_attachment(&owner, &conversation_id, &attachment_id)
        .await
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}

async fn mark_attachment_error(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, attachment_id)): Path<(String, String)>,
) -> Result<Response, Response> {
    let owner = owner_from_headers(&headers)?;
    let record = state
        .orchestrator
        .mark_attachment_error(&owner, &conversation_id, &attachment_id)
        .await
        .map_err(|err| chat_error_response(&err))?;
    Ok(Json(json!({ "conversation": record })).into_response())
}
