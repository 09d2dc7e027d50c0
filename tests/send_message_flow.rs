use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use flowrelay_server::config::{AttachmentConfig, DispatchConfig};
use flowrelay_server::dispatcher::Dispatcher;
use flowrelay_server::orchestrator::ChatOrchestrator;
use flowrelay_server::storage::{AttachmentStatus, ConversationStore, Role, SqliteStorage};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const OWNER: &str = "user_send_flow";

fn temp_store(tag: &str) -> Arc<SqliteStorage> {
    let db_path = std::env::temp_dir().join(format!(
        "flowrelay_send_{}_{}.db",
        tag,
        Uuid::new_v4().simple()
    ));
    Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()))
}

fn build_orchestrator(store: Arc<SqliteStorage>, endpoint: String, timeout_s: u64) -> ChatOrchestrator {
    let dispatch = DispatchConfig {
        default_endpoint: endpoint,
        base_url: String::new(),
        timeout_s,
        max_history_entries: 20,
    };
    ChatOrchestrator::new(
        store,
        Arc::new(Dispatcher::new(dispatch)),
        AttachmentConfig::default(),
    )
}

/// 在本地随机端口起一个 webhook 桩，返回其完整 URL。
async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub webhook");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}/hook")
}

#[tokio::test]
async fn successful_send_produces_user_assistant_pair() {
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(|Json(_body): Json<Value>| async {
            Json(json!({ "response": "12,345 sessions" }))
        }),
    ))
    .await;
    let store = temp_store("success");
    let orchestrator = build_orchestrator(store.clone(), endpoint, 30);

    let outcome = orchestrator
        .send_message(OWNER, "", "What were last week's sessions?")
        .await
        .expect("send should succeed");
    assert_eq!(outcome.assistant_text, "12,345 sessions");

    let record = store
        .get_conversation(OWNER, &outcome.conversation.conversation_id)
        .expect("load conversation")
        .expect("conversation persisted");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.messages[0].role, Role::User);
    assert_eq!(record.messages[0].content, "What were last week's sessions?");
    assert_eq!(record.messages[1].role, Role::Assistant);
    assert_eq!(record.messages[1].content, "12,345 sessions");
    assert!(record.messages[1].timestamp >= record.messages[0].timestamp);
    // 首次发送自动取标题。
    assert!(record.title.starts_with("What were last week's"));
}

#[tokio::test]
async fn webhook_payload_carries_identity_and_history() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
                Json(json!({ "response": "ok" }))
            }
        }),
    ))
    .await;
    let store = temp_store("payload");
    let orchestrator = build_orchestrator(store, endpoint, 30);

    let first = orchestrator
        .send_message(OWNER, "", "first question")
        .await
        .expect("first send");
    let conversation_id = first.conversation.conversation_id.clone();
    orchestrator
        .send_message(OWNER, &conversation_id, "second question")
        .await
        .expect("second send");

    let first_payload = rx.recv().await.expect("first payload");
    assert_eq!(first_payload["message"], "first question");
    assert_eq!(first_payload["userId"], OWNER);
    assert_eq!(first_payload["conversationId"], conversation_id);
    // 历史不含本次消息。
    assert_eq!(first_payload["history"].as_array().map(Vec::len), Some(0));

    let second_payload = rx.recv().await.expect("second payload");
    assert_eq!(second_payload["message"], "second question");
    let history = second_payload["history"].as_array().expect("history array");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[0]["content"], "first question");
    assert_eq!(history[1]["role"], "assistant");
}

#[tokio::test]
async fn dispatch_timeout_preserves_user_message_and_appends_notice() {
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Json(json!({ "response": "too late" }))
        }),
    ))
    .await;
    let store = temp_store("timeout");
    let orchestrator = build_orchestrator(store.clone(), endpoint, 1);

    let failure = orchestrator
        .send_message(OWNER, "", "slow question")
        .await
        .expect_err("send should time out");
    assert_eq!(failure.error.code(), "DISPATCH_TIMEOUT");

    let conversation = failure.conversation.expect("partial conversation returned");
    let record = store
        .get_conversation(OWNER, &conversation.conversation_id)
        .expect("load conversation")
        .expect("conversation persisted");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.messages[0].role, Role::User);
    assert_eq!(record.messages[0].content, "slow question");
    assert_eq!(record.messages[1].role, Role::Assistant);
    assert!(
        record.messages[1].content.contains("did not respond"),
        "notice was: {}",
        record.messages[1].content
    );
}

#[tokio::test]
async fn failed_dispatch_marks_pending_attachment_error() {
    // 首次 502，其后成功。
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(move || {
            let flag = flag.clone();
            async move {
                if !flag.swap(true, Ordering::SeqCst) {
                    (axum::http::StatusCode::BAD_GATEWAY, "worker unavailable").into_response()
                } else {
                    Json(json!({ "response": "recovered" })).into_response()
                }
            }
        }),
    ))
    .await;
    let store = temp_store("attachment_error");
    let orchestrator = build_orchestrator(store.clone(), endpoint, 30);

    let conversation = orchestrator
        .create_conversation(OWNER, None, None)
        .expect("create conversation");
    let (attachment, _) = orchestrator
        .upload_attachment(
            OWNER,
            &conversation.conversation_id,
            "metrics.csv",
            "text/csv",
            512,
        )
        .await
        .expect("upload attachment");

    let failure = orchestrator
        .send_message(OWNER, &conversation.conversation_id, "crunch the numbers")
        .await
        .expect_err("first dispatch must fail");
    assert_eq!(failure.error.code(), "DISPATCH_NON_SUCCESS");
    let returned = failure.conversation.expect("partial conversation returned");
    assert_eq!(returned.attachments.len(), 1);
    assert_eq!(returned.attachments[0].status, AttachmentStatus::Error);

    let persisted = store
        .get_conversation(OWNER, &conversation.conversation_id)
        .expect("load conversation")
        .expect("conversation persisted");
    assert_eq!(persisted.attachments[0].status, AttachmentStatus::Error);

    // 后续成功发送不得把已 error 的附件改写为 processed。
    let outcome = orchestrator
        .send_message(OWNER, &conversation.conversation_id, "try again")
        .await
        .expect("second send succeeds");
    assert_eq!(
        outcome.conversation.attachments[0].attachment_id,
        attachment.attachment_id
    );
    assert_eq!(
        outcome.conversation.attachments[0].status,
        AttachmentStatus::Error
    );
}

#[tokio::test]
async fn rename_during_inflight_send_is_not_lost() {
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Json(json!({ "response": "slow reply" }))
        }),
    ))
    .await;
    let store = temp_store("rename_race");
    let orchestrator = Arc::new(build_orchestrator(store.clone(), endpoint, 30));

    let conversation = orchestrator
        .create_conversation(OWNER, None, None)
        .expect("create conversation");
    let conversation_id = conversation.conversation_id.clone();

    let sender = orchestrator.clone();
    let send_id = conversation_id.clone();
    let send_task = tokio::spawn(async move {
        sender
            .send_message(OWNER, &send_id, "long running question")
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let renamed = orchestrator
        .rename_conversation(OWNER, &conversation_id, "Quarter totals")
        .await
        .expect("rename");
    // 改名排在发送之后执行，已能看到完整的消息对。
    assert_eq!(renamed.messages.len(), 2);

    send_task
        .await
        .expect("join send task")
        .expect("send succeeds");

    let record = store
        .get_conversation(OWNER, &conversation_id)
        .expect("load conversation")
        .expect("conversation persisted");
    assert_eq!(record.title, "Quarter totals");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.messages[1].content, "slow reply");
}

#[tokio::test]
async fn non_success_status_is_reported_and_recorded() {
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(|| async {
            (
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream worker crashed",
            )
        }),
    ))
    .await;
    let store = temp_store("status");
    let orchestrator = build_orchestrator(store.clone(), endpoint, 30);

    let failure = orchestrator
        .send_message(OWNER, "", "doomed question")
        .await
        .expect_err("send should fail");
    assert_eq!(failure.error.code(), "DISPATCH_NON_SUCCESS");

    let conversation = failure.conversation.expect("partial conversation returned");
    assert_eq!(conversation.messages.len(), 2);
    assert!(
        conversation.messages[1].content.contains("502"),
        "notice was: {}",
        conversation.messages[1].content
    );
}

#[tokio::test]
async fn empty_message_is_rejected_without_persistence() {
    let store = temp_store("validation");
    let orchestrator =
        build_orchestrator(store.clone(), "http://127.0.0.1:9/hook".to_string(), 1);

    let failure = orchestrator
        .send_message(OWNER, "conv_never_created", "   ")
        .await
        .expect_err("empty text must be rejected");
    assert_eq!(failure.error.code(), "INVALID_REQUEST");
    assert!(failure.conversation.is_none());

    let missing = store
        .get_conversation(OWNER, "conv_never_created")
        .expect("store query");
    assert!(missing.is_none());
}

#[tokio::test]
async fn missing_endpoint_is_rejected_before_any_append() {
    let store = temp_store("endpoint");
    let orchestrator = build_orchestrator(store.clone(), String::new(), 30);

    let failure = orchestrator
        .send_message(OWNER, "", "hello")
        .await
        .expect_err("no endpoint configured");
    assert_eq!(failure.error.code(), "ENDPOINT_NOT_CONFIGURED");
}

#[tokio::test]
async fn message_order_is_stable_across_refetches() {
    let endpoint = spawn_stub(Router::new().route(
        "/hook",
        post(|| async { Json(json!({ "response": "reply" })) }),
    ))
    .await;
    let store = temp_store("ordering");
    let orchestrator = build_orchestrator(store.clone(), endpoint, 30);

    let first = orchestrator
        .send_message(OWNER, "", "one")
        .await
        .expect("first send");
    let conversation_id = first.conversation.conversation_id.clone();
    orchestrator
        .send_message(OWNER, &conversation_id, "two")
        .await
        .expect("second send");

    let a = store
        .get_conversation(OWNER, &conversation_id)
        .expect("first fetch")
        .expect("present");
    let b = store
        .get_conversation(OWNER, &conversation_id)
        .expect("second fetch")
        .expect("present");
    assert_eq!(a.messages, b.messages);
    let contents: Vec<&str> = a
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["one", "reply", "two", "reply"]);
}
