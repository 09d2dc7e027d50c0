// 会话编排：send_message 用例全链路与会话/附件的守卫式变更。
use crate::config::{AttachmentConfig, DispatchConfig};
use crate::dispatcher::{DispatchFailure, Dispatcher};
use crate::i18n;
use crate::normalizer::normalize_value;
use crate::schemas::{DispatchPayload, HistoryEntry};
use crate::storage::{
    AgentBinding, AttachmentRecord, AttachmentStatus, ConversationRecord, ConversationStore,
    MessageRecord, Role,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// 新会话的占位标题，首次发送时按消息内容自动改写。
pub const DEFAULT_TITLE: &str = "New conversation";
const AUTO_TITLE_MAX_CHARS: usize = 30;

#[derive(Debug)]
pub struct ChatError {
    code: &'static str,
    message: String,
    detail: Option<Value>,
}

impl ChatError {
    fn new(code: &'static str, message: String, detail: Option<Value>) -> Self {
        Self {
            code,
            message,
            detail,
        }
    }

    pub fn invalid_request(message: String) -> Self {
        Self::new("INVALID_REQUEST", message, None)
    }

    pub fn not_found(message: String) -> Self {
        Self::new("NOT_FOUND", message, None)
    }

    pub fn attachment_pending_exists() -> Self {
        Self::new(
            "ATTACHMENT_PENDING_EXISTS",
            i18n::t("error.attachment_pending_exists"),
            None,
        )
    }

    pub fn attachment_limit_reached(max_files: usize) -> Self {
        let mut params = HashMap::new();
        params.insert("limit".to_string(), max_files.to_string());
        Self::new(
            "ATTACHMENT_LIMIT_REACHED",
            i18n::t_with_params("error.attachment_limit_reached", &params),
            Some(json!({ "max_files": max_files })),
        )
    }

    pub fn attachment_too_large(max_bytes: usize) -> Self {
        let mut params = HashMap::new();
        params.insert("limit".to_string(), max_bytes.to_string());
        Self::new(
            "ATTACHMENT_TOO_LARGE",
            i18n::t_with_params("error.attachment_too_large", &params),
            Some(json!({ "max_upload_bytes": max_bytes })),
        )
    }

    pub fn endpoint_not_configured() -> Self {
        Self::new(
            "ENDPOINT_NOT_CONFIGURED",
            i18n::t("error.endpoint_not_configured"),
            None,
        )
    }

    pub fn internal(message: String) -> Self {
        Self::new("INTERNAL_ERROR", message, None)
    }

    pub fn dispatch(failure: &DispatchFailure) -> Self {
        let detail = match failure {
            DispatchFailure::Timeout { timeout_s } => json!({ "timeout_s": timeout_s }),
            DispatchFailure::Transport(message) => json!({ "transport": message }),
            DispatchFailure::NonSuccess { status, body } => {
                json!({ "status": status, "body": body })
            }
        };
        Self::new(failure.code(), failure.to_string(), Some(detail))
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(detail) = &self.detail {
            if let Value::Object(ref mut map) = payload {
                map.insert("detail".to_string(), detail.clone());
            }
        }
        payload
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ChatError {}

#[derive(Debug)]
pub struct SendOutcome {
    pub assistant_text: String,
    pub conversation: ConversationRecord,
}

/// 发送失败时除错误外还带回已部分更新的会话，用户消息不会丢失。
#[derive(Debug)]
pub struct SendFailure {
    pub error: ChatError,
    pub conversation: Option<ConversationRecord>,
}

impl SendFailure {
    fn bare(error: ChatError) -> Self {
        Self {
            error,
            conversation: None,
        }
    }
}

/// 会话锁句柄：持有期内同会话变更串行执行，释放时无等待者则回收映射项。
struct ConversationLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl ConversationLock<'_> {
    async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for ConversationLock<'_> {
    fn drop(&mut self) {
        // 强引用只剩映射与自身即无等待者；等待者持有的克隆会挡住删除。
        // remove_if 与 lock_for 的 entry 同在分片写锁下，计数判定不会撕裂。
        self.locks
            .remove_if(&self.key, |_, entry| Arc::strong_count(entry) <= 2);
    }
}

pub struct ChatOrchestrator {
    store: Arc<dyn ConversationStore>,
    dispatcher: Arc<Dispatcher>,
    attachments: AttachmentConfig,
    // 按 (owner, conversation) 串行化追加，两次并发发送不得交错落盘。
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dispatcher: Arc<Dispatcher>,
        attachments: AttachmentConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            attachments,
            locks: DashMap::new(),
        }
    }

    pub fn dispatch_config(&self) -> &DispatchConfig {
        self.dispatcher.config()
    }

    fn lock_for(&self, owner_id: &str, conversation_id: &str) -> ConversationLock<'_> {
        let key = format!("{owner_id}:{conversation_id}");
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ConversationLock {
            locks: &self.locks,
            key,
            lock,
        }
    }

    pub fn create_conversation(
        &self,
        owner_id: &str,
        title: Option<String>,
        agent: Option<AgentBinding>,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        let now = now_ts();
        let title = title
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let record = ConversationRecord {
            conversation_id: format!("conv_{}", Uuid::new_v4().simple()),
            owner_id: owner_id.to_string(),
            title,
            messages: Vec::new(),
            agent,
            attachments: Vec::new(),
            is_archived: false,
            created_at: now,
            updated_at: now,
        };
        self.persist(&record)?;
        info!(
            "conversation created: owner={}, conversation={}",
            record.owner_id, record.conversation_id
        );
        Ok(record)
    }

    pub fn get_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        self.load(owner_id, conversation_id)?
            .ok_or_else(|| ChatError::not_found(i18n::t("error.conversation_not_found")))
    }

    pub fn list_conversations(
        &self,
        owner_id: &str,
        include_archived: bool,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ConversationRecord>, i64), ChatError> {
        let owner_id = require_owner(owner_id)?;
        self.store
            .list_conversations(owner_id, include_archived, offset, limit)
            .map_err(|err| ChatError::internal(err.to_string()))
    }

    /// 整条聚合读改写，必须与 send_message 同锁，否则互相覆盖落盘。
    pub async fn rename_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        let conversation_id = conversation_id.trim();
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::invalid_request(i18n::t("error.title_required")));
        }
        let lock = self.lock_for(owner_id, conversation_id);
        let _guard = lock.acquire().await;

        let mut record = self.get_conversation(owner_id, conversation_id)?;
        record.title = title.to_string();
        record.updated_at = now_ts();
        self.persist(&record)?;
        Ok(record)
    }

    pub async fn set_archived(
        &self,
        owner_id: &str,
        conversation_id: &str,
        archived: bool,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        let conversation_id = conversation_id.trim();
        let lock = self.lock_for(owner_id, conversation_id);
        let _guard = lock.acquire().await;

        let mut record = self.get_conversation(owner_id, conversation_id)?;
        record.is_archived = archived;
        record.updated_at = now_ts();
        self.persist(&record)?;
        Ok(record)
    }

    /// 删除不可恢复。
    pub fn delete_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let owner_id = require_owner(owner_id)?;
        let affected = self
            .store
            .delete_conversation(owner_id, conversation_id)
            .map_err(|err| ChatError::internal(err.to_string()))?;
        if affected == 0 {
            return Err(ChatError::not_found(i18n::t(
                "error.conversation_not_found",
            )));
        }
        info!("conversation deleted: owner={owner_id}, conversation={conversation_id}");
        Ok(())
    }

    /// 发送用例主链路：追加用户消息即落盘，外发成败都保证会话可见一致。
    pub async fn send_message(
        &self,
        owner_id: &str,
        conversation_id: &str,
        text: &str,
    ) -> Result<SendOutcome, SendFailure> {
        let owner_id =
            require_owner(owner_id).map_err(SendFailure::bare)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SendFailure::bare(ChatError::invalid_request(i18n::t(
                "error.content_required",
            ))));
        }

        // 空 id 表示新建，未知 id 同样按新建处理。
        let conversation_id = if conversation_id.trim().is_empty() {
            format!("conv_{}", Uuid::new_v4().simple())
        } else {
            conversation_id.trim().to_string()
        };
        let lock = self.lock_for(owner_id, &conversation_id);
        let _guard = lock.acquire().await;

        let mut record = match self.load(owner_id, &conversation_id) {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                let now = now_ts();
                ConversationRecord {
                    conversation_id: conversation_id.clone(),
                    owner_id: owner_id.to_string(),
                    title: DEFAULT_TITLE.to_string(),
                    messages: Vec::new(),
                    agent: None,
                    attachments: Vec::new(),
                    is_archived: false,
                    created_at: now,
                    updated_at: now,
                }
            }
            Err(err) => return Err(SendFailure::bare(err)),
        };

        let endpoint = self
            .resolve_conversation_endpoint(&record)
            .map_err(SendFailure::bare)?;

        if should_auto_title(&record) {
            record.title = build_conversation_title(text);
        }

        // 先落盘用户消息，下游失败也不丢输入。
        let ts = next_timestamp(&record);
        record.messages.push(MessageRecord {
            role: Role::User,
            content: text.to_string(),
            timestamp: ts,
        });
        record.updated_at = ts;
        self.persist(&record).map_err(SendFailure::bare)?;

        let pending_ids: Vec<String> = record
            .attachments
            .iter()
            .filter(|item| item.status == AttachmentStatus::Pending)
            .map(|item| item.attachment_id.clone())
            .collect();

        let payload = self.build_payload(&record, text);
        match self.dispatcher.call(&endpoint, &payload).await {
            Ok(success) => {
                let assistant_text = normalize_value(success.body);
                let ts = next_timestamp(&record);
                record.messages.push(MessageRecord {
                    role: Role::Assistant,
                    content: assistant_text.clone(),
                    timestamp: ts,
                });
                for attachment in record.attachments.iter_mut() {
                    if pending_ids.contains(&attachment.attachment_id) {
                        attachment.status = AttachmentStatus::Processed;
                    }
                }
                record.updated_at = ts;
                self.persist(&record).map_err(SendFailure::bare)?;
                Ok(SendOutcome {
                    assistant_text,
                    conversation: record,
                })
            }
            Err(failure) => {
                warn!(
                    "dispatch failed: conversation={}, kind={}",
                    record.conversation_id,
                    failure.code()
                );
                let notice = dispatch_failure_notice(&failure);
                let ts = next_timestamp(&record);
                record.messages.push(MessageRecord {
                    role: Role::Assistant,
                    content: notice,
                    timestamp: ts,
                });
                // 随行的 pending 附件记为 error，不得滞留到下一次发送。
                for attachment in record.attachments.iter_mut() {
                    if pending_ids.contains(&attachment.attachment_id) {
                        attachment.status = AttachmentStatus::Error;
                    }
                }
                record.updated_at = ts;
                self.persist(&record).map_err(SendFailure::bare)?;
                Err(SendFailure {
                    error: ChatError::dispatch(&failure),
                    conversation: Some(record),
                })
            }
        }
    }

    pub async fn upload_attachment(
        &self,
        owner_id: &str,
        conversation_id: &str,
        name: &str,
        mime_type: &str,
        size_bytes: u64,
    ) -> Result<(AttachmentRecord, ConversationRecord), ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::invalid_request(i18n::t(
                "error.attachment_name_required",
            )));
        }
        if size_bytes as usize > self.attachments.max_upload_bytes {
            return Err(ChatError::attachment_too_large(
                self.attachments.max_upload_bytes,
            ));
        }
        let owner_id = require_owner(owner_id)?;
        let conversation_id = conversation_id.trim();
        let lock = self.lock_for(owner_id, conversation_id);
        let _guard = lock.acquire().await;

        let mut record = self.get_conversation(owner_id, conversation_id)?;
        if record.pending_count() > 0 {
            return Err(ChatError::attachment_pending_exists());
        }
        if record.attachments.len() >= self.attachments.max_files {
            return Err(ChatError::attachment_limit_reached(
                self.attachments.max_files,
            ));
        }
        let attachment = AttachmentRecord {
            attachment_id: format!("att_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            mime_type: normalize_mime(mime_type),
            size_bytes,
            status: AttachmentStatus::Pending,
        };
        record.attachments.push(attachment.clone());
        record.updated_at = now_ts();
        self.persist(&record)?;
        Ok((attachment, record))
    }

    pub async fn remove_attachment(
        &self,
        owner_id: &str,
        conversation_id: &str,
        attachment_id: &str,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        let conversation_id = conversation_id.trim();
        let lock = self.lock_for(owner_id, conversation_id);
        let _guard = lock.acquire().await;

        let mut record = self.get_conversation(owner_id, conversation_id)?;
        let before = record.attachments.len();
        record
            .attachments
            .retain(|item| item.attachment_id != attachment_id);
        if record.attachments.len() == before {
            return Err(ChatError::not_found(i18n::t("error.attachment_not_found")));
        }
        record.updated_at = now_ts();
        self.persist(&record)?;
        Ok(record)
    }

    /// 唯一合法的显式状态迁移：pending → error。
    pub async fn mark_attachment_error(
        &self,
        owner_id: &str,
        conversation_id: &str,
        attachment_id: &str,
    ) -> Result<ConversationRecord, ChatError> {
        let owner_id = require_owner(owner_id)?;
        let conversation_id = conversation_id.trim();
        let lock = self.lock_for(owner_id, conversation_id);
        let _guard = lock.acquire().await;

        let mut record = self.get_conversation(owner_id, conversation_id)?;
        let attachment = record
            .attachments
            .iter_mut()
            .find(|item| item.attachment_id == attachment_id)
            .ok_or_else(|| ChatError::not_found(i18n::t("error.attachment_not_found")))?;
        if attachment.status != AttachmentStatus::Pending {
            return Err(ChatError::invalid_request(i18n::t(
                "error.attachment_not_pending",
            )));
        }
        attachment.status = AttachmentStatus::Error;
        record.updated_at = now_ts();
        self.persist(&record)?;
        Ok(record)
    }

    fn resolve_conversation_endpoint(
        &self,
        record: &ConversationRecord,
    ) -> Result<String, ChatError> {
        let target = record
            .agent
            .as_ref()
            .map(|agent| agent.endpoint_url.trim())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.dispatch_config().default_endpoint.trim());
        if target.is_empty() {
            return Err(ChatError::endpoint_not_configured());
        }
        self.dispatcher
            .resolve_endpoint(target)
            .map_err(|err| ChatError::internal(err.to_string()))
    }

    fn build_payload(&self, record: &ConversationRecord, text: &str) -> DispatchPayload {
        // 历史不含本次刚追加的用户消息，只带角色与文本。
        let message_count = record.messages.len().saturating_sub(1);
        let max_entries = self.dispatch_config().max_history_entries;
        let skip = message_count.saturating_sub(max_entries);
        let history: Vec<HistoryEntry> = record.messages[..message_count]
            .iter()
            .skip(skip)
            .map(HistoryEntry::from)
            .collect();
        let (account, agent) = match &record.agent {
            Some(binding) => (binding.account_hint.clone(), Some(binding.name.clone())),
            None => (None, None),
        };
        DispatchPayload {
            message: text.to_string(),
            conversation_id: record.conversation_id.clone(),
            user_id: record.owner_id.clone(),
            history,
            account,
            agent,
        }
    }

    fn load(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, ChatError> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::invalid_request(i18n::t(
                "error.conversation_not_found",
            )));
        }
        self.store
            .get_conversation(owner_id, conversation_id)
            .map_err(|err| ChatError::internal(err.to_string()))
    }

    fn persist(&self, record: &ConversationRecord) -> Result<(), ChatError> {
        self.store
            .upsert_conversation(record)
            .map_err(|err| ChatError::internal(err.to_string()))
    }
}

fn require_owner(owner_id: &str) -> Result<&str, ChatError> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(ChatError::invalid_request(i18n::t("error.owner_required")));
    }
    Ok(owner_id)
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// 追加时间戳在会话内单调不减，系统时钟回拨时贴着上一条。
fn next_timestamp(record: &ConversationRecord) -> f64 {
    let now = now_ts();
    match record.messages.last() {
        Some(last) if last.timestamp > now => last.timestamp,
        _ => now,
    }
}

fn should_auto_title(record: &ConversationRecord) -> bool {
    record.messages.is_empty() && record.title == DEFAULT_TITLE
}

fn build_conversation_title(text: &str) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut title: String = cleaned.chars().take(AUTO_TITLE_MAX_CHARS).collect();
    if cleaned.chars().count() > AUTO_TITLE_MAX_CHARS {
        title.push('…');
    }
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// 非法 MIME 统一落到 octet-stream，下游渲染自行决定展示方式。
fn normalize_mime(raw: &str) -> String {
    match raw.trim().parse::<mime::Mime>() {
        Ok(parsed) => parsed.essence_str().to_string(),
        Err(_) => mime::APPLICATION_OCTET_STREAM.essence_str().to_string(),
    }
}

fn dispatch_failure_notice(failure: &DispatchFailure) -> String {
    match failure {
        DispatchFailure::Timeout { timeout_s } => {
            let mut params = HashMap::new();
            params.insert("timeout".to_string(), timeout_s.to_string());
            i18n::t_with_params("chat.dispatch_timeout_notice", &params)
        }
        DispatchFailure::Transport(detail) => {
            let mut params = HashMap::new();
            params.insert("detail".to_string(), detail.clone());
            i18n::t_with_params("chat.dispatch_transport_notice", &params)
        }
        DispatchFailure::NonSuccess { status, .. } => {
            let mut params = HashMap::new();
            params.insert("status".to_string(), status.to_string());
            i18n::t_with_params("chat.dispatch_status_notice", &params)
        }
    }
}
