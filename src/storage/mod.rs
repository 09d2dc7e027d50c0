// 存储模块：会话聚合的统一持久化接口与 SQLite 实现。

mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use sqlite::SqliteStorage;

/// 消息角色，封闭枚举，不接受其他取值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: Role,
    pub content: String,
    /// Unix 秒，会话内保证单调不减。
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Pending,
    Processed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub attachment_id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub status: AttachmentStatus,
}

/// 会话绑定的外部工作流身份。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 外发 payload 中携带的身份/账号参数。
    #[serde(default)]
    pub account_hint: Option<String>,
}

/// 会话聚合根，按 (owner_id, conversation_id) 唯一。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub owner_id: String,
    pub title: String,
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub agent: Option<AgentBinding>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

impl ConversationRecord {
    /// 当前处于 pending 的附件数。
    pub fn pending_count(&self) -> usize {
        self.attachments
            .iter()
            .filter(|item| item.status == AttachmentStatus::Pending)
            .count()
    }
}

/// 会话存储抽象：所有读写都按 owner 维度隔离。
pub trait ConversationStore: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()>;
    fn get_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>>;
    fn list_conversations(
        &self,
        owner_id: &str,
        include_archived: bool,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ConversationRecord>, i64)>;
    fn delete_conversation(&self, owner_id: &str, conversation_id: &str) -> Result<i64>;
}

/// 构建存储后端，按 backend 配置选择实现。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn ConversationStore>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        other => Err(anyhow!("未知存储后端: {other}")),
    }
}
