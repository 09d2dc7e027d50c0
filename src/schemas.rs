// 外发请求数据结构，字段命名与现有 webhook 协议保持一致。
use crate::storage::{MessageRecord, Role};
use serde::Serialize;

/// 外发 payload 中的单条历史，只携带角色与文本。
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<&MessageRecord> for HistoryEntry {
    fn from(message: &MessageRecord) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// POST 到外部工作流端点的请求体。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub message: String,
    pub conversation_id: String,
    pub user_id: String,
    pub history: Vec<HistoryEntry>,
    /// agent 绑定携带的身份/账号参数，未绑定时不序列化。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}
