// SQLite 存储实现：会话聚合整体读写，消息/附件以 JSON 列落盘。
use crate::storage::{
    AgentBinding, AttachmentRecord, ConversationRecord, ConversationStore, MessageRecord,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/flowrelay.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn messages_to_json(messages: &[MessageRecord]) -> String {
        serde_json::to_string(messages).unwrap_or_else(|_| "[]".to_string())
    }

    fn messages_from_json(text: &str) -> Vec<MessageRecord> {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn attachments_to_json(attachments: &[AttachmentRecord]) -> String {
        serde_json::to_string(attachments).unwrap_or_else(|_| "[]".to_string())
    }

    fn attachments_from_json(text: &str) -> Vec<AttachmentRecord> {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn agent_to_json(agent: &Option<AgentBinding>) -> Option<String> {
        agent
            .as_ref()
            .and_then(|value| serde_json::to_string(value).ok())
    }

    fn agent_from_json(text: Option<String>) -> Option<AgentBinding> {
        text.and_then(|value| serde_json::from_str(&value).ok())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRecord> {
        let messages_json: String = row.get("messages")?;
        let attachments_json: String = row.get("attachments")?;
        let agent_json: Option<String> = row.get("agent")?;
        let archived: i64 = row.get("is_archived")?;
        Ok(ConversationRecord {
            conversation_id: row.get("conversation_id")?,
            owner_id: row.get("owner_id")?,
            title: row.get("title")?,
            messages: Self::messages_from_json(&messages_json),
            agent: Self::agent_from_json(agent_json),
            attachments: Self::attachments_from_json(&attachments_json),
            is_archived: archived != 0,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
              owner_id TEXT NOT NULL,
              conversation_id TEXT NOT NULL,
              title TEXT NOT NULL,
              messages TEXT NOT NULL,
              attachments TEXT NOT NULL,
              agent TEXT,
              is_archived INTEGER NOT NULL DEFAULT 0,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (owner_id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_owner_updated
              ON conversations (owner_id, updated_at DESC);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()> {
        self.ensure_initialized()?;
        if record.owner_id.trim().is_empty() || record.conversation_id.trim().is_empty() {
            return Err(anyhow!("conversation key is empty"));
        }
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO conversations
              (owner_id, conversation_id, title, messages, attachments, agent,
               is_archived, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (owner_id, conversation_id) DO UPDATE SET
              title = excluded.title,
              messages = excluded.messages,
              attachments = excluded.attachments,
              agent = excluded.agent,
              is_archived = excluded.is_archived,
              updated_at = excluded.updated_at
            "#,
            params![
                record.owner_id,
                record.conversation_id,
                record.title,
                Self::messages_to_json(&record.messages),
                Self::attachments_to_json(&record.attachments),
                Self::agent_to_json(&record.agent),
                record.is_archived as i64,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                r#"
                SELECT owner_id, conversation_id, title, messages, attachments, agent,
                       is_archived, created_at, updated_at
                FROM conversations
                WHERE owner_id = ?1 AND conversation_id = ?2
                "#,
                params![owner_id, conversation_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list_conversations(
        &self,
        owner_id: &str,
        include_archived: bool,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ConversationRecord>, i64)> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let archived_clause = if include_archived {
            ""
        } else {
            " AND is_archived = 0"
        };
        let total: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM conversations WHERE owner_id = ?1{archived_clause}"
            ),
            params![owner_id],
            |row| row.get(0),
        )?;
        let limit = if limit <= 0 { 50 } else { limit };
        let offset = offset.max(0);
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT owner_id, conversation_id, title, messages, attachments, agent,
                   is_archived, created_at, updated_at
            FROM conversations
            WHERE owner_id = ?1{archived_clause}
            ORDER BY updated_at DESC
            LIMIT ?2 OFFSET ?3
            "#
        ))?;
        let rows = stmt.query_map(params![owner_id, limit, offset], Self::row_to_record)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok((items, total))
    }

    fn delete_conversation(&self, owner_id: &str, conversation_id: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM conversations WHERE owner_id = ?1 AND conversation_id = ?2",
            params![owner_id, conversation_id],
        )?;
        Ok(affected as i64)
    }
}
