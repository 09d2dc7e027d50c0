use flowrelay_server::storage::{
    AgentBinding, AttachmentRecord, AttachmentStatus, ConversationRecord, ConversationStore,
    MessageRecord, Role, SqliteStorage,
};
use tempfile::TempDir;

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn temp_storage(tag: &str) -> (TempDir, SqliteStorage) {
    let dir = TempDir::new().expect("create temp dir");
    let db_path = dir.path().join(format!("flowrelay_store_{tag}.db"));
    let storage = SqliteStorage::new(db_path.to_string_lossy().to_string());
    (dir, storage)
}

fn build_record(owner: &str, conversation_id: &str, updated_at: f64) -> ConversationRecord {
    ConversationRecord {
        conversation_id: conversation_id.to_string(),
        owner_id: owner.to_string(),
        title: format!("title_{conversation_id}"),
        messages: vec![MessageRecord {
            role: Role::User,
            content: "hello".to_string(),
            timestamp: updated_at,
        }],
        agent: None,
        attachments: Vec::new(),
        is_archived: false,
        created_at: updated_at,
        updated_at,
    }
}

#[test]
fn roundtrip_preserves_messages_attachments_and_agent() {
    let (_dir, storage) = temp_storage("roundtrip");
    let now = now_ts();
    let mut record = build_record("owner_a", "conv_round", now);
    record.agent = Some(AgentBinding {
        name: "reporting-flow".to_string(),
        endpoint_url: "https://flows.example/run".to_string(),
        icon: None,
        description: Some("weekly numbers".to_string()),
        account_hint: Some("acct_42".to_string()),
    });
    record.attachments.push(AttachmentRecord {
        attachment_id: "att_1".to_string(),
        name: "report.csv".to_string(),
        mime_type: "text/csv".to_string(),
        size_bytes: 1234,
        status: AttachmentStatus::Pending,
    });
    record.messages.push(MessageRecord {
        role: Role::Assistant,
        content: "hi there".to_string(),
        timestamp: now + 1.0,
    });

    storage.upsert_conversation(&record).expect("upsert");
    let loaded = storage
        .get_conversation("owner_a", "conv_round")
        .expect("get")
        .expect("present");
    assert_eq!(loaded.title, record.title);
    assert_eq!(loaded.messages, record.messages);
    assert_eq!(loaded.attachments.len(), 1);
    assert_eq!(loaded.attachments[0].status, AttachmentStatus::Pending);
    let agent = loaded.agent.expect("agent preserved");
    assert_eq!(agent.name, "reporting-flow");
    assert_eq!(agent.account_hint.as_deref(), Some("acct_42"));
}

#[test]
fn reads_are_scoped_to_the_owner() {
    let (_dir, storage) = temp_storage("scope");
    let now = now_ts();
    storage
        .upsert_conversation(&build_record("owner_a", "conv_shared_id", now))
        .expect("upsert");

    let other = storage
        .get_conversation("owner_b", "conv_shared_id")
        .expect("get");
    assert!(other.is_none());

    let (items, total) = storage
        .list_conversations("owner_b", true, 0, 50)
        .expect("list");
    assert!(items.is_empty());
    assert_eq!(total, 0);
}

#[test]
fn listing_paginates_and_orders_by_recency() {
    let (_dir, storage) = temp_storage("paging");
    let base = now_ts();
    for index in 0..5 {
        storage
            .upsert_conversation(&build_record(
                "owner_list",
                &format!("conv_{index}"),
                base + index as f64,
            ))
            .expect("upsert");
    }

    let (first_page, total) = storage
        .list_conversations("owner_list", false, 0, 2)
        .expect("list first page");
    assert_eq!(total, 5);
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].conversation_id, "conv_4");
    assert_eq!(first_page[1].conversation_id, "conv_3");

    let (second_page, _) = storage
        .list_conversations("owner_list", false, 2, 2)
        .expect("list second page");
    assert_eq!(second_page[0].conversation_id, "conv_2");
}

#[test]
fn archived_conversations_are_filtered_unless_requested() {
    let (_dir, storage) = temp_storage("archive");
    let now = now_ts();
    let mut archived = build_record("owner_arch", "conv_archived", now);
    archived.is_archived = true;
    storage.upsert_conversation(&archived).expect("upsert");
    storage
        .upsert_conversation(&build_record("owner_arch", "conv_active", now + 1.0))
        .expect("upsert");

    let (visible, total) = storage
        .list_conversations("owner_arch", false, 0, 50)
        .expect("list active");
    assert_eq!(total, 1);
    assert_eq!(visible[0].conversation_id, "conv_active");

    let (all, total_all) = storage
        .list_conversations("owner_arch", true, 0, 50)
        .expect("list all");
    assert_eq!(total_all, 2);
    assert_eq!(all.len(), 2);
}

#[test]
fn upsert_updates_in_place_and_delete_reports_affected_rows() {
    let (_dir, storage) = temp_storage("delete");
    let now = now_ts();
    let mut record = build_record("owner_del", "conv_del", now);
    storage.upsert_conversation(&record).expect("insert");

    record.title = "renamed".to_string();
    record.updated_at = now + 5.0;
    storage.upsert_conversation(&record).expect("update");
    let loaded = storage
        .get_conversation("owner_del", "conv_del")
        .expect("get")
        .expect("present");
    assert_eq!(loaded.title, "renamed");
    assert_eq!(loaded.created_at, now);

    let affected = storage
        .delete_conversation("owner_del", "conv_del")
        .expect("delete");
    assert_eq!(affected, 1);
    let affected_again = storage
        .delete_conversation("owner_del", "conv_del")
        .expect("delete twice");
    assert_eq!(affected_again, 0);
}
