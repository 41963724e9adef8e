//! Usage: Durable pending-generation records (one row per in-flight `message_id`, insertion ordered).

use crate::db::Db;
use crate::domain::generation::{GenerationRequest, LegacyPendingEntry};
use crate::shared::time::now_unix_seconds;
use rusqlite::params;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub request: GenerationRequest,
    pub created_at: i64,
}

pub(crate) fn append(db: &Db, request: &GenerationRequest) -> Result<(), String> {
    append_with_created_at(db, request, now_unix_seconds())
}

/// Re-appending an existing `message_id` refreshes its payload but keeps its position and age.
pub(crate) fn append_with_created_at(
    db: &Db,
    request: &GenerationRequest,
    created_at: i64,
) -> Result<(), String> {
    let request_json = serde_json::to_string(request)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize pending request: {e}"))?;
    let conn = db.open_connection()?;
    conn.execute(
        r#"
INSERT INTO pending_generations (message_id, conversation_id, request_json, created_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(message_id) DO UPDATE SET
  conversation_id = excluded.conversation_id,
  request_json = excluded.request_json
"#,
        params![
            request.message_id,
            request.conversation_id,
            request_json,
            created_at
        ],
    )
    .map_err(|e| format!("DB_ERROR: failed to append pending generation: {e}"))?;
    Ok(())
}

pub(crate) fn remove(db: &Db, message_id: &str) -> Result<bool, String> {
    let conn = db.open_connection()?;
    let changed = conn
        .execute(
            "DELETE FROM pending_generations WHERE message_id = ?1",
            params![message_id],
        )
        .map_err(|e| format!("DB_ERROR: failed to remove pending generation: {e}"))?;
    Ok(changed > 0)
}

pub(crate) fn list(db: &Db) -> Result<Vec<PendingRecord>, String> {
    let conn = db.open_connection()?;
    let mut stmt = conn
        .prepare(
            r#"
SELECT
  message_id,
  request_json,
  created_at
FROM pending_generations
ORDER BY seq ASC
"#,
        )
        .map_err(|e| format!("DB_ERROR: failed to prepare pending query: {e}"))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>("message_id")?,
                row.get::<_, String>("request_json")?,
                row.get::<_, i64>("created_at")?,
            ))
        })
        .map_err(|e| format!("DB_ERROR: failed to list pending generations: {e}"))?;

    let mut items = Vec::new();
    for row in rows {
        let (message_id, request_json, created_at) =
            row.map_err(|e| format!("DB_ERROR: failed to read pending row: {e}"))?;
        match serde_json::from_str::<GenerationRequest>(&request_json) {
            Ok(request) => items.push(PendingRecord {
                request,
                created_at,
            }),
            Err(err) => {
                tracing::warn!(message_id = %message_id, "待续流记录损坏，已跳过: {}", err);
            }
        }
    }

    Ok(items)
}

/// Drops every pending record of a deleted conversation.
pub(crate) fn forget_conversation(db: &Db, conversation_id: &str) -> Result<usize, String> {
    let conn = db.open_connection()?;
    conn.execute(
        "DELETE FROM pending_generations WHERE conversation_id = ?1",
        params![conversation_id],
    )
    .map_err(|e| format!("DB_ERROR: failed to forget conversation pending generations: {e}"))
}

/// Imports the browser client's `pending_ai_messages` JSON list. Unusable entries are skipped.
pub(crate) fn import_legacy_json(db: &Db, raw: &str) -> Result<usize, String> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| format!("SEC_INVALID_INPUT: pending list is not a JSON array: {e}"))?;

    let mut imported = 0;
    for value in values {
        let entry = match serde_json::from_value::<LegacyPendingEntry>(value) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("旧版待续流记录格式无效，已跳过: {}", err);
                continue;
            }
        };
        let Some(request) = entry.message_data.into_request() else {
            continue;
        };
        append(db, &request)?;
        imported += 1;
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn request(message_id: &str, conversation_id: &str) -> GenerationRequest {
        let mut req = GenerationRequest::new(conversation_id, "DeepSeek-R1", "hello");
        req.message_id = message_id.to_string();
        req
    }

    fn ids(db: &Db) -> Vec<String> {
        list(db)
            .expect("list")
            .into_iter()
            .map(|r| r.request.message_id)
            .collect()
    }

    #[test]
    fn append_keeps_insertion_order_and_upserts_in_place() {
        let db = db::init_in_memory();
        append(&db, &request("ai-1", "c1")).expect("append 1");
        append(&db, &request("ai-2", "c1")).expect("append 2");

        let mut updated = request("ai-1", "c1");
        updated.prompt = "edited".to_string();
        append(&db, &updated).expect("re-append 1");

        let records = list(&db).expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request.message_id, "ai-1");
        assert_eq!(records[0].request.prompt, "edited");
        assert_eq!(records[1].request.message_id, "ai-2");
    }

    #[test]
    fn remove_reports_whether_a_row_existed() {
        let db = db::init_in_memory();
        append(&db, &request("ai-1", "c1")).expect("append");
        assert!(remove(&db, "ai-1").expect("remove"));
        assert!(!remove(&db, "ai-1").expect("remove again"));
        assert!(ids(&db).is_empty());
    }

    #[test]
    fn list_skips_corrupt_rows() {
        let db = db::init_in_memory();
        append(&db, &request("ai-1", "c1")).expect("append");
        {
            let conn = db.open_connection().expect("conn");
            conn.execute(
                "INSERT INTO pending_generations (message_id, conversation_id, request_json, created_at) VALUES ('ai-bad', 'c1', '{oops', 0)",
                [],
            )
            .expect("insert corrupt row");
        }
        append(&db, &request("ai-3", "c1")).expect("append");
        assert_eq!(ids(&db), vec!["ai-1".to_string(), "ai-3".to_string()]);
    }

    #[test]
    fn forget_conversation_only_touches_that_conversation() {
        let db = db::init_in_memory();
        append(&db, &request("ai-1", "c1")).expect("append");
        append(&db, &request("ai-2", "c2")).expect("append");
        append(&db, &request("ai-3", "c1")).expect("append");
        assert_eq!(forget_conversation(&db, "c1").expect("forget"), 2);
        assert_eq!(ids(&db), vec!["ai-2".to_string()]);
    }

    #[test]
    fn import_legacy_json_accepts_browser_entries() {
        let db = db::init_in_memory();
        let raw = r#"[
  {"messageData": {"message": "hi", "conversation_id": 5, "model": "GPT-4o", "user_id": "u1", "message_id": "ai-100",
                   "image": "data:image/png;base64,QUJD", "image_type": "image/png", "image_name": "a.png"}},
  {"messageData": {"conversation_id": 5}},
  {"unexpected": true},
  {"messageData": {"message": "", "conversation_id": "6", "message_id": "ai-101"}}
]"#;
        assert_eq!(import_legacy_json(&db, raw).expect("import"), 2);

        let records = list(&db).expect("list");
        assert_eq!(records.len(), 2);
        let first = &records[0].request;
        assert_eq!(first.message_id, "ai-100");
        assert_eq!(first.conversation_id, "5");
        assert_eq!(first.model, "GPT-4o");
        let image = first.image.as_ref().expect("image");
        assert_eq!(image.payload(), "QUJD");
        assert_eq!(records[1].request.conversation_id, "6");

        let err = import_legacy_json(&db, "{}").expect_err("not an array");
        assert!(err.starts_with("SEC_INVALID_INPUT:"), "{err}");
    }
}
