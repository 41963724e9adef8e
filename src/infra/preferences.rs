//! Usage: Small client preferences kept in the `client_kv` table (selected model).

use crate::db::Db;
use crate::shared::time::now_unix_seconds;
use rusqlite::{params, OptionalExtension};

const SELECTED_MODEL_KEY: &str = "selected_model";

fn get(db: &Db, key: &str) -> Result<Option<String>, String> {
    let conn = db.open_connection()?;
    conn.query_row(
        "SELECT value FROM client_kv WHERE key = ?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| format!("DB_ERROR: failed to read client_kv {key}: {e}"))
}

fn set(db: &Db, key: &str, value: &str) -> Result<(), String> {
    let conn = db.open_connection()?;
    conn.execute(
        r#"
INSERT INTO client_kv (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
        params![key, value, now_unix_seconds()],
    )
    .map_err(|e| format!("DB_ERROR: failed to write client_kv {key}: {e}"))?;
    Ok(())
}

pub(crate) fn selected_model(db: &Db) -> Result<Option<String>, String> {
    Ok(get(db, SELECTED_MODEL_KEY)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

pub(crate) fn set_selected_model(db: &Db, model: &str) -> Result<(), String> {
    let model = model.trim();
    if model.is_empty() {
        return Err("SEC_INVALID_INPUT: model is required".to_string());
    }
    set(db, SELECTED_MODEL_KEY, model)
}
