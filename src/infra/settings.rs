//! Usage: Persisted client settings (schema + read/write helpers).

use crate::shared::fs::read_optional_file;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_MODEL: &str = "DeepSeek-R1";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u32 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u32 = 10;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 0;
pub const DEFAULT_SAVE_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SAVE_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_SAVE_RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_PENDING_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_LOG_LEVEL: &str = "info";
const MAX_REQUEST_TIMEOUT_SECONDS: u32 = 10 * 60;
const MAX_CONNECT_TIMEOUT_SECONDS: u32 = 2 * 60;
const MAX_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_SAVE_RETRY_MAX_ATTEMPTS: u32 = 10;
const MAX_SAVE_RETRY_DELAY_MS: u64 = 60_000;
const MAX_PENDING_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::Fixed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub schema_version: u32,
    pub base_url: String,
    // Sent verbatim as the `Cookie` header; authentication itself is handled elsewhere.
    pub session_cookie: String,
    pub user_id: String,
    pub default_model: String,
    // Non-streaming collaborator calls only (save, stop, account info). 0 = disabled.
    pub request_timeout_seconds: u32,
    pub connect_timeout_seconds: u32,
    // 0 = disabled.
    pub stream_idle_timeout_seconds: u32,
    pub save_retry_max_attempts: u32,
    pub save_retry_delay_ms: u64,
    pub save_retry_backoff: RetryBackoff,
    pub save_retry_max_delay_ms: u64,
    // Pending generations not reported active are evicted after this age. 0 = keep forever.
    pub pending_ttl_seconds: u64,
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            base_url: DEFAULT_BASE_URL.to_string(),
            session_cookie: String::new(),
            user_id: String::new(),
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            stream_idle_timeout_seconds: DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS,
            save_retry_max_attempts: DEFAULT_SAVE_RETRY_MAX_ATTEMPTS,
            save_retry_delay_ms: DEFAULT_SAVE_RETRY_DELAY_MS,
            save_retry_backoff: RetryBackoff::Fixed,
            save_retry_max_delay_ms: DEFAULT_SAVE_RETRY_MAX_DELAY_MS,
            pending_ttl_seconds: DEFAULT_PENDING_TTL_SECONDS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn sanitize_base_url(settings: &mut ClientSettings) -> bool {
    let trimmed = settings.base_url.trim().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        settings.base_url = DEFAULT_BASE_URL.to_string();
        return true;
    }
    if trimmed != settings.base_url {
        settings.base_url = trimmed;
        return true;
    }
    false
}

fn sanitize_default_model(settings: &mut ClientSettings) -> bool {
    let trimmed = settings.default_model.trim();
    if trimmed.is_empty() {
        settings.default_model = DEFAULT_MODEL.to_string();
        return true;
    }
    if trimmed.len() != settings.default_model.len() {
        settings.default_model = trimmed.to_string();
        return true;
    }
    false
}

fn sanitize_timeouts(settings: &mut ClientSettings) -> bool {
    let mut changed = false;

    if settings.request_timeout_seconds > MAX_REQUEST_TIMEOUT_SECONDS {
        settings.request_timeout_seconds = MAX_REQUEST_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.connect_timeout_seconds == 0 {
        settings.connect_timeout_seconds = DEFAULT_CONNECT_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.connect_timeout_seconds > MAX_CONNECT_TIMEOUT_SECONDS {
        settings.connect_timeout_seconds = MAX_CONNECT_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.stream_idle_timeout_seconds > MAX_STREAM_IDLE_TIMEOUT_SECONDS {
        settings.stream_idle_timeout_seconds = MAX_STREAM_IDLE_TIMEOUT_SECONDS;
        changed = true;
    }

    changed
}

fn sanitize_save_retry(settings: &mut ClientSettings) -> bool {
    let mut changed = false;

    if settings.save_retry_max_attempts == 0 {
        settings.save_retry_max_attempts = DEFAULT_SAVE_RETRY_MAX_ATTEMPTS;
        changed = true;
    }
    if settings.save_retry_max_attempts > MAX_SAVE_RETRY_MAX_ATTEMPTS {
        settings.save_retry_max_attempts = MAX_SAVE_RETRY_MAX_ATTEMPTS;
        changed = true;
    }
    if settings.save_retry_delay_ms > MAX_SAVE_RETRY_DELAY_MS {
        settings.save_retry_delay_ms = MAX_SAVE_RETRY_DELAY_MS;
        changed = true;
    }
    if settings.save_retry_max_delay_ms > MAX_SAVE_RETRY_DELAY_MS {
        settings.save_retry_max_delay_ms = MAX_SAVE_RETRY_DELAY_MS;
        changed = true;
    }
    if settings.save_retry_max_delay_ms < settings.save_retry_delay_ms {
        settings.save_retry_max_delay_ms = settings.save_retry_delay_ms;
        changed = true;
    }

    changed
}

fn sanitize_pending_ttl(settings: &mut ClientSettings) -> bool {
    if settings.pending_ttl_seconds > MAX_PENDING_TTL_SECONDS {
        settings.pending_ttl_seconds = MAX_PENDING_TTL_SECONDS;
        return true;
    }
    false
}

fn sanitize_log_level(settings: &mut ClientSettings) -> bool {
    let normalized = settings.log_level.trim().to_ascii_lowercase();
    if !LOG_LEVELS.contains(&normalized.as_str()) {
        settings.log_level = DEFAULT_LOG_LEVEL.to_string();
        return true;
    }
    if normalized != settings.log_level {
        settings.log_level = normalized;
        return true;
    }
    false
}

fn stamp_schema_version(settings: &mut ClientSettings, schema_version_present: bool) -> bool {
    // If schema_version is missing, force a write so the file records the schema it was read with.
    if schema_version_present && settings.schema_version >= SCHEMA_VERSION {
        return false;
    }
    settings.schema_version = SCHEMA_VERSION;
    true
}

fn sanitize(settings: &mut ClientSettings, schema_version_present: bool) -> bool {
    let mut repaired = false;
    repaired |= stamp_schema_version(settings, schema_version_present);
    repaired |= sanitize_base_url(settings);
    repaired |= sanitize_default_model(settings);
    repaired |= sanitize_timeouts(settings);
    repaired |= sanitize_save_retry(settings);
    repaired |= sanitize_pending_ttl(settings);
    repaired |= sanitize_log_level(settings);
    repaired
}

pub fn settings_path(dir: &Path) -> PathBuf {
    dir.join("settings.json")
}

fn parse_settings_json(content: &[u8]) -> Result<(ClientSettings, bool), String> {
    let raw: serde_json::Value = serde_json::from_slice(content)
        .map_err(|e| format!("failed to parse settings.json: {e}"))?;
    let schema_version_present = raw.get("schema_version").is_some();
    let settings: ClientSettings = serde_json::from_value(raw)
        .map_err(|e| format!("failed to parse settings.json: {e}"))?;
    Ok((settings, schema_version_present))
}

pub fn read(dir: &Path) -> Result<ClientSettings, String> {
    let path = settings_path(dir);

    let Some(content) = read_optional_file(&path)? else {
        let settings = ClientSettings::default();
        // Best-effort: create default settings.json on first read to make the config discoverable/editable.
        let _ = write(dir, &settings);
        return Ok(settings);
    };

    let (mut settings, schema_version_present) = parse_settings_json(&content)?;

    if !settings.base_url.trim().is_empty() && !is_http_url(settings.base_url.trim()) {
        return Err("invalid settings.json: base_url must start with http:// or https://".to_string());
    }

    if sanitize(&mut settings, schema_version_present) {
        // Best-effort: persist repaired values while keeping read semantics.
        if let Err(err) = write(dir, &settings) {
            tracing::warn!("settings.json 修复写回失败: {}", err);
        }
    }

    Ok(settings)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

pub fn write(dir: &Path, settings: &ClientSettings) -> Result<ClientSettings, String> {
    if !is_http_url(settings.base_url.trim()) {
        return Err("SEC_INVALID_INPUT: base_url must start with http:// or https://".to_string());
    }
    if settings.default_model.trim().is_empty() {
        return Err("SEC_INVALID_INPUT: default_model is required".to_string());
    }
    if settings.save_retry_max_attempts == 0 {
        return Err("SEC_INVALID_INPUT: save_retry_max_attempts must be >= 1".to_string());
    }
    if settings.save_retry_max_attempts > MAX_SAVE_RETRY_MAX_ATTEMPTS {
        return Err(format!(
            "SEC_INVALID_INPUT: save_retry_max_attempts must be <= {MAX_SAVE_RETRY_MAX_ATTEMPTS}"
        ));
    }
    if settings.save_retry_delay_ms > MAX_SAVE_RETRY_DELAY_MS {
        return Err(format!(
            "SEC_INVALID_INPUT: save_retry_delay_ms must be <= {MAX_SAVE_RETRY_DELAY_MS}"
        ));
    }
    if settings.stream_idle_timeout_seconds > MAX_STREAM_IDLE_TIMEOUT_SECONDS {
        return Err(format!(
            "SEC_INVALID_INPUT: stream_idle_timeout_seconds must be <= {MAX_STREAM_IDLE_TIMEOUT_SECONDS}"
        ));
    }
    if settings.pending_ttl_seconds > MAX_PENDING_TTL_SECONDS {
        return Err(format!(
            "SEC_INVALID_INPUT: pending_ttl_seconds must be <= {MAX_PENDING_TTL_SECONDS}"
        ));
    }

    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create {}: {e}", dir.display()))?;

    let path = settings_path(dir);
    let tmp_path = path.with_file_name("settings.json.tmp");
    let backup_path = path.with_file_name("settings.json.bak");

    let content = serde_json::to_vec_pretty(settings)
        .map_err(|e| format!("failed to serialize settings: {e}"))?;

    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("failed to write temp settings file: {e}"))?;

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }

    if path.exists() {
        std::fs::rename(&path, &backup_path)
            .map_err(|e| format!("failed to create settings backup: {e}"))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::rename(&backup_path, &path);
        return Err(format!("failed to finalize settings: {e}"));
    }

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }

    Ok(settings.clone())
}
