//! Usage: Resolve the per-user app data directory (settings, sqlite db, logs).

use std::path::PathBuf;

pub const APP_DOTDIR_NAME: &str = ".chat-stream";
const APP_DOTDIR_NAME_ENV: &str = "CHAT_STREAM_DOTDIR_NAME";

fn is_safe_dotdir_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    if !name.starts_with('.') {
        return false;
    }
    if name.contains('/') || name.contains('\\') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn resolve_dotdir_name(env_value: Option<String>) -> String {
    env_value
        .map(|v| v.trim().to_string())
        .filter(|v| is_safe_dotdir_name(v))
        .unwrap_or_else(|| APP_DOTDIR_NAME.to_string())
}

pub fn app_data_dir() -> Result<PathBuf, String> {
    let home_dir = dirs::home_dir().ok_or_else(|| "failed to resolve home dir".to_string())?;

    let dotdir_name = resolve_dotdir_name(std::env::var(APP_DOTDIR_NAME_ENV).ok());

    let dir = home_dir.join(dotdir_name);
    std::fs::create_dir_all(&dir).map_err(|e| format!("failed to create app dir: {e}"))?;

    Ok(dir)
}
