//! Usage: Infrastructure adapters (filesystem paths, settings, SQLite persistence, chat server HTTP).

pub(crate) mod app_paths;
pub(crate) mod chat_api;
pub(crate) mod db;
pub(crate) mod pending_store;
pub(crate) mod preferences;
pub(crate) mod settings;
