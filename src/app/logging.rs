//! Usage: Logging bootstrap (stderr + daily rolling file under `<app data>/logs`, `log` bridge).

use crate::shared::mutex_ext::MutexExt;
use std::path::Path;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "chat-stream.log";
// Terminal output shares stderr with notices; keep it quiet unless RUST_LOG asks otherwise.
const STDERR_DEFAULT_LEVEL: &str = "warn";

static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

fn crate_filter(level: &str) -> String {
    format!("warn,chat_stream_lib={level},chat_stream={level}")
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(crate_filter(level)))
}

/// Installs the global subscriber once; later calls are ignored.
pub(crate) fn init(app_dir: Option<&Path>, level: &str) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(STDERR_DEFAULT_LEVEL));

    let file_layer = app_dir.and_then(|dir| {
        let log_dir = dir.join(LOG_DIR_NAME);
        if let Err(err) = std::fs::create_dir_all(&log_dir) {
            eprintln!("无法创建日志目录 {}: {err}", log_dir.display());
            return None;
        }
        let mut slot = FILE_GUARD.lock_or_recover();
        if slot.is_some() {
            return None;
        }
        let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        *slot = Some(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(level)),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    if let Err(err) = tracing_log::LogTracer::init() {
        tracing::debug!("log 桥接初始化失败: {}", err);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = level,
        "日志系统已初始化"
    );
}

/// Flushes the file writer. Call before `process::exit`, which skips destructors.
pub(crate) fn shutdown() {
    drop(FILE_GUARD.lock_or_recover().take());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_filter_targets_both_crate_names() {
        let filter = crate_filter("debug");
        assert_eq!(filter, "warn,chat_stream_lib=debug,chat_stream=debug");
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}
