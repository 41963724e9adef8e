//! Usage: Run blocking work (SQLite, filesystem) on tokio's blocking pool with a labelled join error.

pub(crate) async fn run<T, F>(label: &'static str, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(label = label, "阻塞任务执行失败: {}", err);
            Err(format!("TASK_JOIN: {label}: {err}"))
        }
    }
}
