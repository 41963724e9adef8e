//! Usage: Best-effort cleanup on exit (abort the running generation, wait briefly for it to finalize).

use crate::stream::session::AbortSlot;
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Returns `true` when nothing is left running, `false` if the wait timed out.
pub(crate) async fn abort_and_wait(slot: &AbortSlot) -> bool {
    if !slot.is_active() {
        return true;
    }
    if slot.abort() {
        tracing::info!("退出清理：已中断正在进行的生成");
    }

    let wait_idle = async {
        while slot.is_active() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    if tokio::time::timeout(STOP_TIMEOUT, wait_idle).await.is_err() {
        tracing::warn!("退出清理：等待中断响应保存超时");
        return false;
    }
    true
}
