//! Usage: Cancellation for one generation (idempotent handle, awaitable signal, slot + release guard).

use crate::shared::mutex_ext::MutexExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

static NEXT_ABORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct AbortHandle {
    id: u64,
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn pair() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        let handle = AbortHandle {
            id: NEXT_ABORT_ID.fetch_add(1, Ordering::Relaxed),
            tx: Arc::new(tx),
        };
        (handle, AbortSignal { rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` only for the call that actually flipped the flag.
    pub fn abort(&self) -> bool {
        self.tx.send_if_modified(|aborted| {
            if *aborted {
                return false;
            }
            *aborted = true;
            true
        })
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once aborted. Never resolves if every handle is dropped without aborting.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Holds the handle of the generation currently owned by a session controller.
#[derive(Debug, Default)]
pub struct AbortSlot {
    current: Mutex<Option<AbortHandle>>,
}

impl AbortSlot {
    /// Installs a fresh handle (replacing any previous one) and returns its release guard.
    pub fn install(self: &Arc<Self>) -> (AbortSlotGuard, AbortSignal) {
        let (handle, signal) = AbortHandle::pair();
        let id = handle.id();
        {
            let mut current = self.current.lock_or_recover();
            if let Some(previous) = current.replace(handle) {
                tracing::debug!(previous_id = previous.id(), "替换旧的中断句柄");
            }
        }
        (
            AbortSlotGuard {
                slot: Arc::clone(self),
                id,
            },
            signal,
        )
    }

    pub fn current(&self) -> Option<AbortHandle> {
        self.current.lock_or_recover().clone()
    }

    /// Aborts the active generation, if any. Safe to call repeatedly or after completion.
    pub fn abort(&self) -> bool {
        match self.current() {
            Some(handle) => handle.abort(),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.lock_or_recover().is_some()
    }
}

/// Clears the slot on drop, unless a newer generation has replaced the handle meanwhile.
pub struct AbortSlotGuard {
    slot: Arc<AbortSlot>,
    id: u64,
}

impl Drop for AbortSlotGuard {
    fn drop(&mut self) {
        let mut current = self.slot.current.lock_or_recover();
        if current.as_ref().is_some_and(|h| h.id() == self.id) {
            *current = None;
        }
    }
}
