//! Rate-limited, ordered delivery of streaming text.
//!
//! Agents emit text far faster than a chat card can be edited. The sink keeps
//! at most one pending value (the newest) and a single worker delivers it no
//! more than once per interval. Because one worker performs every delivery,
//! delivery N+1 cannot start before delivery N has returned.
//!
//! `push` only swaps the pending value and wakes the worker, so a slow
//! downstream never stalls the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default minimum gap between deliveries.
pub const DEFAULT_THROTTLE_MS: u64 = 1500;

/// Downstream that receives throttled text.
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    async fn deliver(&self, text: String) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Slot {
    pending: Option<String>,
    closing: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Shared {
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut slot)
    }
}

/// Coalescing, serialized delivery queue for one task.
pub struct ThrottledSink {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThrottledSink {
    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(target: Arc<dyn Deliver>, interval: Duration) -> Self {
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), target, interval));
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Offer the newest text. Replaces any value still waiting for its slot.
    pub fn push(&self, text: impl Into<String>) {
        let text = text.into();
        self.shared.with_slot(|slot| slot.pending = Some(text));
        self.shared.notify.notify_one();
    }

    /// Deliver whatever is pending right away and wait until every delivery
    /// has completed.
    pub async fn drain(mut self) {
        self.shared.with_slot(|slot| slot.closing = true);
        self.shared.notify.notify_one();
        self.join().await;
    }

    /// Drop the pending value and wait for an in-flight delivery to finish.
    /// Nothing is delivered after this returns.
    pub async fn discard(mut self) {
        self.shared.with_slot(|slot| {
            slot.pending = None;
            slot.closing = true;
        });
        self.shared.notify.notify_one();
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            warn!("Delivery worker ended abnormally: {}", e);
        }
    }
}

impl Drop for ThrottledSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shared.with_slot(|slot| {
                slot.pending = None;
                slot.closing = true;
            });
            self.shared.notify.notify_one();
        }
    }
}

async fn run_worker(shared: Arc<Shared>, target: Arc<dyn Deliver>, interval: Duration) {
    let mut last_delivery: Option<Instant> = None;
    let mut delivered = 0usize;

    loop {
        let (has_pending, closing) =
            shared.with_slot(|slot| (slot.pending.is_some(), slot.closing));

        if !has_pending {
            if closing {
                break;
            }
            shared.notify.notified().await;
            continue;
        }

        // Wait out the window unless we are flushing for shutdown. New pushes
        // wake us early only to re-check; the deadline stays put.
        if !closing
            && let Some(due) = last_delivery.map(|at| at + interval)
            && Instant::now() < due
        {
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {}
                _ = shared.notify.notified() => continue,
            }
        }

        let Some(text) = shared.with_slot(|slot| slot.pending.take()) else {
            continue;
        };
        last_delivery = Some(Instant::now());
        delivered += 1;
        if let Err(e) = target.deliver(text).await {
            warn!("Delivery failed, continuing with the next update: {:?}", e);
        }
    }

    debug!("Delivery worker finished after {} deliveries", delivered);
}
