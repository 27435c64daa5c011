use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, AbortHandle};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::ReservationEngine;
use crate::model::Ms;
use crate::observability::PENDING_TIMERS_ACTIVE;
use crate::wal::WalRepository;

/// One cancellable sleep per Pending reservation. A fired timer only reports the id;
/// the engine decides whether there is still anything to expire.
pub struct PendingTimers {
    handles: Arc<DashMap<Ulid, AbortHandle>>,
    expired_tx: mpsc::UnboundedSender<Ulid>,
}

impl PendingTimers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Ulid>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let timers = Self {
            handles: Arc::new(DashMap::new()),
            expired_tx,
        };
        (timers, expired_rx)
    }

    /// Fire `id` after `delay_ms`. Re-arming replaces the previous timer.
    pub fn arm(&self, id: Ulid, delay_ms: Ms) {
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        let tx = self.expired_tx.clone();
        let handles = self.handles.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let timer = tokio::spawn(async move {
            // Wait until our handle is registered so the removal below sees it.
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            if remove_own(&handles, &id, task::id()) {
                metrics::gauge!(PENDING_TIMERS_ACTIVE).decrement(1.0);
            }
            let _ = tx.send(id);
        });
        if let Some(previous) = self.handles.insert(id, timer.abort_handle()) {
            previous.abort();
            metrics::gauge!(PENDING_TIMERS_ACTIVE).decrement(1.0);
        }
        metrics::gauge!(PENDING_TIMERS_ACTIVE).increment(1.0);
        let _ = armed_tx.send(());
    }

    /// Stop the timer for `id`. Unknown ids are ignored.
    pub fn disarm(&self, id: &Ulid) -> bool {
        match self.handles.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                metrics::gauge!(PENDING_TIMERS_ACTIVE).decrement(1.0);
                true
            }
            None => false,
        }
    }

    pub fn armed(&self) -> usize {
        self.handles.len()
    }

    pub fn is_armed(&self, id: &Ulid) -> bool {
        self.handles.contains_key(id)
    }
}

/// Drop the entry for `id` only if it still belongs to task `own`; a re-armed or
/// disarmed timer has already been accounted for.
fn remove_own(handles: &DashMap<Ulid, AbortHandle>, id: &Ulid, own: task::Id) -> bool {
    handles.remove_if(id, |_, handle| handle.id() == own).is_some()
}

/// Expire Pending reservations as their timers fire. Exits once the engine is dropped.
pub async fn run_expiry_loop(engine: Weak<ReservationEngine>, mut expired: mpsc::UnboundedReceiver<Ulid>) {
    while let Some(id) = expired.recv().await {
        let Some(engine) = engine.upgrade() else { break };
        match engine.expire_pending(id).await {
            Ok(Some(_)) => info!("expired pending reservation {id}"),
            Ok(None) => debug!("expiry for {id} skipped: no longer pending"),
            Err(e) => warn!("expiry of {id} failed: {e}"),
        }
    }
}

/// Periodically complete every Confirmed reservation whose range has ended.
pub async fn run_completion_sweep(engine: Arc<ReservationEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.complete_due().await {
            Ok(0) => {}
            Ok(n) => info!("completion sweep finished {n} reservations"),
            Err(e) => warn!("completion sweep failed: {e}"),
        }
    }
}

/// Rewrite the WAL from current state once enough appends accumulated.
pub async fn run_compactor(repo: Arc<WalRepository>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = repo.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match repo.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fired_timer_reports_id_once() {
        let (timers, mut rx) = PendingTimers::new();
        let id = Ulid::new();
        timers.arm(id, 10);
        assert!(timers.is_armed(&id));
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(fired, Some(id));
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test]
    async fn disarmed_timer_never_fires() {
        let (timers, mut rx) = PendingTimers::new();
        let id = Ulid::new();
        timers.arm(id, 20);
        assert!(timers.disarm(&id));
        assert!(!timers.disarm(&id));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let (timers, mut rx) = PendingTimers::new();
        let id = Ulid::new();
        timers.arm(id, 20);
        timers.arm(id, 10_000);
        assert_eq!(timers.armed(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        timers.disarm(&id);
    }

    #[tokio::test]
    async fn stale_task_leaves_newer_handle_alone() {
        let handles = DashMap::new();
        let id = Ulid::new();
        let stale = tokio::spawn(std::future::pending::<()>());
        let current = tokio::spawn(std::future::pending::<()>());
        handles.insert(id, current.abort_handle());

        assert!(!remove_own(&handles, &id, stale.id()));
        assert!(handles.contains_key(&id));
        assert!(!remove_own(&handles, &Ulid::new(), current.id()));
        assert!(remove_own(&handles, &id, current.id()));
        assert!(handles.is_empty());

        stale.abort();
        current.abort();
    }
}
