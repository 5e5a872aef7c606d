//! Worker pool: slot registry and request routing
//!
//! Requests are spread round-robin over live workers. A request that
//! hits a worker whose mailbox just closed was never delivered, so it
//! is retried on the next one.

use crate::{
    types::{Account, AccountId, Currency, ExchangeOutcome, ExchangeRequest, LogEntry, Rate, WorkerId},
    worker::WorkerHandle,
    writer::WriterAssignment,
    Error, Result,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Spawned, not serving yet
    Starting,
    /// Serving requests
    Running,
    /// Exited unexpectedly, restart scheduled
    Exited,
    /// Restart budget exhausted
    Failed,
    /// Stopped by the operator
    Stopped,
}

/// Status of one slot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Current incarnation
    pub id: WorkerId,
    /// Slot state
    pub state: SlotState,
    /// Restarts since launch
    pub restarts: u32,
    /// Whether this incarnation holds the writer role
    pub is_writer: bool,
}

/// Status of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Current writer
    pub writer: Option<WorkerId>,
    /// Writer-assignment epoch
    pub epoch: u64,
    /// Per-slot status
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    /// A writer is assigned and at least one worker is serving
    pub fn is_healthy(&self) -> bool {
        self.writer.is_some()
            && self
                .workers
                .iter()
                .any(|worker| worker.state == SlotState::Running)
    }

    /// Number of workers reporting the writer role
    pub fn writer_count(&self) -> usize {
        self.workers.iter().filter(|worker| worker.is_writer).count()
    }
}

#[derive(Debug)]
struct Slot {
    id: WorkerId,
    handle: Option<WorkerHandle>,
    state: SlotState,
}

impl Slot {
    fn is_live(&self) -> bool {
        matches!(self.state, SlotState::Starting | SlotState::Running)
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: RwLock<Vec<Slot>>,
    assignment: Arc<WriterAssignment>,
    next: AtomicUsize,
}

/// Cloneable view of the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Pool of `size` empty slots
    pub fn new(size: usize, assignment: Arc<WriterAssignment>) -> Self {
        let slots = (0..size)
            .map(|slot| Slot {
                id: WorkerId::new(slot, 0),
                handle: None,
                state: SlotState::Starting,
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                slots: RwLock::new(slots),
                assignment,
                next: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Register a freshly spawned incarnation
    pub(crate) fn install(&self, id: WorkerId, handle: WorkerHandle) {
        let mut slots = self.inner.slots.write();
        if let Some(slot) = slots.get_mut(id.slot) {
            *slot = Slot {
                id,
                handle: Some(handle),
                state: SlotState::Starting,
            };
        }
    }

    /// Update a slot, ignoring stale incarnations; returns whether it applied
    pub(crate) fn set_state(&self, id: WorkerId, state: SlotState) -> bool {
        let mut slots = self.inner.slots.write();
        match slots.get_mut(id.slot) {
            Some(slot) if slot.id == id => {
                slot.state = state;
                if !slot.is_live() {
                    slot.handle = None;
                }
                true
            }
            _ => false,
        }
    }

    /// Current incarnation of a slot
    pub fn current(&self, slot: usize) -> Option<WorkerId> {
        self.inner.slots.read().get(slot).map(|slot| slot.id)
    }

    /// State of a slot
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.inner.slots.read().get(slot).map(|slot| slot.state)
    }

    /// Handle of `id`, if that incarnation is still live
    pub fn handle_of(&self, id: WorkerId) -> Option<WorkerHandle> {
        let slots = self.inner.slots.read();
        slots
            .get(id.slot)
            .filter(|slot| slot.id == id && slot.is_live())
            .and_then(|slot| slot.handle.clone())
    }

    /// Live worker to promote: lowest running slot, else lowest starting one
    pub(crate) fn promotion_candidate(&self, exclude_slot: usize) -> Option<WorkerId> {
        let slots = self.inner.slots.read();
        let eligible = |state| {
            slots
                .iter()
                .enumerate()
                .find(|(index, slot)| {
                    *index != exclude_slot && slot.state == state && slot.handle.is_some()
                })
                .map(|(_, slot)| slot.id)
        };
        eligible(SlotState::Running).or_else(|| eligible(SlotState::Starting))
    }

    /// Whether every slot has exhausted its restart budget
    pub(crate) fn all_failed(&self) -> bool {
        self.inner
            .slots
            .read()
            .iter()
            .all(|slot| slot.state == SlotState::Failed)
    }

    /// Handles of every live worker
    pub(crate) fn live_handles(&self) -> Vec<WorkerHandle> {
        self.inner
            .slots
            .read()
            .iter()
            .filter(|slot| slot.is_live())
            .filter_map(|slot| slot.handle.clone())
            .collect()
    }

    /// Pool status snapshot
    pub fn status(&self) -> PoolStatus {
        let record = self.inner.assignment.current();
        let workers = self
            .inner
            .slots
            .read()
            .iter()
            .map(|slot| WorkerStatus {
                id: slot.id,
                state: slot.state,
                restarts: slot.id.incarnation,
                is_writer: record.writer == Some(slot.id),
            })
            .collect();

        PoolStatus {
            writer: record.writer,
            epoch: record.epoch,
            workers,
        }
    }

    fn next_worker(&self) -> Result<WorkerHandle> {
        let live = self.live_handles();
        if live.is_empty() {
            return Err(Error::Concurrency("No live worker in the pool".to_string()));
        }
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[index].clone())
    }

    async fn route<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(WorkerHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.size().max(1);
        let mut last_error = None;

        for _ in 0..attempts {
            let handle = self.next_worker()?;
            match op(handle).await {
                Err(Error::MailboxClosed(id)) => {
                    tracing::debug!(worker = %id, "Skipping exited worker");
                    last_error = Some(Error::MailboxClosed(id));
                }
                other => return other,
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Concurrency("No live worker in the pool".to_string())))
    }

    /// All accounts
    pub async fn get_accounts(&self) -> Result<BTreeMap<AccountId, Account>> {
        self.route(|worker| async move { worker.get_accounts().await })
            .await
    }

    /// All rates
    pub async fn get_rates(&self) -> Result<Vec<Rate>> {
        self.route(|worker| async move { worker.get_rates().await })
            .await
    }

    /// Full log
    pub async fn get_log(&self) -> Result<Vec<LogEntry>> {
        self.route(|worker| async move { worker.get_log().await })
            .await
    }

    /// Set an account balance
    pub async fn set_account_balance(
        &self,
        account_id: AccountId,
        balance: Decimal,
        currency: Option<Currency>,
    ) -> Result<Account> {
        self.route(|worker| {
            let account_id = account_id.clone();
            let currency = currency.clone();
            async move {
                worker
                    .set_account_balance(account_id, balance, currency)
                    .await
            }
        })
        .await
    }

    /// Set a rate
    pub async fn set_rate(
        &self,
        base_currency: Currency,
        counter_currency: Currency,
        rate: Decimal,
    ) -> Result<Rate> {
        self.route(|worker| {
            let base_currency = base_currency.clone();
            let counter_currency = counter_currency.clone();
            async move { worker.set_rate(base_currency, counter_currency, rate).await }
        })
        .await
    }

    /// Execute an exchange
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeOutcome> {
        self.route(|worker| {
            let request = request.clone();
            async move { worker.exchange(request).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(id: WorkerId) -> (WorkerHandle, mpsc::Receiver<crate::worker::WorkerMessage>) {
        let (tx, rx) = mpsc::channel(1);
        (WorkerHandle::new(id, tx), rx)
    }

    #[test]
    fn test_stale_incarnation_updates_are_ignored() {
        let pool = WorkerPool::new(2, Arc::new(WriterAssignment::new()));
        let (h0, _rx0) = handle(WorkerId::new(0, 0));
        pool.install(WorkerId::new(0, 0), h0);
        let (h1, _rx1) = handle(WorkerId::new(0, 1));
        pool.install(WorkerId::new(0, 1), h1);

        assert!(!pool.set_state(WorkerId::new(0, 0), SlotState::Exited));
        assert_eq!(pool.state(0), Some(SlotState::Starting));
        assert!(pool.handle_of(WorkerId::new(0, 0)).is_none());
        assert!(pool.handle_of(WorkerId::new(0, 1)).is_some());
    }

    #[test]
    fn test_promotion_candidate_prefers_running() {
        let pool = WorkerPool::new(3, Arc::new(WriterAssignment::new()));
        let mut receivers = Vec::new();
        for slot in 0..3 {
            let (h, rx) = handle(WorkerId::new(slot, 0));
            pool.install(WorkerId::new(slot, 0), h);
            receivers.push(rx);
        }
        pool.set_state(WorkerId::new(2, 0), SlotState::Running);

        assert_eq!(pool.promotion_candidate(0), Some(WorkerId::new(2, 0)));
        assert_eq!(pool.promotion_candidate(2), Some(WorkerId::new(0, 0)));
    }

    #[test]
    fn test_status_reports_single_writer() {
        let assignment = Arc::new(WriterAssignment::new());
        let pool = WorkerPool::new(2, assignment.clone());
        let (h0, _rx0) = handle(WorkerId::new(0, 0));
        pool.install(WorkerId::new(0, 0), h0);
        pool.set_state(WorkerId::new(0, 0), SlotState::Running);
        assert!(!pool.status().is_healthy());

        assignment.promote(0, WorkerId::new(0, 0)).unwrap();
        let status = pool.status();
        assert!(status.is_healthy());
        assert_eq!(status.writer_count(), 1);
    }

    #[tokio::test]
    async fn test_routing_without_workers_fails() {
        let pool = WorkerPool::new(1, Arc::new(WriterAssignment::new()));
        assert!(pool.get_accounts().await.is_err());
    }
}
