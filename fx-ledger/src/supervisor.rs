//! Worker supervisor
//!
//! Owns the pool lifecycle and is the only component that changes the
//! writer assignment.
//!
//! ```text
//!   Starting ──► Running ──► Exited ──(backoff)──► Starting
//!                   │           │
//!                   │           └──(budget spent)──► Failed
//!                   └──(shutdown)──► Stopped
//! ```
//!
//! When the writer exits, its role is revoked, the shared store is
//! reloaded from the last durable snapshot, and one live worker is
//! promoted. Mutations routed in the meantime wait for the promotion
//! (bounded by the forward timeout).

use crate::{
    config::Config,
    engine::ExchangeEngine,
    persistence::PersistenceCoordinator,
    pool::{PoolStatus, SlotState, WorkerPool},
    restart::RestartPolicy,
    store::LedgerStore,
    types::WorkerId,
    worker::{Worker, WorkerContext, WorkerExit, WorkerHandle},
    Error, Result,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// Operator commands
#[derive(Debug)]
enum Command {
    Terminate {
        slot: usize,
        response: oneshot::Sender<Result<WorkerId>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Worker supervisor
#[derive(Debug)]
pub struct Supervisor {
    config: Config,
    store: Arc<LedgerStore>,
    persistence: Arc<PersistenceCoordinator>,
    pool: WorkerPool,
    workers: JoinSet<(WorkerId, WorkerExit)>,
    restarts: JoinSet<usize>,
    policies: Vec<RestartPolicy>,
    commands: mpsc::Receiver<Command>,
    stopping: bool,
}

/// Start the pool: load the durable state, assign the initial writer,
/// spawn every worker and the supervision loop.
///
/// Must be called from within a Tokio runtime. The returned join handle
/// resolves when the supervisor stops: `Ok` after [`SupervisorHandle::shutdown`],
/// [`Error::RestartBudgetExhausted`] when every slot has failed.
pub fn start(config: Config) -> Result<(SupervisorHandle, JoinHandle<Result<()>>)> {
    config.validate()?;

    let persistence = Arc::new(PersistenceCoordinator::new(&config));
    let store = Arc::new(LedgerStore::from_state(persistence.load_snapshot()?));
    let pool = WorkerPool::new(
        config.supervisor.pool_size,
        persistence.assignment().clone(),
    );
    let (tx, rx) = mpsc::channel(16);

    let mut supervisor = Supervisor {
        policies: (0..config.supervisor.pool_size)
            .map(|_| RestartPolicy::new(config.supervisor.restart.clone()))
            .collect(),
        config,
        store: store.clone(),
        persistence: persistence.clone(),
        pool: pool.clone(),
        workers: JoinSet::new(),
        restarts: JoinSet::new(),
        commands: rx,
        stopping: false,
    };

    let writer = WorkerId::new(supervisor.config.supervisor.initial_writer, 0);
    let epoch = persistence.assignment().current().epoch;
    persistence.assignment().promote(epoch, writer)?;

    for slot in 0..supervisor.config.supervisor.pool_size {
        supervisor.spawn_worker(WorkerId::new(slot, 0));
    }

    tracing::info!(
        pool_size = supervisor.config.supervisor.pool_size,
        writer = %writer,
        snapshot = ?persistence.snapshot_path(),
        "Supervisor started"
    );

    let task = tokio::spawn(supervisor.run());
    let handle = SupervisorHandle {
        pool,
        store,
        persistence,
        commands: tx,
    };

    Ok((handle, task))
}

impl Supervisor {
    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => match command {
                    Command::Shutdown { response } => {
                        self.shutdown().await;
                        let _ = response.send(());
                        return Ok(());
                    }
                    Command::Terminate { slot, response } => {
                        let _ = response.send(self.terminate(slot).await);
                    }
                },

                Some(joined) = self.workers.join_next() => {
                    let (id, exit) = joined.map_err(|e| Error::Concurrency(e.to_string()))?;
                    if let Err(e) = self.handle_exit(id, exit) {
                        self.shutdown().await;
                        return Err(e);
                    }
                }

                Some(joined) = self.restarts.join_next() => {
                    let slot = joined.map_err(|e| Error::Concurrency(e.to_string()))?;
                    self.restart(slot);
                }

                else => return Ok(()),
            }
        }
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            engine: ExchangeEngine::new(self.store.clone()),
            persistence: self.persistence.clone(),
            pool: self.pool.clone(),
            batching: self.config.batching.clone(),
            forward_timeout: self.config.supervisor.forward_timeout(),
        }
    }

    fn spawn_worker(&mut self, id: WorkerId) {
        let (tx, rx) = mpsc::channel(self.config.supervisor.mailbox_capacity);
        self.pool.install(id, WorkerHandle::new(id, tx));

        let worker = Worker::new(id, self.context(), rx);
        let task = tokio::spawn(worker.run());

        // The outer task survives a worker panic and reports which worker it was
        self.workers.spawn(async move {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) => WorkerExit::Panicked(panic_message(e)),
            };
            (id, exit)
        });

        tracing::debug!(worker = %id, "Worker spawned");
    }

    fn handle_exit(&mut self, id: WorkerId, exit: WorkerExit) -> Result<()> {
        if self.stopping || !exit.is_crash() {
            self.pool.set_state(id, SlotState::Stopped);
            return Ok(());
        }

        tracing::warn!(worker = %id, exit = ?exit, "Worker exited");
        self.pool.set_state(id, SlotState::Exited);

        if self.persistence.assignment().revoke(id).is_some() {
            self.recover_writer(id.slot)?;
        }

        match self.policies[id.slot].next_restart(Instant::now()) {
            Some(delay) => {
                tracing::info!(slot = id.slot, ?delay, "Restart scheduled");
                let slot = id.slot;
                self.restarts.spawn(async move {
                    tokio::time::sleep(delay).await;
                    slot
                });
            }
            None => {
                tracing::error!(
                    slot = id.slot,
                    max_restarts = self.config.supervisor.restart.max_restarts,
                    window_secs = self.config.supervisor.restart.window_secs,
                    "Restart budget exhausted, slot failed"
                );
                self.pool.set_state(id, SlotState::Failed);
                if self.pool.all_failed() {
                    tracing::error!("Every worker slot failed, supervisor giving up");
                    return Err(Error::RestartBudgetExhausted(id.slot));
                }
            }
        }

        Ok(())
    }

    /// Reload the durable state and hand the writer role to a live worker.
    ///
    /// With no live worker the role stays vacant until the next restart
    /// takes it.
    fn recover_writer(&mut self, lost_slot: usize) -> Result<()> {
        let state = self.persistence.load_snapshot().map_err(|e| {
            tracing::error!(error = %e, "Cannot reload snapshot after writer loss");
            e
        })?;
        self.store.restore(state);

        match self.pool.promotion_candidate(lost_slot) {
            Some(candidate) => {
                let epoch = self.persistence.assignment().current().epoch;
                self.persistence.assignment().promote(epoch, candidate)?;
                tracing::info!(writer = %candidate, "Writer promoted");
            }
            None => {
                tracing::warn!(lost_slot, "No live worker to promote, waiting for a restart");
            }
        }

        Ok(())
    }

    fn restart(&mut self, slot: usize) {
        if self.stopping || self.pool.state(slot) != Some(SlotState::Exited) {
            return;
        }

        let Some(previous) = self.pool.current(slot) else {
            return;
        };
        let id = WorkerId::new(slot, previous.incarnation + 1);

        let record = self.persistence.assignment().current();
        if record.writer.is_none() {
            if let Err(e) = self.persistence.assignment().promote(record.epoch, id) {
                tracing::warn!(worker = %id, error = %e, "Writer promotion lost a race");
            }
        }

        tracing::info!(worker = %id, "Restarting worker");
        self.spawn_worker(id);
    }

    async fn terminate(&mut self, slot: usize) -> Result<WorkerId> {
        let id = self
            .pool
            .current(slot)
            .ok_or_else(|| Error::Other(format!("No worker slot {}", slot)))?;
        let handle = self
            .pool
            .handle_of(id)
            .ok_or_else(|| Error::Other(format!("Worker {} is not running", id)))?;

        handle.terminate().await?;
        Ok(id)
    }

    async fn shutdown(&mut self) {
        self.stopping = true;
        self.restarts.abort_all();

        for handle in self.pool.live_handles() {
            if let Err(e) = handle.shutdown().await {
                tracing::debug!(worker = %handle.id(), error = %e, "Worker already gone");
            }
        }

        while let Some(joined) = self.workers.join_next().await {
            if let Ok((id, _)) = joined {
                self.pool.set_state(id, SlotState::Stopped);
            }
        }

        for slot in 0..self.pool.size() {
            if let Some(id) = self.pool.current(slot) {
                if self.pool.state(slot) != Some(SlotState::Failed) {
                    self.pool.set_state(id, SlotState::Stopped);
                }
                self.persistence.assignment().revoke(id);
            }
        }

        tracing::info!("Supervisor stopped");
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }

    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a running supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pool: WorkerPool,
    store: Arc<LedgerStore>,
    persistence: Arc<PersistenceCoordinator>,
    commands: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    /// Request router over the live workers
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Shared store
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Persistence coordinator
    pub fn persistence(&self) -> &Arc<PersistenceCoordinator> {
        &self.persistence
    }

    /// Writer, epoch and per-slot status
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Kill the worker in `slot` as a crash would; returns the killed incarnation
    pub async fn terminate(&self, slot: usize) -> Result<WorkerId> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Terminate { slot, response: tx })
            .await
            .map_err(|_| Error::Concurrency("Supervisor stopped".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Supervisor stopped".to_string()))?
    }

    /// Stop every worker, flushing the writer's pending batch
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Supervisor stopped".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Supervisor stopped".to_string()))
    }
}
