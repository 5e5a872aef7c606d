//! Worker instances
//!
//! Each worker is a Tokio actor with a bounded mailbox. All workers
//! share one [`LedgerStore`](crate::store::LedgerStore); reads are
//! answered locally by whichever worker receives them. Mutations only
//! ever run inside the current writer:
//!
//! ```text
//!   caller ──► WorkerHandle ──mpsc──► Worker (non-writer)
//!                                        │ forward (bounded by forward_timeout)
//!                                        ▼
//!                                     Worker (writer)
//!                                        │ apply under the store lock
//!                                        │ persist (or batch)
//!                                        ▼
//!                                      reply
//! ```
//!
//! A persistence fault ends the writer's run loop; the supervisor takes
//! over from there.

use crate::{
    config::BatchingConfig,
    engine::ExchangeEngine,
    persistence::PersistenceCoordinator,
    pool::{SlotState, WorkerPool},
    types::{Account, AccountId, Currency, ExchangeOutcome, ExchangeRequest, LogEntry, Rate, WorkerId},
    Error, Result,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant};

/// State-changing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Upsert an account balance
    SetBalance {
        /// Target account
        account_id: AccountId,
        /// New balance
        balance: Decimal,
        /// Currency, required when the account is new
        currency: Option<Currency>,
    },
    /// Upsert a rate
    SetRate {
        /// Currency converted from
        base_currency: Currency,
        /// Currency converted to
        counter_currency: Currency,
        /// Multiplier
        rate: Decimal,
    },
    /// Two-leg exchange
    Exchange(ExchangeRequest),
}

impl Mutation {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::SetBalance { .. } => "set-balance",
            Mutation::SetRate { .. } => "set-rate",
            Mutation::Exchange(_) => "exchange",
        }
    }

    fn apply(&self, engine: &ExchangeEngine) -> Result<MutationResult> {
        let store = engine.store();
        match self {
            Mutation::SetBalance {
                account_id,
                balance,
                currency,
            } => store
                .set_account_balance(account_id, *balance, currency.as_ref())
                .map(MutationResult::Account),
            Mutation::SetRate {
                base_currency,
                counter_currency,
                rate,
            } => store
                .set_rate(base_currency, counter_currency, *rate)
                .map(MutationResult::Rate),
            Mutation::Exchange(request) => Ok(MutationResult::Exchange(engine.exchange(request))),
        }
    }
}

/// Result of an applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationResult {
    /// Updated account
    Account(Account),
    /// Stored rate
    Rate(Rate),
    /// Exchange outcome (domain failures included)
    Exchange(ExchangeOutcome),
}

fn unexpected(result: MutationResult) -> Error {
    Error::Other(format!("Unexpected mutation result: {:?}", result))
}

/// Message sent to a worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Read all accounts
    GetAccounts {
        /// Reply channel
        response: oneshot::Sender<BTreeMap<AccountId, Account>>,
    },

    /// Read all rates
    GetRates {
        /// Reply channel
        response: oneshot::Sender<Vec<Rate>>,
    },

    /// Read the log
    GetLog {
        /// Reply channel
        response: oneshot::Sender<Vec<LogEntry>>,
    },

    /// Apply a mutation (or route it to the writer)
    Mutate {
        /// What to change
        mutation: Mutation,
        /// Set when another worker routed this here; never re-routed
        forwarded: bool,
        /// Reply channel
        response: oneshot::Sender<Result<MutationResult>>,
    },

    /// Persist pending batched mutations now
    Flush {
        /// Reply channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Stop without flushing, as a crash would
    Terminate,

    /// Flush and stop
    Shutdown,
}

/// Why a worker's run loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Operator shutdown
    Shutdown,
    /// Killed through [`WorkerHandle::terminate`]
    Terminated,
    /// The writer could not persist
    PersistenceFault(String),
    /// The task panicked
    Panicked(String),
    /// Every sender was dropped
    MailboxClosed,
}

impl WorkerExit {
    /// Whether the supervisor should treat this as a crash
    pub fn is_crash(&self) -> bool {
        !matches!(self, WorkerExit::Shutdown)
    }
}

/// What every worker incarnation shares
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Engine over the shared store
    pub engine: ExchangeEngine,
    /// Snapshot writer and writer-role record
    pub persistence: Arc<PersistenceCoordinator>,
    /// Pool used to reach the writer
    pub pool: WorkerPool,
    /// Batching settings
    pub batching: BatchingConfig,
    /// Bound on a routed mutation
    pub forward_timeout: Duration,
}

/// One worker instance
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    ctx: WorkerContext,
    mailbox: mpsc::Receiver<WorkerMessage>,
    /// Mutations applied but not yet persisted (batching only)
    pending: usize,
}

impl Worker {
    /// Create a worker
    pub fn new(id: WorkerId, ctx: WorkerContext, mailbox: mpsc::Receiver<WorkerMessage>) -> Self {
        Self {
            id,
            ctx,
            mailbox,
            pending: 0,
        }
    }

    fn is_writer(&self) -> bool {
        self.ctx.persistence.is_writer(self.id)
    }

    /// Run the worker event loop until it stops or faults
    pub async fn run(mut self) -> WorkerExit {
        if self.is_writer() && !self.ctx.persistence.snapshot_exists() {
            if let Err(e) = self.persist_now() {
                tracing::error!(worker = %self.id, error = %e, "Initial snapshot failed");
                return WorkerExit::PersistenceFault(e.to_string());
            }
        }

        self.ctx.pool.set_state(self.id, SlotState::Running);
        tracing::info!(worker = %self.id, writer = self.is_writer(), "Worker running");

        let batch_timeout = Duration::from_millis(self.ctx.batching.batch_timeout_ms.max(1));
        let mut batch_timer = interval_at(Instant::now() + batch_timeout, batch_timeout);
        batch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(WorkerMessage::Shutdown) => {
                        if let Err(e) = self.flush() {
                            tracing::error!(worker = %self.id, error = %e, "Flush on shutdown failed");
                        }
                        tracing::info!(worker = %self.id, "Worker stopped");
                        return WorkerExit::Shutdown;
                    }
                    Some(WorkerMessage::Terminate) => {
                        tracing::warn!(worker = %self.id, pending = self.pending, "Worker terminated");
                        return WorkerExit::Terminated;
                    }
                    Some(msg) => match self.handle_message(msg) {
                        Err(e) if e.is_persistence_fault() => {
                            tracing::error!(worker = %self.id, error = %e, "Persistence fault, stopping worker");
                            return WorkerExit::PersistenceFault(e.to_string());
                        }
                        Err(e) => tracing::warn!(worker = %self.id, error = %e, "Message failed"),
                        Ok(()) => {}
                    },
                    None => {
                        let _ = self.flush();
                        return WorkerExit::MailboxClosed;
                    }
                },

                _ = batch_timer.tick(), if self.pending > 0 => {
                    if let Err(e) = self.flush() {
                        tracing::error!(worker = %self.id, error = %e, "Batch flush failed, stopping worker");
                        return WorkerExit::PersistenceFault(e.to_string());
                    }
                }
            }
        }
    }

    /// Handle a single message; errors are returned only for faults the
    /// run loop has to classify
    fn handle_message(&mut self, msg: WorkerMessage) -> Result<()> {
        let store = self.ctx.engine.store();
        match msg {
            WorkerMessage::GetAccounts { response } => {
                let _ = response.send(store.get_accounts());
            }

            WorkerMessage::GetRates { response } => {
                let _ = response.send(store.get_rates());
            }

            WorkerMessage::GetLog { response } => {
                let _ = response.send(store.get_log());
            }

            WorkerMessage::Mutate {
                mutation,
                forwarded,
                response,
            } => return self.handle_mutation(mutation, forwarded, response),

            WorkerMessage::Flush { response } => {
                let result = self.flush();
                let failed = result.as_ref().err().map(|e| e.to_string());
                let _ = response.send(result);
                if let Some(reason) = failed {
                    return Err(Error::Persistence(reason));
                }
            }

            WorkerMessage::Terminate | WorkerMessage::Shutdown => {
                // Handled in the run loop
            }
        }

        Ok(())
    }

    fn handle_mutation(
        &mut self,
        mutation: Mutation,
        forwarded: bool,
        response: oneshot::Sender<Result<MutationResult>>,
    ) -> Result<()> {
        if response.is_closed() {
            tracing::warn!(worker = %self.id, kind = mutation.kind(), forwarded, "Caller gave up, mutation dropped");
            return Ok(());
        }

        if self.is_writer() {
            let result = mutation.apply(&self.ctx.engine);
            return match self.commit() {
                Ok(()) => {
                    let _ = response.send(result);
                    Ok(())
                }
                Err(e) => {
                    let _ = response.send(Err(Error::WriterUnavailable(format!(
                        "{} could not persist {}",
                        self.id,
                        mutation.kind()
                    ))));
                    Err(e)
                }
            };
        }

        if forwarded {
            tracing::warn!(worker = %self.id, kind = mutation.kind(), "Forwarded mutation reached a non-writer");
            let _ = response.send(Err(Error::WriterUnavailable(format!(
                "{} no longer holds the writer role",
                self.id
            ))));
            return Ok(());
        }

        self.forward(mutation, response);
        Ok(())
    }

    /// Make an applied mutation durable (or count it towards the batch)
    fn commit(&mut self) -> Result<()> {
        if !self.ctx.batching.enabled {
            return self.persist_now();
        }

        self.pending += 1;
        if self.pending >= self.ctx.batching.max_batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }

        tracing::debug!(worker = %self.id, pending = self.pending, "Flushing batch");
        self.persist_now()?;
        self.pending = 0;
        Ok(())
    }

    fn persist_now(&self) -> Result<()> {
        let state = self.ctx.engine.store().snapshot();
        self.ctx.persistence.persist(self.id, &state)?;
        Ok(())
    }

    /// Route a mutation to the writer without blocking this worker
    fn forward(&self, mutation: Mutation, response: oneshot::Sender<Result<MutationResult>>) {
        let pool = self.ctx.pool.clone();
        let persistence = self.ctx.persistence.clone();
        let timeout = self.ctx.forward_timeout;
        let from = self.id;

        tokio::spawn(async move {
            let kind = mutation.kind();
            let routed = route_to_writer(&pool, &persistence, mutation);
            let result = match tokio::time::timeout(timeout, routed).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(worker = %from, kind, ?timeout, "No writer answered in time");
                    Err(Error::WriterUnavailable(format!(
                        "no writer answered within {:?}",
                        timeout
                    )))
                }
            };
            let _ = response.send(result);
        });
    }
}

async fn route_to_writer(
    pool: &WorkerPool,
    persistence: &PersistenceCoordinator,
    mutation: Mutation,
) -> Result<MutationResult> {
    let assignment = persistence.assignment();
    let mut min_epoch = 0;

    loop {
        let (writer, epoch) = assignment.wait_for_writer(min_epoch).await?;

        let Some(handle) = pool.handle_of(writer) else {
            // Promoted at spawn, handle not installed yet
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };

        match handle.forward(mutation.clone()).await {
            // Not delivered, or refused before being applied: wait for the next writer
            Err(Error::MailboxClosed(_)) | Err(Error::WriterUnavailable(_)) => {
                min_epoch = epoch + 1;
            }
            // The writer died with the mutation in flight
            Err(Error::Concurrency(reason)) => return Err(Error::WriterUnavailable(reason)),
            other => return other,
        }
    }
}

/// Handle for sending messages to a worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    sender: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// Create new handle
    pub fn new(id: WorkerId, sender: mpsc::Sender<WorkerMessage>) -> Self {
        Self { id, sender }
    }

    /// Worker this handle reaches
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the worker has exited
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| Error::MailboxClosed(self.id))?;

        rx.await
            .map_err(|_| Error::Concurrency(format!("{} dropped the response", self.id)))
    }

    /// All accounts
    pub async fn get_accounts(&self) -> Result<BTreeMap<AccountId, Account>> {
        self.request(|response| WorkerMessage::GetAccounts { response })
            .await
    }

    /// All rates
    pub async fn get_rates(&self) -> Result<Vec<Rate>> {
        self.request(|response| WorkerMessage::GetRates { response })
            .await
    }

    /// Full log
    pub async fn get_log(&self) -> Result<Vec<LogEntry>> {
        self.request(|response| WorkerMessage::GetLog { response })
            .await
    }

    /// Apply a mutation through this worker
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationResult> {
        self.request(|response| WorkerMessage::Mutate {
            mutation,
            forwarded: false,
            response,
        })
        .await?
    }

    pub(crate) async fn forward(&self, mutation: Mutation) -> Result<MutationResult> {
        self.request(|response| WorkerMessage::Mutate {
            mutation,
            forwarded: true,
            response,
        })
        .await?
    }

    /// Set an account balance
    pub async fn set_account_balance(
        &self,
        account_id: AccountId,
        balance: Decimal,
        currency: Option<Currency>,
    ) -> Result<Account> {
        match self
            .mutate(Mutation::SetBalance {
                account_id,
                balance,
                currency,
            })
            .await?
        {
            MutationResult::Account(account) => Ok(account),
            other => Err(unexpected(other)),
        }
    }

    /// Set a rate
    pub async fn set_rate(
        &self,
        base_currency: Currency,
        counter_currency: Currency,
        rate: Decimal,
    ) -> Result<Rate> {
        match self
            .mutate(Mutation::SetRate {
                base_currency,
                counter_currency,
                rate,
            })
            .await?
        {
            MutationResult::Rate(rate) => Ok(rate),
            other => Err(unexpected(other)),
        }
    }

    /// Execute an exchange
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeOutcome> {
        match self.mutate(Mutation::Exchange(request)).await? {
            MutationResult::Exchange(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Persist pending batched mutations now
    pub async fn flush(&self) -> Result<()> {
        self.request(|response| WorkerMessage::Flush { response })
            .await?
    }

    /// Stop the worker as a crash would, dropping any pending batch
    pub async fn terminate(&self) -> Result<()> {
        self.sender
            .send(WorkerMessage::Terminate)
            .await
            .map_err(|_| Error::MailboxClosed(self.id))
    }

    /// Flush and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(WorkerMessage::Shutdown)
            .await
            .map_err(|_| Error::MailboxClosed(self.id))
    }
}
