//! Integration tests for the supervised worker pool

use fx_ledger::{
    config::RestartConfig, AccountId, Config, Currency, Error, ErrorKind, ExchangeRequest,
    PersistenceCoordinator, SlotState, SupervisorHandle, WorkerId,
};
use rust_decimal::Decimal;
use std::path::Path;
use std::time::Duration;

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn test_config(dir: &Path, pool_size: usize) -> Config {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    };
    config.supervisor.pool_size = pool_size;
    config.supervisor.initial_writer = 0;
    config.supervisor.forward_timeout_ms = 2_000;
    config.supervisor.restart = RestartConfig {
        max_restarts: 5,
        window_secs: 60,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    config
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn seed_usd_ars(handle: &SupervisorHandle, a_balance: &str) {
    let pool = handle.pool();
    pool.set_account_balance(AccountId::new("A"), dec(a_balance), Some(Currency::new("USD")))
        .await
        .unwrap();
    pool.set_account_balance(AccountId::new("B"), Decimal::ZERO, Some(Currency::new("ARS")))
        .await
        .unwrap();
    pool.set_rate(Currency::new("USD"), Currency::new("ARS"), dec("1450"))
        .await
        .unwrap();
}

fn usd_to_ars(amount: &str) -> ExchangeRequest {
    ExchangeRequest {
        base_currency: Currency::new("USD"),
        counter_currency: Currency::new("ARS"),
        base_account_id: AccountId::new("A"),
        counter_account_id: AccountId::new("B"),
        base_amount: dec(amount),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exchange_scenarios_through_pool() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _task) = fx_ledger::start(test_config(dir.path(), 3)).unwrap();
    seed_usd_ars(&handle, "1000").await;
    let pool = handle.pool();

    let outcome = pool.exchange(usd_to_ars("100")).await.unwrap();
    assert!(outcome.is_ok());
    let accounts = pool.get_accounts().await.unwrap();
    assert_eq!(accounts[&AccountId::new("A")].balance, dec("900"));
    assert_eq!(accounts[&AccountId::new("B")].balance, dec("145000"));

    pool.set_account_balance(AccountId::new("A"), dec("50"), None)
        .await
        .unwrap();
    let outcome = pool.exchange(usd_to_ars("100")).await.unwrap();
    assert_eq!(outcome.reason(), Some(ErrorKind::InsufficientFunds));
    let accounts = pool.get_accounts().await.unwrap();
    assert_eq!(accounts[&AccountId::new("A")].balance, dec("50"));

    let mut to_jpy = usd_to_ars("1");
    to_jpy.counter_currency = Currency::new("JPY");
    let outcome = pool.exchange(to_jpy).await.unwrap();
    assert_eq!(outcome.reason(), Some(ErrorKind::RateNotFound));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _task) = fx_ledger::start(test_config(dir.path(), 4)).unwrap();
    seed_usd_ars(&handle, "1000").await;
    let pool = handle.pool().clone();

    let (first, second) = tokio::join!(
        pool.exchange(usd_to_ars("600")),
        pool.exchange(usd_to_ars("600"))
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| o.reason() == Some(ErrorKind::InsufficientFunds)));
    let accounts = pool.get_accounts().await.unwrap();
    assert_eq!(accounts[&AccountId::new("A")].balance, dec("400"));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_debits_never_overdraw() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _task) = fx_ledger::start(test_config(dir.path(), 4)).unwrap();
    seed_usd_ars(&handle, "1000").await;

    let mut tasks = Vec::new();
    for _ in 0..25 {
        let pool = handle.pool().clone();
        tasks.push(tokio::spawn(async move { pool.exchange(usd_to_ars("100")).await }));
    }

    let mut succeeded = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_ok() {
            succeeded += 1;
        }
    }

    let accounts = handle.pool().get_accounts().await.unwrap();
    assert_eq!(succeeded, 10);
    assert!(accounts[&AccountId::new("A")].balance.is_zero());
    assert_eq!(accounts[&AccountId::new("B")].balance, dec("1450000"));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_writer_while_serving() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _task) = fx_ledger::start(test_config(dir.path(), 4)).unwrap();

    for i in 0..20 {
        handle
            .pool()
            .set_account_balance(
                AccountId::new(format!("acct-{}", i)),
                Decimal::from(i),
                Some(Currency::new("USD")),
            )
            .await
            .unwrap();

        let status = handle.status();
        assert_eq!(status.writer_count(), 1);
        assert_eq!(status.writer, Some(WorkerId::new(0, 0)));
    }

    // Mutations that went through non-writers were routed and persisted
    let durable = PersistenceCoordinator::new(&test_config(dir.path(), 4))
        .load_snapshot()
        .unwrap();
    assert_eq!(durable.accounts.len(), 20);
    assert_eq!(durable.log.len(), 20);

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writer_crash_promotes_new_writer() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _task) = fx_ledger::start(test_config(dir.path(), 3)).unwrap();
    seed_usd_ars(&handle, "1000").await;
    handle.pool().exchange(usd_to_ars("100")).await.unwrap();
    let before_crash = handle.pool().get_accounts().await.unwrap();

    let killed = handle.terminate(0).await.unwrap();
    assert_eq!(killed, WorkerId::new(0, 0));

    wait_until("a new writer", || {
        let status = handle.status();
        status.writer.is_some() && status.writer != Some(killed)
    })
    .await;
    wait_until("slot 0 to restart", || {
        let status = handle.status();
        status.workers[0].id == WorkerId::new(0, 1) && status.workers[0].state == SlotState::Running
    })
    .await;

    let status = handle.status();
    assert_eq!(status.writer_count(), 1);
    assert!(!status.workers[0].is_writer);
    assert_eq!(status.workers[0].restarts, 1);

    // Everything persisted before the crash survived
    assert_eq!(handle.pool().get_accounts().await.unwrap(), before_crash);

    // New mutations persist through the promoted writer
    let outcome = handle.pool().exchange(usd_to_ars("100")).await.unwrap();
    assert!(outcome.is_ok());
    let durable = PersistenceCoordinator::new(&test_config(dir.path(), 3))
        .load_snapshot()
        .unwrap();
    assert_eq!(durable.accounts[&AccountId::new("A")].balance, dec("800"));
    assert_eq!(durable.accounts[&AccountId::new("B")].balance, dec("290000"));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_budget_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.supervisor.restart.max_restarts = 1;
    let (handle, task) = fx_ledger::start(config).unwrap();

    handle.terminate(0).await.unwrap();
    wait_until("slot 0 to restart", || {
        let status = handle.status();
        status.workers[0].id == WorkerId::new(0, 1) && status.workers[0].state == SlotState::Running
    })
    .await;
    // The only slot takes the writer role back when it restarts
    assert_eq!(handle.status().writer, Some(WorkerId::new(0, 1)));

    handle.terminate(0).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(Error::RestartBudgetExhausted(0))));
    let status = handle.status();
    assert_eq!(status.workers[0].state, SlotState::Failed);
    assert!(!status.is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistence_fault_demotes_writer() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 1);
    let (handle, _task) = fx_ledger::start(config.clone()).unwrap();
    seed_usd_ars(&handle, "1000").await;

    // A directory where the temp file goes makes the next write fail
    let mut tmp = config.snapshot_path().into_os_string();
    tmp.push(".tmp");
    std::fs::create_dir(&tmp).unwrap();

    let err = handle
        .pool()
        .set_rate(Currency::new("EUR"), Currency::new("USD"), dec("1.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WriterUnavailable(_)));

    std::fs::remove_dir(&tmp).unwrap();
    wait_until("the restarted writer", || {
        let status = handle.status();
        status.writer == Some(WorkerId::new(0, 1)) && status.workers[0].state == SlotState::Running
    })
    .await;

    // The unpersisted rate was discarded when the durable state was reloaded
    let rates = handle.pool().get_rates().await.unwrap();
    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0].base_currency, Currency::new("USD"));

    handle
        .pool()
        .set_rate(Currency::new("EUR"), Currency::new("USD"), dec("1.1"))
        .await
        .unwrap();
    let durable = PersistenceCoordinator::new(&config).load_snapshot().unwrap();
    assert_eq!(durable.rates.len(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_flushes_pending_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 2);
    config.batching.enabled = true;
    config.batching.batch_timeout_ms = 60_000;
    let (handle, task) = fx_ledger::start(config.clone()).unwrap();

    handle
        .pool()
        .set_account_balance(AccountId::new("A"), dec("7"), Some(Currency::new("USD")))
        .await
        .unwrap();
    let durable = PersistenceCoordinator::new(&config).load_snapshot().unwrap();
    assert!(durable.accounts.is_empty());

    handle.shutdown().await.unwrap();
    assert!(task.await.unwrap().is_ok());

    let durable = PersistenceCoordinator::new(&config).load_snapshot().unwrap();
    assert_eq!(durable.accounts[&AccountId::new("A")].balance, dec("7"));

    let status = handle.status();
    assert!(status
        .workers
        .iter()
        .all(|worker| worker.state == SlotState::Stopped));
    assert_eq!(status.writer, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_survives_full_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2);

    let (handle, task) = fx_ledger::start(config.clone()).unwrap();
    seed_usd_ars(&handle, "1000").await;
    handle.pool().exchange(usd_to_ars("250")).await.unwrap();
    let accounts = handle.pool().get_accounts().await.unwrap();
    let log = handle.pool().get_log().await.unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    let (handle, _task) = fx_ledger::start(config).unwrap();
    assert_eq!(handle.pool().get_accounts().await.unwrap(), accounts);
    assert_eq!(handle.pool().get_log().await.unwrap(), log);
    assert_eq!(handle.pool().get_rates().await.unwrap().len(), 1);

    handle.shutdown().await.unwrap();
}
