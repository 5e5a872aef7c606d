//! Atomic two-leg exchange
//!
//! An exchange debits one account and credits another, converted by the
//! resolved rate. Resolution, validation, both legs and the log entry all
//! happen inside one store critical section: concurrent readers observe
//! either none of it or all of it.

use crate::{
    error::ErrorKind,
    store::{LedgerState, LedgerStore},
    types::{
        round_amount, ExchangeOutcome, ExchangeReceipt, ExchangeRequest, LogEntry, Operation,
        Outcome,
    },
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Exchange engine on top of the ledger store
#[derive(Debug, Clone)]
pub struct ExchangeEngine {
    store: Arc<LedgerStore>,
}

/// Computed but not yet applied exchange
struct Plan {
    rate: Decimal,
    counter_amount: Decimal,
    base_balance: Decimal,
    counter_balance: Decimal,
}

/// Why a plan was refused, with whatever was resolved before refusing
struct Rejection {
    reason: ErrorKind,
    rate: Option<Decimal>,
    counter_amount: Option<Decimal>,
}

impl Rejection {
    fn new(reason: ErrorKind) -> Self {
        Self {
            reason,
            rate: None,
            counter_amount: None,
        }
    }
}

impl ExchangeEngine {
    /// Create engine
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Execute an exchange.
    ///
    /// Domain failures are returned as [`ExchangeOutcome::Failed`]; they
    /// leave every balance untouched but are still logged.
    pub fn exchange(&self, request: &ExchangeRequest) -> ExchangeOutcome {
        self.store.transact(|state| execute(state, request))
    }
}

fn execute(state: &mut LedgerState, request: &ExchangeRequest) -> ExchangeOutcome {
    match plan(state, request) {
        Ok(plan) => {
            // Both legs are computed before either is written.
            if let Some(account) = state.accounts.get_mut(&request.base_account_id) {
                account.balance = plan.base_balance;
            }
            if let Some(account) = state.accounts.get_mut(&request.counter_account_id) {
                account.balance = plan.counter_balance;
            }

            state.append(LogEntry::new(
                Operation::Exchange {
                    request: request.clone(),
                    rate: Some(plan.rate),
                    counter_amount: Some(plan.counter_amount),
                },
                Outcome::success(),
            ));

            tracing::info!(
                base_account = %request.base_account_id,
                counter_account = %request.counter_account_id,
                base_amount = %request.base_amount,
                counter_amount = %plan.counter_amount,
                rate = %plan.rate,
                "Exchange applied"
            );

            ExchangeOutcome::Completed(ExchangeReceipt {
                base_account_id: request.base_account_id.clone(),
                counter_account_id: request.counter_account_id.clone(),
                base_amount: request.base_amount,
                counter_amount: plan.counter_amount,
                rate: plan.rate,
            })
        }
        Err(rejection) => {
            state.append(LogEntry::new(
                Operation::Exchange {
                    request: request.clone(),
                    rate: rejection.rate,
                    counter_amount: rejection.counter_amount,
                },
                Outcome::failure(rejection.reason),
            ));

            tracing::warn!(
                base_account = %request.base_account_id,
                counter_account = %request.counter_account_id,
                reason = %rejection.reason,
                "Exchange rejected"
            );

            ExchangeOutcome::Failed {
                reason: rejection.reason,
            }
        }
    }
}

fn plan(state: &LedgerState, request: &ExchangeRequest) -> Result<Plan, Rejection> {
    if request.base_amount <= Decimal::ZERO {
        return Err(Rejection::new(ErrorKind::InvalidAmount));
    }

    // 1. Rate: direct pair, else reciprocal of the inverse
    let rate = state
        .resolve_rate(&request.base_currency, &request.counter_currency)
        .ok_or_else(|| Rejection::new(ErrorKind::RateNotFound))?;
    let reject = |reason| Rejection {
        reason,
        rate: Some(rate),
        counter_amount: None,
    };

    // 2. Accounts and their currencies
    let base = state
        .accounts
        .get(&request.base_account_id)
        .ok_or_else(|| reject(ErrorKind::AccountNotFound))?;
    let counter = state
        .accounts
        .get(&request.counter_account_id)
        .ok_or_else(|| reject(ErrorKind::AccountNotFound))?;
    if base.currency != request.base_currency || counter.currency != request.counter_currency {
        return Err(reject(ErrorKind::CurrencyMismatch));
    }

    // 3. Counter amount
    let counter_amount = request
        .base_amount
        .checked_mul(rate)
        .map(round_amount)
        .ok_or_else(|| reject(ErrorKind::InvalidAmount))?;

    // 4. Funds; reaching exactly zero is allowed
    if base.balance < request.base_amount {
        return Err(Rejection {
            reason: ErrorKind::InsufficientFunds,
            rate: Some(rate),
            counter_amount: Some(counter_amount),
        });
    }

    let base_balance = base.balance - request.base_amount;
    let credited_from = if request.base_account_id == request.counter_account_id {
        base_balance
    } else {
        counter.balance
    };
    let counter_balance = credited_from
        .checked_add(counter_amount)
        .ok_or_else(|| reject(ErrorKind::InvalidAmount))?;

    Ok(Plan {
        rate,
        counter_amount,
        base_balance,
        counter_balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, Currency};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn setup(a_balance: &str) -> ExchangeEngine {
        let store = Arc::new(LedgerStore::new());
        let usd = Currency::new("USD");
        let ars = Currency::new("ARS");
        store
            .set_account_balance(&AccountId::new("A"), dec(a_balance), Some(&usd))
            .unwrap();
        store
            .set_account_balance(&AccountId::new("B"), Decimal::ZERO, Some(&ars))
            .unwrap();
        store.set_rate(&usd, &ars, dec("1450")).unwrap();
        ExchangeEngine::new(store)
    }

    fn request(base: &str, counter: &str, amount: &str) -> ExchangeRequest {
        ExchangeRequest {
            base_currency: Currency::new(base),
            counter_currency: Currency::new(counter),
            base_account_id: AccountId::new("A"),
            counter_account_id: AccountId::new("B"),
            base_amount: dec(amount),
        }
    }

    fn balance(engine: &ExchangeEngine, id: &str) -> Decimal {
        engine.store().get_account(&AccountId::new(id)).unwrap().balance
    }

    #[test]
    fn test_exchange_usd_to_ars() {
        let engine = setup("1000");
        let log_before = engine.store().get_log().len();

        let outcome = engine.exchange(&request("USD", "ARS", "100"));
        let receipt = outcome.receipt().unwrap();

        assert_eq!(receipt.counter_amount, dec("145000"));
        assert_eq!(receipt.rate, dec("1450"));
        assert_eq!(balance(&engine, "A"), dec("900"));
        assert_eq!(balance(&engine, "B"), dec("145000"));
        assert_eq!(engine.store().get_log().len(), log_before + 1);
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let engine = setup("50");
        let log_before = engine.store().get_log().len();

        let outcome = engine.exchange(&request("USD", "ARS", "100"));

        assert_eq!(outcome.reason(), Some(ErrorKind::InsufficientFunds));
        assert_eq!(balance(&engine, "A"), dec("50"));
        assert_eq!(balance(&engine, "B"), Decimal::ZERO);

        let log = engine.store().get_log();
        assert_eq!(log.len(), log_before + 1);
        assert_eq!(
            log.last().unwrap().outcome,
            Outcome::failure(ErrorKind::InsufficientFunds)
        );
    }

    #[test]
    fn test_exact_balance_reaches_zero() {
        let engine = setup("100");
        let outcome = engine.exchange(&request("USD", "ARS", "100"));
        assert!(outcome.is_ok());
        assert!(balance(&engine, "A").is_zero());
    }

    #[test]
    fn test_rate_not_found() {
        let engine = setup("1000");
        let outcome = engine.exchange(&request("USD", "JPY", "1"));
        assert_eq!(outcome.reason(), Some(ErrorKind::RateNotFound));
    }

    #[test]
    fn test_inverse_rate_used_when_direct_missing() {
        let engine = setup("0");
        engine
            .store()
            .set_account_balance(&AccountId::new("B"), dec("2900"), None)
            .unwrap();

        let outcome = engine.exchange(&ExchangeRequest {
            base_currency: Currency::new("ARS"),
            counter_currency: Currency::new("USD"),
            base_account_id: AccountId::new("B"),
            counter_account_id: AccountId::new("A"),
            base_amount: dec("1450"),
        });

        assert_eq!(outcome.receipt().unwrap().counter_amount, dec("1"));
        assert_eq!(balance(&engine, "A"), dec("1"));
        assert_eq!(balance(&engine, "B"), dec("1450"));
    }

    #[test]
    fn test_vanishing_reciprocal_is_not_a_rate() {
        let engine = setup("0");
        let store = engine.store();
        let (eur, jpy) = (Currency::new("EUR"), Currency::new("JPY"));
        store.set_rate(&eur, &jpy, dec("10000000000000")).unwrap();
        store
            .set_account_balance(&AccountId::new("C"), dec("5"), Some(&jpy))
            .unwrap();
        store
            .set_account_balance(&AccountId::new("D"), Decimal::ZERO, Some(&eur))
            .unwrap();
        assert_eq!(store.resolve_rate(&jpy, &eur), None);

        let outcome = engine.exchange(&ExchangeRequest {
            base_currency: jpy,
            counter_currency: eur,
            base_account_id: AccountId::new("C"),
            counter_account_id: AccountId::new("D"),
            base_amount: dec("5"),
        });

        assert_eq!(outcome.reason(), Some(ErrorKind::RateNotFound));
        assert_eq!(balance(&engine, "C"), dec("5"));
        assert!(balance(&engine, "D").is_zero());
    }

    #[test]
    fn test_account_not_found() {
        let engine = setup("1000");
        let mut req = request("USD", "ARS", "1");
        req.counter_account_id = AccountId::new("missing");
        assert_eq!(
            engine.exchange(&req).reason(),
            Some(ErrorKind::AccountNotFound)
        );
        assert_eq!(balance(&engine, "A"), dec("1000"));
    }

    #[test]
    fn test_currency_mismatch() {
        let engine = setup("1000");
        engine
            .store()
            .set_rate(&Currency::new("EUR"), &Currency::new("ARS"), dec("1600"))
            .unwrap();
        let outcome = engine.exchange(&request("EUR", "ARS", "1"));
        assert_eq!(outcome.reason(), Some(ErrorKind::CurrencyMismatch));
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let engine = setup("1000");
        assert_eq!(
            engine.exchange(&request("USD", "ARS", "0")).reason(),
            Some(ErrorKind::InvalidAmount)
        );
        assert_eq!(
            engine.exchange(&request("USD", "ARS", "-5")).reason(),
            Some(ErrorKind::InvalidAmount)
        );
    }

    #[test]
    fn test_counter_amount_rounded_half_even() {
        let engine = setup("10");
        engine
            .store()
            .set_rate(&Currency::new("USD"), &Currency::new("ARS"), dec("0.000000005"))
            .unwrap();

        // 1 * 0.000000005 rounds to 0.00000000 (even), 3 * ... = 0.000000015 -> 0.00000002
        let first = engine.exchange(&request("USD", "ARS", "1"));
        assert_eq!(first.receipt().unwrap().counter_amount, Decimal::ZERO);
        let second = engine.exchange(&request("USD", "ARS", "3"));
        assert_eq!(second.receipt().unwrap().counter_amount, dec("0.00000002"));
    }
}
