//! In-memory ledger store
//!
//! Source of truth for accounts, rates and the append-only log.
//!
//! # Invariants
//!
//! - Every balance is >= 0 and every stored rate is > 0
//! - Every mutation attempt appends exactly one log entry
//! - A mutation and its log entry become visible together: both happen
//!   under one write lock, so readers never see one without the other

use crate::{
    error::{ErrorKind, Result},
    types::{
        Account, AccountId, Currency, LogEntry, Operation, Outcome, Rate, RateKey, RATE_SCALE,
    },
};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full ledger state: what a snapshot contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Accounts by ID
    pub accounts: BTreeMap<AccountId, Account>,

    /// Rates by ordered currency pair
    #[serde(with = "rate_table")]
    pub rates: BTreeMap<RateKey, Decimal>,

    /// Append-only log, in commit order
    pub log: Vec<LogEntry>,
}

impl LedgerState {
    /// Empty state
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sequence of the last committed log entry (0 when empty)
    pub fn sequence(&self) -> u64 {
        self.log.last().map(|entry| entry.sequence).unwrap_or(0)
    }

    /// Rates as a list
    pub fn rate_list(&self) -> Vec<Rate> {
        self.rates
            .iter()
            .map(|(key, rate)| Rate {
                base_currency: key.base.clone(),
                counter_currency: key.counter.clone(),
                rate: *rate,
            })
            .collect()
    }

    /// Resolve the multiplier for `base -> counter`.
    ///
    /// A stored direct rate always wins; otherwise the reciprocal of the
    /// stored inverse is used, rounded half-even at [`RATE_SCALE`]. A
    /// reciprocal that rounds to zero is not a usable rate.
    pub fn resolve_rate(&self, base: &Currency, counter: &Currency) -> Option<Decimal> {
        let key = RateKey::new(base.clone(), counter.clone());
        if let Some(rate) = self.rates.get(&key) {
            return Some(*rate);
        }

        let inverse = self.rates.get(&key.inverse())?;
        Decimal::ONE
            .checked_div(*inverse)
            .map(|reciprocal| {
                reciprocal
                    .round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointNearestEven)
                    .normalize()
            })
            .filter(|reciprocal| *reciprocal > Decimal::ZERO)
    }

    /// Append an entry, assigning the next sequence number
    pub(crate) fn append(&mut self, mut entry: LogEntry) -> u64 {
        entry.sequence = self.sequence() + 1;
        let sequence = entry.sequence;
        self.log.push(entry);
        sequence
    }

    /// Upsert a balance without logging
    pub(crate) fn apply_balance(
        &mut self,
        id: &AccountId,
        balance: Decimal,
        currency: Option<&Currency>,
    ) -> std::result::Result<Account, ErrorKind> {
        if balance < Decimal::ZERO {
            return Err(ErrorKind::InvalidAmount);
        }

        match self.accounts.get_mut(id) {
            Some(account) => {
                if let Some(currency) = currency {
                    if *currency != account.currency {
                        return Err(ErrorKind::CurrencyMismatch);
                    }
                }
                account.balance = balance;
                Ok(account.clone())
            }
            None => {
                let currency = currency.ok_or(ErrorKind::AccountNotFound)?;
                let account = Account {
                    id: id.clone(),
                    currency: currency.clone(),
                    balance,
                };
                self.accounts.insert(id.clone(), account.clone());
                Ok(account)
            }
        }
    }

    /// Upsert a rate without logging
    pub(crate) fn apply_rate(
        &mut self,
        base: &Currency,
        counter: &Currency,
        rate: Decimal,
    ) -> std::result::Result<Rate, ErrorKind> {
        if rate <= Decimal::ZERO {
            return Err(ErrorKind::InvalidAmount);
        }

        self.rates
            .insert(RateKey::new(base.clone(), counter.clone()), rate);
        Ok(Rate {
            base_currency: base.clone(),
            counter_currency: counter.clone(),
            rate,
        })
    }

    /// Check the balance and rate invariants
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if let Some(account) = self
            .accounts
            .values()
            .find(|account| account.balance < Decimal::ZERO)
        {
            return Err(format!("negative balance on account {}", account.id));
        }
        if let Some((key, _)) = self.rates.iter().find(|(_, rate)| **rate <= Decimal::ZERO) {
            return Err(format!("non-positive rate for {}", key));
        }
        Ok(())
    }
}

/// Thread-safe ledger store
#[derive(Debug, Default)]
pub struct LedgerStore {
    state: RwLock<LedgerState>,
}

impl LedgerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from loaded state
    pub fn from_state(state: LedgerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of all accounts
    pub fn get_accounts(&self) -> BTreeMap<AccountId, Account> {
        self.state.read().accounts.clone()
    }

    /// Copy of one account
    pub fn get_account(&self, id: &AccountId) -> Option<Account> {
        self.state.read().accounts.get(id).cloned()
    }

    /// Upsert a balance and log the attempt.
    ///
    /// A new account needs `currency`; an existing one rejects a
    /// different currency. Fails with `InvalidAmount` when `balance < 0`.
    pub fn set_account_balance(
        &self,
        id: &AccountId,
        balance: Decimal,
        currency: Option<&Currency>,
    ) -> Result<Account> {
        let mut state = self.state.write();
        let result = state.apply_balance(id, balance, currency);

        let operation = Operation::BalanceSet {
            account_id: id.clone(),
            currency: currency.cloned(),
            balance,
        };
        state.append(LogEntry::new(operation, outcome_of(&result)));

        match &result {
            Ok(_) => tracing::debug!(account_id = %id, %balance, "Balance set"),
            Err(reason) => tracing::warn!(account_id = %id, %reason, "Balance set rejected"),
        }

        result.map_err(Into::into)
    }

    /// Copy of all rates
    pub fn get_rates(&self) -> Vec<Rate> {
        self.state.read().rate_list()
    }

    /// Upsert a rate and log the attempt. Fails with `InvalidAmount` when `rate <= 0`.
    pub fn set_rate(&self, base: &Currency, counter: &Currency, rate: Decimal) -> Result<Rate> {
        let mut state = self.state.write();
        let result = state.apply_rate(base, counter, rate);

        let operation = Operation::RateSet {
            base_currency: base.clone(),
            counter_currency: counter.clone(),
            rate,
        };
        state.append(LogEntry::new(operation, outcome_of(&result)));

        match &result {
            Ok(_) => tracing::debug!(%base, %counter, %rate, "Rate set"),
            Err(reason) => tracing::warn!(%base, %counter, %reason, "Rate set rejected"),
        }

        result.map_err(Into::into)
    }

    /// Resolve the multiplier for `base -> counter`
    pub fn resolve_rate(&self, base: &Currency, counter: &Currency) -> Option<Decimal> {
        self.state.read().resolve_rate(base, counter)
    }

    /// Append a log entry; returns its sequence number
    pub fn append_log(&self, entry: LogEntry) -> u64 {
        self.state.write().append(entry)
    }

    /// Full log, in commit order
    pub fn get_log(&self) -> Vec<LogEntry> {
        self.state.read().log.clone()
    }

    /// Sequence of the last committed log entry
    pub fn sequence(&self) -> u64 {
        self.state.read().sequence()
    }

    /// Consistent copy of the whole state
    pub fn snapshot(&self) -> LedgerState {
        self.state.read().clone()
    }

    /// Replace the whole state atomically
    pub fn restore(&self, state: LedgerState) {
        let sequence = state.sequence();
        *self.state.write() = state;
        tracing::info!(sequence, "Ledger state restored");
    }

    /// Run `f` inside the store's write critical section
    pub(crate) fn transact<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        let mut state = self.state.write();
        f(&mut state)
    }
}

fn outcome_of<T>(result: &std::result::Result<T, ErrorKind>) -> Outcome {
    match result {
        Ok(_) => Outcome::success(),
        Err(reason) => Outcome::failure(*reason),
    }
}

/// Rates are persisted as a list of `Rate` records
mod rate_table {
    use crate::types::{Rate, RateKey};
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        rates: &BTreeMap<RateKey, Decimal>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(rates.iter().map(|(key, rate)| Rate {
            base_currency: key.base.clone(),
            counter_currency: key.counter.clone(),
            rate: *rate,
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<RateKey, Decimal>, D::Error> {
        let rates = Vec::<Rate>::deserialize(deserializer)?;
        Ok(rates.into_iter().map(|rate| (rate.key(), rate.rate)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_balance_creates_account() {
        let store = LedgerStore::new();
        let account = store
            .set_account_balance(&AccountId::new("A"), dec("1000"), Some(&Currency::new("USD")))
            .unwrap();

        assert_eq!(account.balance, dec("1000"));
        assert_eq!(store.get_accounts().len(), 1);
        assert_eq!(store.get_log().len(), 1);
        assert!(store.get_log()[0].outcome.ok);
    }

    #[test]
    fn test_negative_balance_rejected_and_logged() {
        let store = LedgerStore::new();
        let id = AccountId::new("A");
        store
            .set_account_balance(&id, dec("10"), Some(&Currency::new("USD")))
            .unwrap();

        let err = store.set_account_balance(&id, dec("-1"), None).unwrap_err();
        assert!(matches!(err, Error::Domain(ErrorKind::InvalidAmount)));
        assert_eq!(store.get_account(&id).unwrap().balance, dec("10"));

        let log = store.get_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].outcome, Outcome::failure(ErrorKind::InvalidAmount));
        assert_eq!(log[1].sequence, 2);
    }

    #[test]
    fn test_zero_balance_allowed() {
        let store = LedgerStore::new();
        let account = store
            .set_account_balance(&AccountId::new("B"), Decimal::ZERO, Some(&Currency::new("ARS")))
            .unwrap();
        assert!(account.balance.is_zero());
    }

    #[test]
    fn test_new_account_requires_currency() {
        let store = LedgerStore::new();
        let err = store
            .set_account_balance(&AccountId::new("X"), dec("5"), None)
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::AccountNotFound));
        assert!(store.get_accounts().is_empty());
    }

    #[test]
    fn test_existing_account_currency_mismatch() {
        let store = LedgerStore::new();
        let id = AccountId::new("A");
        store
            .set_account_balance(&id, dec("5"), Some(&Currency::new("USD")))
            .unwrap();
        let err = store
            .set_account_balance(&id, dec("7"), Some(&Currency::new("EUR")))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CurrencyMismatch));
    }

    #[test]
    fn test_set_rate_rejects_non_positive() {
        let store = LedgerStore::new();
        let usd = Currency::new("USD");
        let ars = Currency::new("ARS");

        assert!(store.set_rate(&usd, &ars, Decimal::ZERO).is_err());
        assert!(store.set_rate(&usd, &ars, dec("-3")).is_err());
        assert!(store.get_rates().is_empty());
        assert_eq!(store.get_log().len(), 2);

        store.set_rate(&usd, &ars, dec("1450")).unwrap();
        assert_eq!(store.get_rates().len(), 1);
    }

    #[test]
    fn test_set_rate_upserts() {
        let store = LedgerStore::new();
        let usd = Currency::new("USD");
        let ars = Currency::new("ARS");
        store.set_rate(&usd, &ars, dec("1400")).unwrap();
        store.set_rate(&usd, &ars, dec("1450")).unwrap();

        let rates = store.get_rates();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].rate, dec("1450"));
    }

    #[test]
    fn test_resolve_rate_prefers_direct() {
        let store = LedgerStore::new();
        let usd = Currency::new("USD");
        let eur = Currency::new("EUR");

        store.set_rate(&eur, &usd, dec("2")).unwrap();
        assert_eq!(store.resolve_rate(&usd, &eur), Some(dec("0.5")));

        store.set_rate(&usd, &eur, dec("0.45")).unwrap();
        assert_eq!(store.resolve_rate(&usd, &eur), Some(dec("0.45")));
    }

    #[test]
    fn test_resolve_rate_reciprocal_is_rounded() {
        let store = LedgerStore::new();
        let usd = Currency::new("USD");
        let eur = Currency::new("EUR");
        store.set_rate(&eur, &usd, dec("3")).unwrap();

        assert_eq!(store.resolve_rate(&usd, &eur), Some(dec("0.333333333333")));
        assert_eq!(store.resolve_rate(&usd, &Currency::new("JPY")), None);
    }

    #[test]
    fn test_reads_are_idempotent() {
        let store = LedgerStore::new();
        store
            .set_account_balance(&AccountId::new("A"), dec("1"), Some(&Currency::new("USD")))
            .unwrap();

        assert_eq!(store.get_accounts(), store.get_accounts());
        assert_eq!(store.get_rates(), store.get_rates());
        assert_eq!(store.get_log(), store.get_log());
    }

    #[test]
    fn test_snapshot_and_restore() {
        let store = LedgerStore::new();
        store
            .set_account_balance(&AccountId::new("A"), dec("1"), Some(&Currency::new("USD")))
            .unwrap();
        let snapshot = store.snapshot();

        store
            .set_account_balance(&AccountId::new("A"), dec("2"), None)
            .unwrap();
        store.restore(snapshot.clone());

        assert_eq!(store.snapshot(), snapshot);
        assert_eq!(store.sequence(), 1);
    }

    #[test]
    fn test_state_json_roundtrip_keeps_rates() {
        let store = LedgerStore::new();
        store
            .set_rate(&Currency::new("USD"), &Currency::new("ARS"), dec("1450"))
            .unwrap();
        let state = store.snapshot();

        let json = serde_json::to_string(&state).unwrap();
        let back: LedgerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(back.check_invariants().is_ok());
    }
}
