//! Core types for the ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (JSON and bincode snapshots)
//! - Exact arithmetic (Decimal for money and rates)

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decimal places kept for account amounts.
pub const AMOUNT_SCALE: u32 = 8;

/// Decimal places kept for reciprocal rates.
pub const RATE_SCALE: u32 = 12;

/// Round an amount half-to-even at [`AMOUNT_SCALE`].
pub fn round_amount(value: Decimal) -> Decimal {
    value
        .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointNearestEven)
        .normalize()
}

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO-like currency code, normalized to upper case
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create from a code, normalizing case and surrounding whitespace
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    /// Parse a user-supplied code: 1 to 12 ASCII alphanumerics
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        let valid = !code.is_empty()
            && code.len() <= 12
            && code.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| Self::new(code))
    }

    /// Code as string
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named balance holder in a single currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account ID
    pub id: AccountId,
    /// Currency the balance is held in
    pub currency: Currency,
    /// Balance, never negative
    pub balance: Decimal,
}

/// Ordered currency pair a rate is stored under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RateKey {
    /// Currency converted from
    pub base: Currency,
    /// Currency converted to
    pub counter: Currency,
}

impl RateKey {
    /// Create a key for `base -> counter`
    pub fn new(base: Currency, counter: Currency) -> Self {
        Self { base, counter }
    }

    /// The opposite direction
    pub fn inverse(&self) -> Self {
        Self {
            base: self.counter.clone(),
            counter: self.base.clone(),
        }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.counter)
    }
}

/// Directional multiplier converting base currency into counter currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rate {
    /// Currency converted from
    pub base_currency: Currency,
    /// Currency converted to
    pub counter_currency: Currency,
    /// Multiplier, always positive
    pub rate: Decimal,
}

impl Rate {
    /// Key this rate is stored under
    pub fn key(&self) -> RateKey {
        RateKey::new(self.base_currency.clone(), self.counter_currency.clone())
    }
}

/// Request for an atomic two-leg transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    /// Currency debited from the base account
    pub base_currency: Currency,
    /// Currency credited to the counter account
    pub counter_currency: Currency,
    /// Debited account
    pub base_account_id: AccountId,
    /// Credited account
    pub counter_account_id: AccountId,
    /// Amount debited, in base currency
    pub base_amount: Decimal,
}

/// Result of an applied exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeReceipt {
    /// Debited account
    pub base_account_id: AccountId,
    /// Credited account
    pub counter_account_id: AccountId,
    /// Amount debited
    pub base_amount: Decimal,
    /// Amount credited (`base_amount * rate`, rounded half-even)
    pub counter_amount: Decimal,
    /// Rate used
    pub rate: Decimal,
}

/// Outcome of an exchange as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Both legs applied
    Completed(ExchangeReceipt),
    /// Nothing applied
    Failed {
        /// Why the exchange was refused
        reason: ErrorKind,
    },
}

impl ExchangeOutcome {
    /// Whether both legs were applied
    pub fn is_ok(&self) -> bool {
        matches!(self, ExchangeOutcome::Completed(_))
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<ErrorKind> {
        match self {
            ExchangeOutcome::Completed(_) => None,
            ExchangeOutcome::Failed { reason } => Some(*reason),
        }
    }

    /// Receipt, if the exchange was applied
    pub fn receipt(&self) -> Option<&ExchangeReceipt> {
        match self {
            ExchangeOutcome::Completed(receipt) => Some(receipt),
            ExchangeOutcome::Failed { .. } => None,
        }
    }
}

impl Serialize for ExchangeOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            ok: bool,
            #[serde(flatten)]
            receipt: Option<&'a ExchangeReceipt>,
            #[serde(skip_serializing_if = "Option::is_none")]
            reason: Option<ErrorKind>,
        }

        Wire {
            ok: self.is_ok(),
            receipt: self.receipt(),
            reason: self.reason(),
        }
        .serialize(serializer)
    }
}

/// State-changing operation recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Balance upsert
    #[serde(rename_all = "camelCase")]
    BalanceSet {
        /// Target account
        account_id: AccountId,
        /// Currency supplied with the request, if any
        currency: Option<Currency>,
        /// Requested balance
        balance: Decimal,
    },
    /// Rate upsert
    #[serde(rename_all = "camelCase")]
    RateSet {
        /// Currency converted from
        base_currency: Currency,
        /// Currency converted to
        counter_currency: Currency,
        /// Requested rate
        rate: Decimal,
    },
    /// Exchange attempt
    #[serde(rename_all = "camelCase")]
    Exchange {
        /// Request as received
        request: ExchangeRequest,
        /// Resolved rate (absent when resolution failed)
        rate: Option<Decimal>,
        /// Computed counter amount (absent when never computed)
        counter_amount: Option<Decimal>,
    },
}

impl Operation {
    /// Operation type name
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::BalanceSet { .. } => "balance-set",
            Operation::RateSet { .. } => "rate-set",
            Operation::Exchange { .. } => "exchange",
        }
    }
}

/// Success or failure of a logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the operation was applied
    pub ok: bool,
    /// Failure reason when `ok` is false
    pub reason: Option<ErrorKind>,
}

impl Outcome {
    /// Applied
    pub fn success() -> Self {
        Self { ok: true, reason: None }
    }

    /// Refused for `reason`
    pub fn failure(reason: ErrorKind) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// Append-only log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,
    /// Commit position, starting at 1
    pub sequence: u64,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// What was attempted
    pub operation: Operation,
    /// What happened
    pub outcome: Outcome,
}

impl LogEntry {
    /// Build an entry; the sequence is assigned by the store on append.
    pub fn new(operation: Operation, outcome: Outcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            sequence: 0,
            timestamp: Utc::now(),
            operation,
            outcome,
        }
    }
}

/// Identity of one worker incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    /// Pool slot index
    pub slot: usize,
    /// Bumped on every restart of the slot
    pub incarnation: u32,
}

impl WorkerId {
    /// Create a worker ID
    pub fn new(slot: usize, incarnation: u32) -> Self {
        Self { slot, incarnation }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}.{}", self.slot, self.incarnation)
    }
}

/// Deserializers accepting decimals as JSON strings or JSON numbers.
///
/// Persisted decimals are always strings; request bodies and seed files
/// written by hand often use plain numbers.
pub mod lenient_decimal {
    use rust_decimal::Decimal;
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    fn parse<E: de::Error>(raw: Raw) -> Result<Decimal, E> {
        let text = match raw {
            Raw::Text(text) => text,
            Raw::Number(number) => number.to_string(),
        };
        let text = text.trim();
        text.parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(text))
            .map_err(|e| E::custom(format!("invalid decimal {:?}: {}", text, e)))
    }

    /// Required decimal
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }

    /// Optional decimal; `null` and absent fields become `None`
    pub fn option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Decimal>, D::Error> {
        Option::<Raw>::deserialize(deserializer)?
            .map(parse)
            .transpose()
    }
}
