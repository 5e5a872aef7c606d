//! Request schemas
//!
//! Bodies are deserialized into fixed shapes and validated here, so the
//! ledger only ever sees well-formed values. Amounts may be JSON numbers
//! or decimal strings.

use crate::errors::GatewayError;
use fx_ledger::{types::lenient_decimal, AccountId, Currency, ExchangeRequest};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SetBalanceBody {
    #[serde(deserialize_with = "lenient_decimal::deserialize")]
    pub balance: Decimal,
    /// Required only when the account does not exist yet
    #[serde(default)]
    pub currency: Option<String>,
}

impl SetBalanceBody {
    pub fn validate(self) -> Result<(Decimal, Option<Currency>), GatewayError> {
        let currency = self
            .currency
            .map(|code| parse_currency("currency", &code))
            .transpose()?;
        Ok((self.balance, currency))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRateBody {
    pub base_currency: String,
    pub counter_currency: String,
    #[serde(deserialize_with = "lenient_decimal::deserialize")]
    pub rate: Decimal,
}

impl SetRateBody {
    pub fn validate(self) -> Result<(Currency, Currency, Decimal), GatewayError> {
        Ok((
            parse_currency("baseCurrency", &self.base_currency)?,
            parse_currency("counterCurrency", &self.counter_currency)?,
            self.rate,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeBody {
    pub base_currency: String,
    pub counter_currency: String,
    pub base_account_id: String,
    pub counter_account_id: String,
    #[serde(deserialize_with = "lenient_decimal::deserialize")]
    pub base_amount: Decimal,
}

impl ExchangeBody {
    pub fn validate(self) -> Result<ExchangeRequest, GatewayError> {
        if self.base_amount <= Decimal::ZERO {
            return Err(GatewayError::Malformed(format!(
                "baseAmount must be positive: {}",
                self.base_amount
            )));
        }

        Ok(ExchangeRequest {
            base_currency: parse_currency("baseCurrency", &self.base_currency)?,
            counter_currency: parse_currency("counterCurrency", &self.counter_currency)?,
            base_account_id: parse_account_id("baseAccountId", &self.base_account_id)?,
            counter_account_id: parse_account_id("counterAccountId", &self.counter_account_id)?,
            base_amount: self.base_amount,
        })
    }
}

fn parse_currency(field: &str, code: &str) -> Result<Currency, GatewayError> {
    Currency::parse(code)
        .ok_or_else(|| GatewayError::Malformed(format!("{} is not a currency code: {:?}", field, code)))
}

pub fn parse_account_id(field: &str, id: &str) -> Result<AccountId, GatewayError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(GatewayError::Malformed(format!("{} is empty", field)));
    }
    Ok(AccountId::new(id))
}
