//! HTTP boundary for the FX ledger

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;

pub use config::Config;
pub use errors::{GatewayError, Result};
