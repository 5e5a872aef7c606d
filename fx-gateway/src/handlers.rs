use crate::errors::{GatewayError, Result};
use crate::models::{parse_account_id, ExchangeBody, SetBalanceBody, SetRateBody};
use actix_web::{web, HttpResponse};
use chrono::Utc;
use fx_ledger::SupervisorHandle;
use serde_json::json;

/// Health check: a writer is assigned and at least one worker is serving
pub async fn health_check(supervisor: web::Data<SupervisorHandle>) -> HttpResponse {
    let status = supervisor.status();

    if status.is_healthy() {
        HttpResponse::Ok().json(json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
            "writer": status.writer,
        }))
    } else {
        let message = if status.writer.is_none() {
            "No writer assigned"
        } else {
            "No running worker"
        };
        HttpResponse::ServiceUnavailable().json(json!({
            "status": "unhealthy",
            "message": message,
        }))
    }
}

/// Pool status for operators
pub async fn pool_status(supervisor: web::Data<SupervisorHandle>) -> HttpResponse {
    HttpResponse::Ok().json(supervisor.status())
}

/// All accounts, keyed by id
pub async fn get_accounts(supervisor: web::Data<SupervisorHandle>) -> Result<HttpResponse> {
    let accounts = supervisor.pool().get_accounts().await?;
    Ok(HttpResponse::Ok().json(accounts))
}

/// Set an account balance; returns the updated accounts
pub async fn set_account_balance(
    supervisor: web::Data<SupervisorHandle>,
    account_id: web::Path<String>,
    body: web::Json<SetBalanceBody>,
) -> Result<HttpResponse> {
    let account_id = parse_account_id("id", &account_id)?;
    let (balance, currency) = body.into_inner().validate()?;

    let pool = supervisor.pool();
    pool.set_account_balance(account_id, balance, currency).await?;

    let accounts = pool.get_accounts().await?;
    Ok(HttpResponse::Ok().json(accounts))
}

/// All rates
pub async fn get_rates(supervisor: web::Data<SupervisorHandle>) -> Result<HttpResponse> {
    let rates = supervisor.pool().get_rates().await?;
    Ok(HttpResponse::Ok().json(rates))
}

/// Set a rate; returns the updated rates
pub async fn set_rate(
    supervisor: web::Data<SupervisorHandle>,
    body: web::Json<SetRateBody>,
) -> Result<HttpResponse> {
    let (base, counter, rate) = body.into_inner().validate()?;

    let pool = supervisor.pool();
    pool.set_rate(base, counter, rate).await?;

    let rates = pool.get_rates().await?;
    Ok(HttpResponse::Ok().json(rates))
}

/// Full log, in commit order
pub async fn get_log(supervisor: web::Data<SupervisorHandle>) -> Result<HttpResponse> {
    let log = supervisor.pool().get_log().await?;
    Ok(HttpResponse::Ok().json(log))
}

/// Execute an exchange.
///
/// Domain failures are part of the result: `{ok: false, reason}` with 500.
pub async fn exchange(
    supervisor: web::Data<SupervisorHandle>,
    body: web::Json<ExchangeBody>,
) -> Result<HttpResponse> {
    let request = body.into_inner().validate()?;

    match supervisor.pool().exchange(request).await {
        Ok(outcome) if outcome.is_ok() => Ok(HttpResponse::Ok().json(outcome)),
        Ok(outcome) => Ok(HttpResponse::InternalServerError().json(outcome)),
        Err(fx_ledger::Error::WriterUnavailable(reason)) => {
            tracing::warn!(%reason, "Exchange not applied");
            Ok(HttpResponse::ServiceUnavailable().json(json!({
                "ok": false,
                "reason": "WriterUnavailable",
            })))
        }
        Err(e) => Err(e.into()),
    }
}

/// Any body that does not fit the schema is a malformed request
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| GatewayError::Malformed(err.to_string()).into())
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/health", web::get().to(health_check))
        .route("/status", web::get().to(pool_status))
        .route("/accounts", web::get().to(get_accounts))
        .route("/accounts/{id}/balance", web::put().to(set_account_balance))
        .route("/rates", web::get().to(get_rates))
        .route("/rates", web::put().to(set_rate))
        .route("/log", web::get().to(get_log))
        .route("/exchange", web::post().to(exchange));
}
