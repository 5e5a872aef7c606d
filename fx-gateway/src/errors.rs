use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use fx_ledger::ErrorKind;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request rejected: {0}")]
    Domain(ErrorKind),

    #[error("Writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<fx_ledger::Error> for GatewayError {
    fn from(error: fx_ledger::Error) -> Self {
        match error {
            fx_ledger::Error::Domain(kind) => GatewayError::Domain(kind),
            fx_ledger::Error::WriterUnavailable(reason) => GatewayError::WriterUnavailable(reason),
            fx_ledger::Error::MailboxClosed(_) | fx_ledger::Error::Concurrency(_) => {
                GatewayError::ServiceUnavailable(error.to_string())
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let body = match self {
            // Detail stays in the logs; callers get the fixed message
            GatewayError::Malformed(detail) => {
                tracing::debug!(%detail, "Malformed request");
                json!({ "error": "Malformed request" })
            }
            GatewayError::Domain(kind) => json!({
                "error": "Request rejected",
                "reason": kind.as_str()
            }),
            GatewayError::WriterUnavailable(_) => json!({
                "error": "Writer unavailable",
                "reason": "WriterUnavailable"
            }),
            GatewayError::ServiceUnavailable(_) => json!({ "error": "Service unavailable" }),
            GatewayError::Internal(message) => {
                tracing::error!(%message, "Internal error");
                json!({ "error": "Internal server error" })
            }
        };

        HttpResponse::build(self.status_code()).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Malformed(_) => StatusCode::BAD_REQUEST,
            GatewayError::Domain(_) => StatusCode::BAD_REQUEST,
            GatewayError::WriterUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
