use actix_web::{error::JsonPayloadError, http::StatusCode, HttpRequest, HttpResponse};
use bank_core::amount::AmountError;
use bank_core::base32::Base32Error;
use bank_core::conversion::ConversionError;
use bank_core::payto::PaytoError;
use bank_core::TalerErrorCode;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BankError>;

/// Service-level error. Business outcomes travel as result enums through
/// the storage layer; only genuine failures become a `BankError`, and the
/// HTTP edge renders each as the canonical Taler error envelope.
#[derive(Error, Debug)]
pub enum BankError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{hint}")]
    BadRequest { code: TalerErrorCode, hint: String },

    #[error("{hint}")]
    Unauthorized { code: TalerErrorCode, hint: String },

    #[error("{hint}")]
    Forbidden { code: TalerErrorCode, hint: String },

    #[error("{hint}")]
    NotFound { code: TalerErrorCode, hint: String },

    #[error("{hint}")]
    Conflict { code: TalerErrorCode, hint: String },

    #[error("{hint}")]
    NotImplemented { code: TalerErrorCode, hint: String },

    #[error("too many failed TAN attempts")]
    TanRateLimited,

    #[error("TAN channel script failed: {0}")]
    TanScriptFailed(String),

    #[error("transaction serialization retries exhausted")]
    SoftFailure,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BankError {
    pub fn bad_request(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::BadRequest { code, hint: hint.into() }
    }

    pub fn unauthorized(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::Unauthorized { code, hint: hint.into() }
    }

    pub fn forbidden(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::Forbidden { code, hint: hint.into() }
    }

    pub fn not_found(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::NotFound { code, hint: hint.into() }
    }

    pub fn conflict(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::Conflict { code, hint: hint.into() }
    }

    pub fn not_implemented(code: TalerErrorCode, hint: impl Into<String>) -> Self {
        BankError::NotImplemented { code, hint: hint.into() }
    }

    pub fn taler_code(&self) -> TalerErrorCode {
        match self {
            BankError::Database(_) => TalerErrorCode::GenericInternalInvariantFailure,
            BankError::BadRequest { code, .. }
            | BankError::Unauthorized { code, .. }
            | BankError::Forbidden { code, .. }
            | BankError::NotFound { code, .. }
            | BankError::Conflict { code, .. }
            | BankError::NotImplemented { code, .. } => *code,
            BankError::TanRateLimited => TalerErrorCode::BankTanRateLimited,
            BankError::TanScriptFailed(_) => TalerErrorCode::BankTanChannelScriptFailed,
            BankError::SoftFailure => TalerErrorCode::BankSoftException,
            BankError::Internal(_) => TalerErrorCode::BankUnmanagedException,
        }
    }
}

impl From<AmountError> for BankError {
    fn from(err: AmountError) -> Self {
        let code = match err {
            AmountError::Overflow => TalerErrorCode::BankNumberTooBig,
            _ => TalerErrorCode::BankBadFormatAmount,
        };
        BankError::bad_request(code, err.to_string())
    }
}

impl From<PaytoError> for BankError {
    fn from(err: PaytoError) -> Self {
        BankError::bad_request(TalerErrorCode::GenericPaytoUriMalformed, err.to_string())
    }
}

impl From<Base32Error> for BankError {
    fn from(err: Base32Error) -> Self {
        BankError::bad_request(TalerErrorCode::GenericParameterMalformed, err.to_string())
    }
}

impl From<ConversionError> for BankError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::TooSmall => BankError::conflict(
                TalerErrorCode::BankConversionAmountToSmall,
                "amount too small after conversion",
            ),
            ConversionError::Amount(e) => e.into(),
        }
    }
}

impl actix_web::error::ResponseError for BankError {
    fn status_code(&self) -> StatusCode {
        match self {
            BankError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BankError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            BankError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            BankError::Forbidden { .. } => StatusCode::FORBIDDEN,
            BankError::NotFound { .. } => StatusCode::NOT_FOUND,
            BankError::Conflict { .. } => StatusCode::CONFLICT,
            BankError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            BankError::TanRateLimited => StatusCode::TOO_MANY_REQUESTS,
            BankError::TanScriptFailed(_) => StatusCode::BAD_GATEWAY,
            BankError::SoftFailure => StatusCode::INTERNAL_SERVER_ERROR,
            BankError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = self.taler_code();
        let mut builder = HttpResponse::build(self.status_code());
        if matches!(self, BankError::Unauthorized { .. }) {
            builder.insert_header(("WWW-Authenticate", "Basic realm=\"bank\", Bearer"));
        }
        builder.json(json!({
            "code": code,
            "hint": code.name(),
            "detail": self.to_string(),
        }))
    }
}

/// Map actix JSON extraction failures (malformed body, over the 4 KiB
/// limit) onto the Taler envelope instead of actix's plain-text default.
pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let bank_err = match &err {
        JsonPayloadError::OverflowKnownLength { .. } | JsonPayloadError::Overflow { .. } => {
            BankError::bad_request(
                TalerErrorCode::GenericUploadExceedsLimit,
                "request body exceeds the 4 KiB limit",
            )
        }
        _ => BankError::bad_request(TalerErrorCode::GenericJsonInvalid, err.to_string()),
    };
    bank_err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::ResponseError;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            BankError::conflict(TalerErrorCode::BankUnallowedDebit, "x").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(BankError::TanRateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            BankError::TanScriptFailed("exit 1".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(BankError::SoftFailure.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn amount_overflow_maps_to_number_too_big() {
        let err: BankError = AmountError::Overflow.into();
        assert_eq!(err.taler_code(), TalerErrorCode::BankNumberTooBig);
        let err: BankError = AmountError::InvalidFormat("x".to_string()).into();
        assert_eq!(err.taler_code(), TalerErrorCode::BankBadFormatAmount);
    }

    #[test]
    fn unauthorized_advertises_basic_realm() {
        let err = BankError::unauthorized(TalerErrorCode::GenericUnauthorized, "no");
        let resp = err.error_response();
        assert!(resp.headers().contains_key("WWW-Authenticate"));
    }
}
