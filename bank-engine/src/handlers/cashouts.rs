//! Cashout endpoints (regional -> fiat conversion, TAN gated).

use super::challenges::tan_gate;
use super::AppState;
use crate::auth;
use crate::database::cashouts::CashoutCreationOutcome;
use crate::database::challenges::ChallengeOp;
use crate::errors::{BankError, Result};
use crate::models::{
    CashoutInfo, CashoutRequest, CashoutResponse, CashoutStatusResponse, Cashouts, Timestamp,
    TokenScope,
};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::conversion::ConversionRate;
use bank_core::TalerErrorCode;

async fn require_conversion(state: &AppState) -> Result<(ConversionRate, String)> {
    let Some(fiat) = state.config.bank.fiat_currency.clone() else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion is not enabled",
        ));
    };
    let Some(rate) = state.db.conversion_rate_get().await? else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion rate not configured",
        ));
    };
    Ok((rate, fiat))
}

pub(crate) async fn perform_cashout(
    state: &AppState,
    login: &str,
    request: CashoutRequest,
) -> Result<HttpResponse> {
    let (rate, fiat) = require_conversion(state).await?;

    if request.amount_debit.currency() != state.config.bank.currency {
        return Err(BankError::bad_request(
            TalerErrorCode::GenericCurrencyMismatch,
            "amount_debit must use the regional currency",
        ));
    }
    if request.amount_credit.currency() != fiat {
        return Err(BankError::bad_request(
            TalerErrorCode::GenericCurrencyMismatch,
            "amount_credit must use the fiat currency",
        ));
    }

    let expected_credit = rate.to_cashout(&request.amount_debit)?;
    if expected_credit != request.amount_credit {
        return Err(BankError::conflict(
            TalerErrorCode::BankBadConversion,
            "amount_credit does not match the current conversion rate",
        ));
    }

    let subject = request.subject.as_deref().unwrap_or("Cashout").to_string();
    let outcome = state
        .db
        .cashout_create(
            login,
            &request.request_uid,
            &request.amount_debit,
            &request.amount_credit,
            &subject,
        )
        .await?;
    match outcome {
        CashoutCreationOutcome::Success { cashout_id } => {
            Ok(HttpResponse::Ok().json(CashoutResponse { cashout_id }))
        }
        CashoutCreationOutcome::UnknownAccount => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        CashoutCreationOutcome::RequestUidReuse => Err(BankError::conflict(
            TalerErrorCode::BankRequestUidReuse,
            "request_uid used with different parameters",
        )),
        CashoutCreationOutcome::UnderMin => Err(BankError::conflict(
            TalerErrorCode::BankConversionAmountToSmall,
            "amount below the account's cashout minimum",
        )),
        CashoutCreationOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance",
        )),
        CashoutCreationOutcome::NoExchangeAccount => Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "no exchange account to settle cashouts against",
        )),
    }
}

/// `POST /accounts/{USERNAME}/cashouts`
pub async fn create_cashout(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<serde_json::Value>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;
    let body = payload.into_inner();
    let request: CashoutRequest = serde_json::from_value(body.clone())
        .map_err(|e| BankError::bad_request(TalerErrorCode::GenericJsonInvalid, e.to_string()))?;

    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::Cashout, &body).await?
    {
        return Ok(challenge);
    }
    perform_cashout(&state, &username, request).await
}

/// `GET /accounts/{USERNAME}/cashouts/{CASHOUT_ID}`
pub async fn get_cashout(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> Result<HttpResponse> {
    let (username, cashout_id) = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, true).await?;
    let Some(fiat) = state.config.bank.fiat_currency.as_deref() else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion is not enabled",
        ));
    };
    let Some(row) = state.db.cashout_get(&username, cashout_id).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown cashout",
        ));
    };
    Ok(HttpResponse::Ok().json(CashoutStatusResponse {
        status: row.status.clone(),
        amount_debit: row.amount_debit(&state.config.bank.currency)?,
        amount_credit: row.amount_credit(fiat)?,
        subject: row.subject.clone(),
        creation_time: Timestamp::from(row.created_at),
    }))
}

/// `GET /accounts/{USERNAME}/cashouts`
pub async fn list_cashouts(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, true).await?;
    let rows = state.db.cashouts_list(Some(&username)).await?;
    Ok(HttpResponse::Ok().json(Cashouts {
        cashouts: rows
            .into_iter()
            .map(|row| CashoutInfo {
                cashout_id: row.cashout_id,
                username: row.login,
            })
            .collect(),
    }))
}

/// `GET /cashouts` (admin)
pub async fn list_all_cashouts(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let identity = auth::authenticate(&state.db, &req, TokenScope::ReadOnly).await?;
    auth::require_admin(&identity)?;
    let rows = state.db.cashouts_list(None).await?;
    Ok(HttpResponse::Ok().json(Cashouts {
        cashouts: rows
            .into_iter()
            .map(|row| CashoutInfo {
                cashout_id: row.cashout_id,
                username: row.login,
            })
            .collect(),
    }))
}
