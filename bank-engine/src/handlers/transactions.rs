//! Core-bank transaction endpoints.

use super::challenges::tan_gate;
use super::{history_args, AppState};
use crate::auth;
use crate::database::challenges::ChallengeOp;
use crate::database::ledger::{BankTransactionRow, TransferOutcome};
use crate::errors::{BankError, Result};
use crate::models::{
    BankAccountTransactionInfo, BankAccountTransactionsResponse, CreateTransactionRequest,
    CreateTransactionResponse, CreditDebitIndicator, HistoryParams, Timestamp, TokenScope,
};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::{PaytoUri, TalerErrorCode};

pub(crate) fn tx_info(row: &BankTransactionRow, currency: &str) -> Result<BankAccountTransactionInfo> {
    Ok(BankAccountTransactionInfo {
        creditor_payto_uri: row.creditor_payto.clone(),
        debtor_payto_uri: row.debtor_payto.clone(),
        amount: row.amount(currency)?,
        direction: if row.direction == "credit" {
            CreditDebitIndicator::Credit
        } else {
            CreditDebitIndicator::Debit
        },
        subject: row.subject.clone(),
        row_id: row.row_id,
        date: Timestamp::from(row.transaction_date),
    })
}

/// `GET /accounts/{USERNAME}/transactions`
pub async fn get_transactions(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<HistoryParams>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, true).await?;
    let (start, delta, long_poll) = history_args(&query)?;

    let Some(rows) = state
        .db
        .transaction_history(&username, start, delta, long_poll)
        .await?
    else {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    };
    let currency = &state.config.bank.currency;
    let transactions = rows
        .iter()
        .map(|row| tx_info(row, currency))
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(BankAccountTransactionsResponse { transactions }))
}

/// `GET /accounts/{USERNAME}/transactions/{T_ID}`
pub async fn get_transaction(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> Result<HttpResponse> {
    let (username, tid) = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, true).await?;
    let Some(row) = state.db.transaction_by_id(&username, tid).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown transaction",
        ));
    };
    Ok(HttpResponse::Ok().json(tx_info(&row, &state.config.bank.currency)?))
}

pub(crate) async fn perform_create_transaction(
    state: &AppState,
    login: &str,
    request: CreateTransactionRequest,
) -> Result<HttpResponse> {
    let (payto, params) = PaytoUri::parse(&request.payto_uri)?;
    let subject = params.message.filter(|s| !s.is_empty()).ok_or_else(|| {
        BankError::bad_request(
            TalerErrorCode::GenericParameterMissing,
            "missing message (subject) in payto URI",
        )
    })?;
    let amount = request.amount.or(params.amount).ok_or_else(|| {
        BankError::bad_request(TalerErrorCode::GenericParameterMissing, "missing amount")
    })?;
    if amount.currency() != state.config.bank.currency {
        return Err(BankError::bad_request(
            TalerErrorCode::GenericCurrencyMismatch,
            "amount must use the regional currency",
        ));
    }
    if amount.is_zero() {
        return Err(BankError::bad_request(
            TalerErrorCode::BankBadFormatAmount,
            "amount must be positive",
        ));
    }

    let outcome = state
        .db
        .create_transaction(
            login,
            &payto.canonical(),
            &subject,
            &amount,
            request.request_uid.as_deref(),
        )
        .await?;
    match outcome {
        TransferOutcome::Success(result) => Ok(HttpResponse::Ok().json(CreateTransactionResponse {
            row_id: result.debit_row_id,
        })),
        TransferOutcome::UnknownDebtor => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        TransferOutcome::UnknownCreditor => Err(BankError::conflict(
            TalerErrorCode::BankUnknownCreditor,
            "creditor account is not at this bank",
        )),
        TransferOutcome::BothPartySame => Err(BankError::conflict(
            TalerErrorCode::BankSameAccount,
            "cannot transfer to the same account",
        )),
        TransferOutcome::AdminCreditor => Err(BankError::conflict(
            TalerErrorCode::BankAdminCreditor,
            "the admin account cannot receive transfers",
        )),
        TransferOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance",
        )),
        TransferOutcome::RequestUidReuse => Err(BankError::conflict(
            TalerErrorCode::BankRequestUidReuse,
            "request_uid used with different parameters",
        )),
    }
}

/// `POST /accounts/{USERNAME}/transactions`
pub async fn create_transaction(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<serde_json::Value>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;
    let body = payload.into_inner();
    let request: CreateTransactionRequest = serde_json::from_value(body.clone())
        .map_err(|e| BankError::bad_request(TalerErrorCode::GenericJsonInvalid, e.to_string()))?;

    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::BankTransaction, &body).await?
    {
        return Ok(challenge);
    }
    perform_create_transaction(&state, &username, request).await
}
