//! Two-phase withdrawal endpoints: bank side and wallet integration side.

use super::challenges::tan_gate;
use super::AppState;
use crate::auth;
use crate::database::challenges::ChallengeOp;
use crate::database::withdrawals::{
    WithdrawalAbortOutcome, WithdrawalConfirmOutcome, WithdrawalCreationOutcome, WithdrawalRow,
    WithdrawalSelectionOutcome,
};
use crate::errors::{BankError, Result};
use crate::models::{
    BankAccountCreateWithdrawalRequest, BankAccountCreateWithdrawalResponse,
    BankWithdrawalOperationPostRequest, BankWithdrawalOperationPostResponse, TokenScope,
    WithdrawalPollParams, WithdrawalStatus,
};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::{base32, TalerErrorCode};
use std::time::Duration;
use uuid::Uuid;

fn withdrawal_status(row: &WithdrawalRow, currency: &str) -> Result<WithdrawalStatus> {
    Ok(WithdrawalStatus {
        status: row.state(),
        amount: row.amount(currency)?,
        username: row.login.clone(),
        sender_wire: row.internal_payto.clone(),
        selected_exchange_account: row.selected_exchange_payto.clone(),
        selected_reserve_pub: row.reserve_pub.clone(),
    })
}

/// `POST /accounts/{USERNAME}/withdrawals`
pub async fn create_withdrawal(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<BankAccountCreateWithdrawalRequest>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;

    let amount = payload.into_inner().amount;
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

    let uuid = Uuid::new_v4();
    match state.db.withdrawal_create(&username, uuid, &amount).await? {
        WithdrawalCreationOutcome::Success => {
            Ok(HttpResponse::Ok().json(BankAccountCreateWithdrawalResponse {
                withdrawal_id: uuid,
                taler_withdraw_uri: format!(
                    "taler://withdraw/{}/{}",
                    state.config.bank.hostname, uuid
                ),
            }))
        }
        WithdrawalCreationOutcome::UnknownAccount => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        WithdrawalCreationOutcome::AccountIsExchange => Err(BankError::conflict(
            TalerErrorCode::BankAccountIsExchange,
            "exchange accounts cannot withdraw",
        )),
        WithdrawalCreationOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance",
        )),
    }
}

/// `GET /withdrawals/{WID}` (wallet integration, long-pollable)
pub async fn get_withdrawal(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<WithdrawalPollParams>,
) -> Result<HttpResponse> {
    let uuid = path.into_inner();
    let long_poll = query.long_poll_ms.map(Duration::from_millis);
    let Some(row) = state
        .db
        .withdrawal_poll(uuid, query.old_state, long_poll)
        .await?
    else {
        return Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown withdrawal operation",
        ));
    };
    Ok(HttpResponse::Ok().json(withdrawal_status(&row, &state.config.bank.currency)?))
}

/// `POST /withdrawals/{WID}` (wallet selects reserve key and exchange)
pub async fn select_withdrawal(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    payload: web::Json<BankWithdrawalOperationPostRequest>,
) -> Result<HttpResponse> {
    let uuid = path.into_inner();
    let request = payload.into_inner();
    base32::decode32(&request.reserve_pub).map_err(|_| {
        BankError::bad_request(
            TalerErrorCode::GenericParameterMalformed,
            "reserve_pub must be a 32-byte Crockford Base32 value",
        )
    })?;

    let outcome = state
        .db
        .withdrawal_select(uuid, &request.reserve_pub, &request.selected_exchange.canonical())
        .await?;
    match outcome {
        WithdrawalSelectionOutcome::Success { state: status } => {
            let confirm_transfer_url = state
                .config
                .bank
                .base_url
                .as_ref()
                .map(|base| format!("{}/confirm-withdrawal/{}", base.trim_end_matches('/'), uuid));
            Ok(HttpResponse::Ok().json(BankWithdrawalOperationPostResponse {
                status,
                confirm_transfer_url,
            }))
        }
        WithdrawalSelectionOutcome::UnknownOperation => Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown withdrawal operation",
        )),
        WithdrawalSelectionOutcome::AlreadyAborted => Err(BankError::conflict(
            TalerErrorCode::BankWithdrawalOperationAborted,
            "withdrawal operation was aborted",
        )),
        WithdrawalSelectionOutcome::SelectionConflict => Err(BankError::conflict(
            TalerErrorCode::BankReserveSelectionConflict,
            "withdrawal already selected with different parameters",
        )),
        WithdrawalSelectionOutcome::ReservePubReuse => Err(BankError::conflict(
            TalerErrorCode::BankDuplicateReservePubSubject,
            "reserve public key already used",
        )),
    }
}

async fn owned_withdrawal(
    state: &AppState,
    login: &str,
    uuid: Uuid,
) -> Result<WithdrawalRow> {
    let Some(row) = state.db.withdrawal_get(uuid).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown withdrawal operation",
        ));
    };
    if row.login != login {
        return Err(BankError::forbidden(
            TalerErrorCode::GenericUnauthorized,
            "withdrawal belongs to another account",
        ));
    }
    Ok(row)
}

pub(crate) async fn perform_confirm_withdrawal(
    state: &AppState,
    uuid: Uuid,
) -> Result<HttpResponse> {
    match state.db.withdrawal_confirm(uuid).await? {
        WithdrawalConfirmOutcome::Success => Ok(HttpResponse::NoContent().finish()),
        WithdrawalConfirmOutcome::UnknownOperation => Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown withdrawal operation",
        )),
        WithdrawalConfirmOutcome::NotSelected => Err(BankError::conflict(
            TalerErrorCode::BankConfirmIncomplete,
            "withdrawal has no exchange selection yet",
        )),
        WithdrawalConfirmOutcome::AlreadyAborted => Err(BankError::conflict(
            TalerErrorCode::BankConfirmAbortConflict,
            "withdrawal operation was aborted",
        )),
        WithdrawalConfirmOutcome::UnknownExchange => Err(BankError::conflict(
            TalerErrorCode::BankUnknownCreditor,
            "selected exchange is unknown or not an exchange account",
        )),
        WithdrawalConfirmOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance",
        )),
    }
}

/// `POST /accounts/{USERNAME}/withdrawals/{WID}/confirm`
pub async fn confirm_withdrawal(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, Uuid)>,
) -> Result<HttpResponse> {
    let (username, uuid) = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;
    owned_withdrawal(&state, &username, uuid).await?;

    let body = serde_json::json!({ "withdrawal_id": uuid });
    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::WithdrawalConfirm, &body).await?
    {
        return Ok(challenge);
    }
    perform_confirm_withdrawal(&state, uuid).await
}

/// `POST /accounts/{USERNAME}/withdrawals/{WID}/abort`
pub async fn abort_withdrawal(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, Uuid)>,
) -> Result<HttpResponse> {
    let (username, uuid) = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;
    owned_withdrawal(&state, &username, uuid).await?;

    match state.db.withdrawal_abort(uuid).await? {
        WithdrawalAbortOutcome::Success => Ok(HttpResponse::NoContent().finish()),
        WithdrawalAbortOutcome::UnknownOperation => Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown withdrawal operation",
        )),
        WithdrawalAbortOutcome::AlreadyConfirmed => Err(BankError::conflict(
            TalerErrorCode::BankAbortConfirmConflict,
            "withdrawal was already confirmed",
        )),
    }
}
