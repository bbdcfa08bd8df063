//! Wire Gateway and Revenue API handlers (exchange- and merchant-facing).

use super::{history_args, AppState};
use crate::auth;
use crate::database::gateway::{
    parse_incoming_subject, parse_outgoing_subject, AddIncomingOutcome, WireTransferOutcome,
};
use crate::errors::{BankError, Result};
use crate::models::{
    AddIncomingRequest, AddIncomingResponse, HistoryParams, IncomingBankTransaction,
    IncomingHistory, OutgoingBankTransaction, OutgoingHistory, RevenueConfig,
    RevenueIncomingBankTransaction, RevenueIncomingHistory, Timestamp, TokenScope,
    TransferRequest, TransferResponse, WireGatewayConfig,
};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::{base32, TalerErrorCode};
use validator::Validate;

const PROTOCOL_VERSION: &str = "0:0:0";

/// `GET [/accounts/{USERNAME}]/taler-wire-gateway/config`
pub async fn wire_gateway_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(WireGatewayConfig {
        name: "taler-wire-gateway",
        version: PROTOCOL_VERSION,
        currency: state.config.bank.currency.clone(),
    })
}

fn check_regional(state: &AppState, amount: &bank_core::Amount) -> Result<()> {
    if amount.currency() != state.config.bank.currency {
        return Err(BankError::bad_request(
            TalerErrorCode::GenericCurrencyMismatch,
            "amount must use the regional currency",
        ));
    }
    Ok(())
}

/// `POST /accounts/{USERNAME}/taler-wire-gateway/transfer`
pub async fn transfer(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<TransferRequest>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;

    let request = payload.into_inner();
    request.validate().map_err(|e| {
        BankError::bad_request(TalerErrorCode::GenericParameterMalformed, e.to_string())
    })?;
    base32::decode32(&request.wtid).map_err(|_| {
        BankError::bad_request(
            TalerErrorCode::GenericParameterMalformed,
            "wtid must be a 32-byte Crockford Base32 value",
        )
    })?;
    check_regional(&state, &request.amount)?;

    let outcome = state
        .db
        .wire_transfer(
            &username,
            &request.request_uid,
            &request.amount,
            &request.exchange_base_url,
            &request.wtid,
            &request.credit_account.canonical(),
        )
        .await?;
    match outcome {
        WireTransferOutcome::Success { row_id, timestamp } => {
            Ok(HttpResponse::Ok().json(TransferResponse {
                row_id,
                timestamp: Timestamp::from(timestamp),
            }))
        }
        WireTransferOutcome::RequestUidReuse => Err(BankError::conflict(
            TalerErrorCode::BankTransferRequestUidReused,
            "request_uid used with different parameters",
        )),
        WireTransferOutcome::NotAnExchange => Err(BankError::conflict(
            TalerErrorCode::BankAccountIsNotExchange,
            "only exchange accounts may use the wire gateway",
        )),
        WireTransferOutcome::UnknownCreditor => Err(BankError::conflict(
            TalerErrorCode::BankUnknownCreditor,
            "credit account is not at this bank",
        )),
        WireTransferOutcome::BothPartySame => Err(BankError::conflict(
            TalerErrorCode::BankSameAccount,
            "cannot wire to the exchange itself",
        )),
        WireTransferOutcome::AdminCreditor => Err(BankError::conflict(
            TalerErrorCode::BankAdminCreditor,
            "the admin account cannot receive transfers",
        )),
        WireTransferOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance",
        )),
    }
}

/// `POST /accounts/{USERNAME}/taler-wire-gateway/admin/add-incoming`
pub async fn add_incoming(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<AddIncomingRequest>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, false).await?;

    let request = payload.into_inner();
    base32::decode32(&request.reserve_pub).map_err(|_| {
        BankError::bad_request(
            TalerErrorCode::GenericParameterMalformed,
            "reserve_pub must be a 32-byte Crockford Base32 value",
        )
    })?;
    check_regional(&state, &request.amount)?;

    let outcome = state
        .db
        .wire_add_incoming(
            &username,
            &request.amount,
            &request.reserve_pub,
            &request.debit_account.canonical(),
        )
        .await?;
    match outcome {
        AddIncomingOutcome::Success { row_id, timestamp } => {
            Ok(HttpResponse::Ok().json(AddIncomingResponse {
                row_id,
                timestamp: Timestamp::from(timestamp),
            }))
        }
        AddIncomingOutcome::NotAnExchange => Err(BankError::conflict(
            TalerErrorCode::BankAccountIsNotExchange,
            "only exchange accounts may use the wire gateway",
        )),
        AddIncomingOutcome::UnknownDebtor => Err(BankError::conflict(
            TalerErrorCode::BankUnknownDebtor,
            "debit account is not at this bank",
        )),
        AddIncomingOutcome::BothPartySame => Err(BankError::conflict(
            TalerErrorCode::BankSameAccount,
            "debit account must differ from the exchange",
        )),
        AddIncomingOutcome::ReservePubReuse => Err(BankError::conflict(
            TalerErrorCode::BankDuplicateReservePubSubject,
            "reserve public key already used",
        )),
        AddIncomingOutcome::BalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "insufficient balance on the debit account",
        )),
    }
}

/// `GET /accounts/{USERNAME}/taler-wire-gateway/history/incoming`
pub async fn history_incoming(
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
        .gateway_history(&username, "credit", start, delta, long_poll)
        .await?
    else {
        return Err(BankError::conflict(
            TalerErrorCode::BankAccountIsNotExchange,
            "account is not an exchange",
        ));
    };
    let currency = &state.config.bank.currency;
    let account = state
        .db
        .account_by_login(&username)
        .await?
        .ok_or_else(|| BankError::not_found(TalerErrorCode::BankUnknownAccount, "unknown account"))?;

    let incoming_transactions = rows
        .iter()
        .map(|row| {
            let reserve_pub = parse_incoming_subject(&row.subject)
                .ok_or_else(|| {
                    BankError::Internal("subject-filtered row lost its reserve pub".to_string())
                })?
                .to_string();
            Ok(IncomingBankTransaction {
                row_id: row.row_id,
                date: Timestamp::from(row.transaction_date),
                amount: row.amount(currency)?,
                debit_account: row.debtor_payto.clone(),
                reserve_pub,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(IncomingHistory {
        incoming_transactions,
        credit_account: account.internal_payto,
    }))
}

/// `GET /accounts/{USERNAME}/taler-wire-gateway/history/outgoing`
pub async fn history_outgoing(
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
        .gateway_history(&username, "debit", start, delta, long_poll)
        .await?
    else {
        return Err(BankError::conflict(
            TalerErrorCode::BankAccountIsNotExchange,
            "account is not an exchange",
        ));
    };
    let currency = &state.config.bank.currency;
    let account = state
        .db
        .account_by_login(&username)
        .await?
        .ok_or_else(|| BankError::not_found(TalerErrorCode::BankUnknownAccount, "unknown account"))?;

    let outgoing_transactions = rows
        .iter()
        .map(|row| {
            let (wtid, url) = parse_outgoing_subject(&row.subject).ok_or_else(|| {
                BankError::Internal("subject-filtered row lost its wtid".to_string())
            })?;
            Ok(OutgoingBankTransaction {
                row_id: row.row_id,
                date: Timestamp::from(row.transaction_date),
                amount: row.amount(currency)?,
                credit_account: row.creditor_payto.clone(),
                wtid: wtid.to_string(),
                exchange_base_url: url.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(OutgoingHistory {
        outgoing_transactions,
        debit_account: account.internal_payto,
    }))
}

/// `GET /accounts/{USERNAME}/taler-revenue/config`
pub async fn revenue_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(RevenueConfig {
        name: "taler-revenue",
        version: PROTOCOL_VERSION,
        currency: state.config.bank.currency.clone(),
    })
}

/// `GET /accounts/{USERNAME}/taler-revenue/history`
pub async fn revenue_history(
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
        .revenue_history(&username, start, delta, long_poll)
        .await?
    else {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    };
    let currency = &state.config.bank.currency;
    let account = state
        .db
        .account_by_login(&username)
        .await?
        .ok_or_else(|| BankError::not_found(TalerErrorCode::BankUnknownAccount, "unknown account"))?;

    let incoming_transactions = rows
        .iter()
        .map(|row| {
            Ok(RevenueIncomingBankTransaction {
                row_id: row.row_id,
                date: Timestamp::from(row.transaction_date),
                amount: row.amount(currency)?,
                debit_account: row.debtor_payto.clone(),
                subject: row.subject.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(RevenueIncomingHistory {
        incoming_transactions,
        credit_account: account.internal_payto,
    }))
}
