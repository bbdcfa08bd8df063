//! TAN challenge endpoints and the 2FA gate used by sensitive handlers.

use super::{accounts, cashouts, transactions, withdrawals, AppState};
use crate::auth::{self, Identity};
use crate::database::challenges::{ChallengeOp, ChallengeSolveOutcome};
use crate::errors::{BankError, Result};
use crate::models::{
    AccountPasswordChange, AccountReconfiguration, CashoutRequest, ChallengeSolveRequest,
    CreateTransactionRequest, TanChannel, TanTransmission, TokenScope,
};
use crate::tan;
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::TalerErrorCode;
use chrono::Duration;
use uuid::Uuid;

fn tan_message(code: &str) -> String {
    format!("{} is your bank confirmation code", code)
}

/// Gate a sensitive operation behind a TAN challenge.
///
/// Returns `Ok(Some(202 response))` when a challenge was created and the
/// caller must stop; `Ok(None)` when the operation may proceed (no TAN
/// channel configured, or the admin exemption applies).
pub(crate) async fn tan_gate(
    state: &AppState,
    identity: &Identity,
    login: &str,
    op: ChallengeOp,
    body: &serde_json::Value,
) -> Result<Option<HttpResponse>> {
    let Some(account) = state.db.account_by_login(login).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    };
    let Some((channel_name, recipient)) = account.tan_address() else {
        return Ok(None);
    };
    if identity.is_admin && state.config.tan.admin_exempt {
        return Ok(None);
    }
    let channel: TanChannel = channel_name
        .parse()
        .map_err(|e: String| BankError::Internal(e))?;
    let recipient = recipient.to_string();

    let code = tan::generate_code();
    let challenge_id = state
        .db
        .challenge_create(
            login,
            op,
            &body.to_string(),
            &code,
            Duration::minutes(state.config.tan.validity_minutes),
            state.config.tan.code_retries,
        )
        .await?
        .ok_or_else(|| BankError::Internal("challenge insert lost its account".to_string()))?;

    let outgoing = state
        .db
        .challenge_mark_sent(
            challenge_id,
            &code,
            Duration::seconds(state.config.tan.retransmission_seconds),
        )
        .await?
        .unwrap_or(code);
    tan::dispatch(&state.config.tan, channel, &recipient, &tan_message(&outgoing)).await?;

    Ok(Some(HttpResponse::Accepted().json(TanTransmission {
        challenge_id,
        tan_channel: channel,
        tan_info: tan::mask_recipient(channel, &recipient),
    })))
}

/// `POST /accounts/{USERNAME}/challenge/{CID}` (re-send the code)
pub async fn resend_challenge(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> Result<HttpResponse> {
    let (username, challenge_id) = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, true).await?;

    let Some(challenge) = state.db.challenge_get(challenge_id, &username).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown challenge",
        ));
    };
    if challenge.confirmation_date.is_some() {
        return Err(BankError::conflict(
            TalerErrorCode::BankTanChallengeFailed,
            "challenge already solved",
        ));
    }

    let Some(account) = state.db.account_by_login(&username).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    };
    let Some((channel_name, recipient)) = account.tan_address() else {
        return Err(BankError::conflict(
            TalerErrorCode::BankMissingTanInfo,
            "account has no TAN channel",
        ));
    };
    let channel: TanChannel = channel_name
        .parse()
        .map_err(|e: String| BankError::Internal(e))?;
    let recipient = recipient.to_string();

    let fresh = tan::generate_code();
    let outgoing = state
        .db
        .challenge_mark_sent(
            challenge_id,
            &fresh,
            Duration::seconds(state.config.tan.retransmission_seconds),
        )
        .await?
        .ok_or_else(|| {
            BankError::not_found(TalerErrorCode::BankTransactionNotFound, "unknown challenge")
        })?;
    tan::dispatch(&state.config.tan, channel, &recipient, &tan_message(&outgoing)).await?;

    Ok(HttpResponse::Ok().json(TanTransmission {
        challenge_id,
        tan_channel: channel,
        tan_info: tan::mask_recipient(channel, &recipient),
    }))
}

/// `POST /accounts/{USERNAME}/challenge/{CID}/confirm`
pub async fn confirm_challenge(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
    payload: web::Json<ChallengeSolveRequest>,
) -> Result<HttpResponse> {
    let (username, challenge_id) = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, true).await?;

    match state
        .db
        .challenge_solve(challenge_id, &username, &payload.tan)
        .await?
    {
        ChallengeSolveOutcome::Success { op, body } => {
            replay(&state, &identity, &username, op, &body).await
        }
        ChallengeSolveOutcome::UnknownChallenge => Err(BankError::not_found(
            TalerErrorCode::BankTransactionNotFound,
            "unknown challenge",
        )),
        ChallengeSolveOutcome::AlreadySolved => Err(BankError::conflict(
            TalerErrorCode::BankTanChallengeFailed,
            "challenge already solved",
        )),
        ChallengeSolveOutcome::Expired => Err(BankError::conflict(
            TalerErrorCode::BankTanChallengeExpired,
            "challenge expired",
        )),
        ChallengeSolveOutcome::BadCode => Err(BankError::forbidden(
            TalerErrorCode::BankTanChallengeFailed,
            "wrong code",
        )),
        ChallengeSolveOutcome::NoRetry => Err(BankError::TanRateLimited),
    }
}

/// Re-execute the operation a solved challenge was wrapping.
async fn replay(
    state: &AppState,
    identity: &Identity,
    login: &str,
    op: ChallengeOp,
    body: &str,
) -> Result<HttpResponse> {
    let invalid = |e: serde_json::Error| {
        BankError::Internal(format!("stored challenge body unreadable: {e}"))
    };
    match op {
        ChallengeOp::AccountDelete => accounts::perform_delete_account(state, login).await,
        ChallengeOp::AccountReconfig => {
            let request: AccountReconfiguration = serde_json::from_str(body).map_err(invalid)?;
            accounts::perform_patch_account(state, login, request, identity.is_admin).await
        }
        ChallengeOp::AccountAuthReconfig => {
            let request: AccountPasswordChange = serde_json::from_str(body).map_err(invalid)?;
            accounts::perform_patch_auth(state, login, request, identity.is_admin).await
        }
        ChallengeOp::BankTransaction => {
            let request: CreateTransactionRequest = serde_json::from_str(body).map_err(invalid)?;
            transactions::perform_create_transaction(state, login, request).await
        }
        ChallengeOp::WithdrawalConfirm => {
            #[derive(serde::Deserialize)]
            struct Wrapped {
                withdrawal_id: Uuid,
            }
            let wrapped: Wrapped = serde_json::from_str(body).map_err(invalid)?;
            withdrawals::perform_confirm_withdrawal(state, wrapped.withdrawal_id).await
        }
        ChallengeOp::Cashout => {
            let request: CashoutRequest = serde_json::from_str(body).map_err(invalid)?;
            cashouts::perform_cashout(state, login, request).await
        }
    }
}
