//! Account lifecycle handlers and bearer-token endpoints.

use super::challenges::tan_gate;
use super::AppState;
use crate::auth;
use crate::database::accounts::{
    AccountCreationOutcome, AccountDeletionOutcome, AccountPatch, AccountPatchOutcome,
    AccountRow, CreateAccountArgs, PasswordChangeOutcome,
};
use crate::database::challenges::ChallengeOp;
use crate::errors::{BankError, Result};
use crate::models::{
    AccountData, AccountMinimalData, AccountPasswordChange, AccountReconfiguration, BalanceJson,
    ContactDataResponse, CreditDebitIndicator, ListBankAccountsResponse, PatchField,
    PublicAccount, PublicAccountsResponse, RegisterAccountRequest, RegisterAccountResponse,
    Timestamp, TokenRequest, TokenScope, TokenSuccessResponse,
};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::{base32, TalerErrorCode};
use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::info;
use validator::Validate;

/// Names that can never be registered or deleted by customers.
pub(crate) fn is_reserved_name(login: &str, conversion_enabled: bool) -> bool {
    matches!(login, "admin" | "bank") || (conversion_enabled && login == "exchange")
}

fn balance_json(account: &AccountRow, currency: &str) -> Result<BalanceJson> {
    Ok(BalanceJson {
        amount: account.balance_amount(currency)?,
        credit_debit_indicator: if account.has_debt {
            CreditDebitIndicator::Debit
        } else {
            CreditDebitIndicator::Credit
        },
    })
}

fn account_data(account: &AccountRow, currency: &str) -> Result<AccountData> {
    let contact = if account.email.is_some() || account.phone.is_some() {
        Some(ContactDataResponse {
            email: account.email.clone(),
            phone: account.phone.clone(),
        })
    } else {
        None
    };
    Ok(AccountData {
        username: account.login.clone(),
        name: account.name.clone(),
        payto_uri: account.internal_payto.clone(),
        balance: balance_json(account, currency)?,
        debit_threshold: account.debit_threshold(currency)?,
        min_cashout: account.min_cashout(currency)?,
        contact_data: contact,
        cashout_payto_uri: account.cashout_payto.clone(),
        tan_channel: account
            .tan_channel
            .as_deref()
            .and_then(|c| c.parse().ok()),
        is_public: account.is_public,
        is_taler_exchange: account.is_taler_exchange,
    })
}

fn check_tan_channel_supported(state: &AppState, channel: &str) -> Result<()> {
    if state.config.supported_tan_channels().iter().any(|c| *c == channel) {
        return Ok(());
    }
    Err(BankError::bad_request(
        TalerErrorCode::BankTanChannelNotSupported,
        format!("TAN channel {channel:?} is not configured"),
    ))
}

/// `POST /accounts`
pub async fn create_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<RegisterAccountRequest>,
) -> Result<HttpResponse> {
    let request = payload.into_inner();
    request.validate().map_err(|e| {
        BankError::bad_request(TalerErrorCode::GenericParameterMalformed, e.to_string())
    })?;

    let is_admin = if !state.config.bank.allow_registrations {
        let identity = auth::authenticate(&state.db, &req, TokenScope::ReadWrite).await?;
        auth::require_admin(&identity)?;
        true
    } else if req.headers().contains_key("Authorization") {
        auth::authenticate(&state.db, &req, TokenScope::ReadWrite)
            .await?
            .is_admin
    } else {
        false
    };

    let conversion = state.config.conversion_enabled();
    match request.username.as_str() {
        "admin" | "bank" => {
            return Err(BankError::conflict(
                TalerErrorCode::BankReservedUsernameConflict,
                "reserved username",
            ))
        }
        "exchange" if conversion && !request.is_taler_exchange => {
            return Err(BankError::conflict(
                TalerErrorCode::BankReservedUsernameConflict,
                "the exchange account must be a Taler exchange",
            ))
        }
        _ => {}
    }

    if !is_admin
        && (request.debit_threshold.is_some()
            || request.min_cashout.is_some()
            || request.tan_channel.is_some())
    {
        return Err(BankError::forbidden(
            TalerErrorCode::BankNonAdminPatchDebtLimit,
            "only admin may set limits or the TAN channel",
        ));
    }

    let currency = state.config.bank.currency.as_str();
    if let Some(threshold) = &request.debit_threshold {
        if threshold.currency() != currency {
            return Err(BankError::bad_request(
                TalerErrorCode::GenericCurrencyMismatch,
                "debit threshold must use the regional currency",
            ));
        }
    }
    if let Some(min) = &request.min_cashout {
        if min.currency() != currency {
            return Err(BankError::bad_request(
                TalerErrorCode::GenericCurrencyMismatch,
                "min cashout must use the regional currency",
            ));
        }
    }

    let (email, phone) = match request.contact_data {
        Some(contact) => (contact.email.apply(None), contact.phone.apply(None)),
        None => (None, None),
    };
    if let Some(channel) = &request.tan_channel {
        let channel = channel.to_string();
        check_tan_channel_supported(&state, &channel)?;
        let addressable = match channel.as_str() {
            "sms" => phone.is_some(),
            _ => email.is_some(),
        };
        if !addressable {
            return Err(BankError::conflict(
                TalerErrorCode::BankMissingTanInfo,
                "TAN channel has no matching contact address",
            ));
        }
    }

    let password_hash = auth::hash_password(request.password).await?;
    let args = CreateAccountArgs {
        login: request.username.clone(),
        password_hash,
        name: request.name,
        internal_payto: request.payto_uri.map(|p| p.canonical()),
        cashout_payto: request.cashout_payto_uri.map(|p| p.canonical()),
        email,
        phone,
        is_public: request.is_public,
        is_taler_exchange: request.is_taler_exchange,
        debit_threshold: request
            .debit_threshold
            .unwrap_or_else(|| state.config.bank.default_debit_threshold.clone()),
        min_cashout: request.min_cashout,
        tan_channel: request.tan_channel.map(|c| c.to_string()),
        registration_bonus: state.config.bank.registration_bonus.clone(),
        wire_type: state.config.bank.wire_type.clone(),
        iban_country: state.config.bank.iban_country.clone(),
        hostname: state.config.bank.hostname.clone(),
    };

    match state.db.account_create(&args).await? {
        AccountCreationOutcome::Success { internal_payto } => {
            info!("registered account {:?}", request.username);
            Ok(HttpResponse::Created().json(RegisterAccountResponse {
                internal_payto_uri: internal_payto,
            }))
        }
        AccountCreationOutcome::LoginReuse => Err(BankError::conflict(
            TalerErrorCode::BankRegisterUsernameReuse,
            "username already taken",
        )),
        AccountCreationOutcome::PaytoReuse => Err(BankError::conflict(
            TalerErrorCode::BankRegisterPaytoUriReuse,
            "payto URI already taken",
        )),
        AccountCreationOutcome::BonusBalanceInsufficient => Err(BankError::conflict(
            TalerErrorCode::BankUnallowedDebit,
            "admin balance cannot cover the registration bonus",
        )),
    }
}

/// `GET /accounts/{USERNAME}`
pub async fn get_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, true).await?;
    let Some(account) = state.db.account_by_login(&username).await? else {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    };
    Ok(HttpResponse::Ok().json(account_data(&account, &state.config.bank.currency)?))
}

/// `GET /accounts` (admin listing)
pub async fn list_accounts(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<FilterQuery>,
) -> Result<HttpResponse> {
    let identity = auth::authenticate(&state.db, &req, TokenScope::ReadOnly).await?;
    auth::require_admin(&identity)?;
    let currency = &state.config.bank.currency;
    let (start, limit) = query.page();
    let rows = state
        .db
        .accounts_admin(query.filter.as_deref(), start, limit)
        .await?;
    let accounts = rows
        .iter()
        .map(|row| {
            Ok(AccountMinimalData {
                username: row.login.clone(),
                name: row.name.clone(),
                payto_uri: row.internal_payto.clone(),
                balance: balance_json(row, currency)?,
                debit_threshold: row.debit_threshold(currency)?,
                is_public: row.is_public,
                is_taler_exchange: row.is_taler_exchange,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(ListBankAccountsResponse { accounts }))
}

/// `GET /public-accounts`
pub async fn list_public_accounts(
    state: web::Data<AppState>,
    query: web::Query<FilterQuery>,
) -> Result<HttpResponse> {
    let currency = &state.config.bank.currency;
    let (start, limit) = query.page();
    let rows = state
        .db
        .accounts_public(query.filter.as_deref(), start, limit)
        .await?;
    let public_accounts = rows
        .iter()
        .map(|row| {
            Ok(PublicAccount {
                username: row.login.clone(),
                payto_uri: row.internal_payto.clone(),
                balance: balance_json(row, currency)?,
                is_taler_exchange: row.is_taler_exchange,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(HttpResponse::Ok().json(PublicAccountsResponse { public_accounts }))
}

#[derive(Debug, serde::Deserialize)]
pub struct FilterQuery {
    pub filter: Option<String>,
    pub start: Option<i64>,
    pub delta: Option<i64>,
}

impl FilterQuery {
    fn page(&self) -> (i64, i64) {
        let limit = self.delta.unwrap_or(20).clamp(1, 1024);
        (self.start.unwrap_or(0), limit)
    }
}

pub(crate) async fn perform_patch_account(
    state: &AppState,
    login: &str,
    request: AccountReconfiguration,
    is_admin: bool,
) -> Result<HttpResponse> {
    if login == "admin" {
        if request.is_public == Some(true) {
            return Err(BankError::conflict(
                TalerErrorCode::BankPatchAdminExchange,
                "the admin account cannot be public",
            ));
        }
    }
    if let PatchField::Set(channel) = &request.tan_channel {
        check_tan_channel_supported(state, &channel.to_string())?;
    }
    if let Some(threshold) = &request.debit_threshold {
        if threshold.currency() != state.config.bank.currency {
            return Err(BankError::bad_request(
                TalerErrorCode::GenericCurrencyMismatch,
                "debit threshold must use the regional currency",
            ));
        }
    }

    let patch = AccountPatch {
        name: request.name,
        is_public: request.is_public,
        debit_threshold: request.debit_threshold,
        cashout_payto: match request.cashout_payto_uri {
            PatchField::Keep => PatchField::Keep,
            PatchField::Clear => PatchField::Clear,
            PatchField::Set(p) => PatchField::Set(p.canonical()),
        },
        email: request
            .contact_data
            .as_ref()
            .map(|c| c.email.clone())
            .unwrap_or_default(),
        phone: request
            .contact_data
            .as_ref()
            .map(|c| c.phone.clone())
            .unwrap_or_default(),
        min_cashout: request.min_cashout,
        tan_channel: match request.tan_channel {
            PatchField::Keep => PatchField::Keep,
            PatchField::Clear => PatchField::Clear,
            PatchField::Set(c) => PatchField::Set(c.to_string()),
        },
    };

    let outcome = state
        .db
        .account_reconfig(
            login,
            &patch,
            is_admin,
            state.config.bank.allow_edit_name,
            state.config.bank.allow_edit_cashout_payto_uri,
        )
        .await?;
    match outcome {
        AccountPatchOutcome::Success => Ok(HttpResponse::NoContent().finish()),
        AccountPatchOutcome::UnknownAccount => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        AccountPatchOutcome::NonAdminLegalName => Err(BankError::forbidden(
            TalerErrorCode::BankNonAdminPatchLegalName,
            "only admin may change the legal name",
        )),
        AccountPatchOutcome::NonAdminCashout => Err(BankError::forbidden(
            TalerErrorCode::BankNonAdminPatchCashout,
            "only admin may change the cashout account",
        )),
        AccountPatchOutcome::NonAdminDebtLimit => Err(BankError::forbidden(
            TalerErrorCode::BankNonAdminPatchDebtLimit,
            "only admin may change the debit threshold",
        )),
        AccountPatchOutcome::NonAdminMinCashout => Err(BankError::forbidden(
            TalerErrorCode::BankNonAdminPatchCashout,
            "only admin may change the cashout minimum",
        )),
        AccountPatchOutcome::MissingTanInfo => Err(BankError::conflict(
            TalerErrorCode::BankMissingTanInfo,
            "TAN channel has no matching contact address",
        )),
    }
}

/// `PATCH /accounts/{USERNAME}`
pub async fn patch_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<serde_json::Value>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, true).await?;
    let body = payload.into_inner();
    let request: AccountReconfiguration = serde_json::from_value(body.clone())
        .map_err(|e| BankError::bad_request(TalerErrorCode::GenericJsonInvalid, e.to_string()))?;

    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::AccountReconfig, &body).await?
    {
        return Ok(challenge);
    }
    perform_patch_account(&state, &username, request, identity.is_admin).await
}

pub(crate) async fn perform_patch_auth(
    state: &AppState,
    login: &str,
    request: AccountPasswordChange,
    is_admin: bool,
) -> Result<HttpResponse> {
    let new_hash = auth::hash_password(request.new_password).await?;
    let outcome = state
        .db
        .account_reconfig_password(login, &new_hash, request.old_password.as_deref(), is_admin)
        .await?;
    match outcome {
        PasswordChangeOutcome::Success => Ok(HttpResponse::NoContent().finish()),
        PasswordChangeOutcome::UnknownAccount => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        PasswordChangeOutcome::OldPasswordMismatch => Err(BankError::conflict(
            TalerErrorCode::BankLoginFailed,
            "old password does not match",
        )),
        PasswordChangeOutcome::OldPasswordRequired => Err(BankError::conflict(
            TalerErrorCode::BankLoginFailed,
            "old password required",
        )),
    }
}

/// `PATCH /accounts/{USERNAME}/auth`
pub async fn patch_account_auth(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<serde_json::Value>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, true).await?;
    let body = payload.into_inner();
    let request: AccountPasswordChange = serde_json::from_value(body.clone())
        .map_err(|e| BankError::bad_request(TalerErrorCode::GenericJsonInvalid, e.to_string()))?;

    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::AccountAuthReconfig, &body).await?
    {
        return Ok(challenge);
    }
    perform_patch_auth(&state, &username, request, identity.is_admin).await
}

pub(crate) async fn perform_delete_account(
    state: &AppState,
    login: &str,
) -> Result<HttpResponse> {
    match state.db.account_delete(login).await? {
        AccountDeletionOutcome::Success => {
            info!("deleted account {:?}", login);
            Ok(HttpResponse::NoContent().finish())
        }
        AccountDeletionOutcome::UnknownAccount => Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        )),
        AccountDeletionOutcome::BalanceNotZero => Err(BankError::conflict(
            TalerErrorCode::BankAccountBalanceNotZero,
            "account balance must be zero",
        )),
    }
}

/// `DELETE /accounts/{USERNAME}`
pub async fn delete_account(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadWrite, true).await?;
    if !state.config.bank.allow_deletions && !identity.is_admin {
        return Err(BankError::forbidden(
            TalerErrorCode::GenericUnauthorized,
            "account deletion is disabled",
        ));
    }
    if is_reserved_name(&username, state.config.conversion_enabled()) {
        return Err(BankError::conflict(
            TalerErrorCode::BankReservedUsernameConflict,
            "reserved accounts cannot be deleted",
        ));
    }

    let body = serde_json::json!({});
    if let Some(challenge) =
        tan_gate(&state, &identity, &username, ChallengeOp::AccountDelete, &body).await?
    {
        return Ok(challenge);
    }
    perform_delete_account(&state, &username).await
}

/// `POST /accounts/{USERNAME}/token`
pub async fn create_token(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Json<TokenRequest>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    // a token-authenticated caller must hold a refreshable token to mint
    // a successor
    let identity =
        auth::authenticate_for(&state.db, &req, &username, TokenScope::Refreshable, false).await?;

    let request = payload.into_inner();
    let mut token = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut token);

    let expiration = match request.duration {
        None => Some(Utc::now() + Duration::hours(state.config.bank.token_duration_hours)),
        Some(crate::models::RelativeTime(None)) => None,
        Some(crate::models::RelativeTime(Some(d))) => Some(Utc::now() + d),
    };

    if !state
        .db
        .token_create(&identity.login, &token, request.scope, request.refreshable, expiration)
        .await?
    {
        return Err(BankError::not_found(
            TalerErrorCode::BankUnknownAccount,
            "unknown account",
        ));
    }

    Ok(HttpResponse::Ok().json(TokenSuccessResponse {
        access_token: format!("{}{}", auth::TOKEN_PREFIX, base32::encode(&token)),
        expiration: match expiration {
            Some(dt) => Timestamp::from(dt),
            None => Timestamp::never(),
        },
    }))
}

/// `DELETE /accounts/{USERNAME}/token` (logout)
pub async fn delete_token(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let username = path.into_inner();
    auth::authenticate_for(&state.db, &req, &username, TokenScope::ReadOnly, false).await?;

    // deleting is meaningful only for Bearer callers; Basic has no token
    if let Some(header) = req.headers().get("Authorization").and_then(|v| v.to_str().ok()) {
        if let Some(credentials) = header.strip_prefix("Bearer ") {
            let token = auth::parse_bearer(credentials)?;
            state.db.token_delete(&token).await?;
        }
    }
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name("admin", false));
        assert!(is_reserved_name("bank", false));
        assert!(!is_reserved_name("exchange", false));
        assert!(is_reserved_name("exchange", true));
        assert!(!is_reserved_name("alice", true));
    }
}
