//! Account lifecycle: registration, reconfiguration, deletion, listings.

use super::ledger::{transfer, TransferOutcome, TransferSpec};
use super::{amount_from_columns, Database};
use crate::auth;
use crate::errors::{BankError, Result};
use crate::models::PatchField;
use bank_core::payto::Iban;
use bank_core::Amount;
use chrono::Utc;
use sqlx::{FromRow, Postgres, Transaction};

/// Attempts at allocating an unused random IBAN before giving up.
const IBAN_ALLOCATION_RETRIES: u32 = 8;

/// Subject of the bonus transfer booked on registration.
pub const BONUS_SUBJECT: &str = "Registration bonus.";

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AccountRow {
    pub account_id: i64,
    pub login: String,
    pub name: String,
    pub internal_payto: String,
    pub cashout_payto: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_public: bool,
    pub is_taler_exchange: bool,
    pub balance_value: i64,
    pub balance_frac: i32,
    pub has_debt: bool,
    pub debit_threshold_value: i64,
    pub debit_threshold_frac: i32,
    pub min_cashout_value: Option<i64>,
    pub min_cashout_frac: Option<i32>,
    pub tan_channel: Option<String>,
}

impl AccountRow {
    pub fn balance_amount(&self, currency: &str) -> Result<Amount> {
        amount_from_columns(currency, self.balance_value, self.balance_frac)
    }

    pub fn debit_threshold(&self, currency: &str) -> Result<Amount> {
        amount_from_columns(currency, self.debit_threshold_value, self.debit_threshold_frac)
    }

    pub fn min_cashout(&self, currency: &str) -> Result<Option<Amount>> {
        match (self.min_cashout_value, self.min_cashout_frac) {
            (Some(v), Some(f)) => Ok(Some(amount_from_columns(currency, v, f)?)),
            _ => Ok(None),
        }
    }

    /// Contact address for the account's TAN channel, if fully set up.
    pub fn tan_address(&self) -> Option<(&str, &str)> {
        match self.tan_channel.as_deref() {
            Some("sms") => self.phone.as_deref().map(|p| ("sms", p)),
            Some("email") => self.email.as_deref().map(|e| ("email", e)),
            _ => None,
        }
    }
}

const ACCOUNT_COLUMNS: &str = r#"
    account_id, login, name, internal_payto, cashout_payto, email, phone,
    is_public, is_taler_exchange, balance_value, balance_frac, has_debt,
    debit_threshold_value, debit_threshold_frac, min_cashout_value,
    min_cashout_frac, tan_channel
"#;

pub(crate) async fn account_by_login_tx(
    tx: &mut Transaction<'_, Postgres>,
    login: &str,
    for_update: bool,
) -> Result<Option<AccountRow>> {
    let suffix = if for_update { "FOR UPDATE" } else { "" };
    let row = sqlx::query_as(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login = $1 {suffix}"
    ))
    .bind(login)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

pub(crate) async fn account_by_payto_tx(
    tx: &mut Transaction<'_, Postgres>,
    payto: &str,
    for_update: bool,
) -> Result<Option<AccountRow>> {
    let suffix = if for_update { "FOR UPDATE" } else { "" };
    let row = sqlx::query_as(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE internal_payto = $1 {suffix}"
    ))
    .bind(payto)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

#[derive(Debug)]
pub struct CreateAccountArgs {
    pub login: String,
    pub password_hash: String,
    pub name: String,
    pub internal_payto: Option<String>,
    pub cashout_payto: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_public: bool,
    pub is_taler_exchange: bool,
    pub debit_threshold: Amount,
    pub min_cashout: Option<Amount>,
    pub tan_channel: Option<String>,
    pub registration_bonus: Option<Amount>,
    /// `iban` or `x-taler-bank`, for payto allocation.
    pub wire_type: String,
    pub iban_country: String,
    pub hostname: String,
}

#[derive(Debug)]
pub enum AccountCreationOutcome {
    Success { internal_payto: String },
    LoginReuse,
    PaytoReuse,
    BonusBalanceInsufficient,
}

async fn payto_taken(tx: &mut Transaction<'_, Postgres>, payto: &str) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM accounts WHERE internal_payto = $1)")
            .bind(payto)
            .fetch_one(&mut **tx)
            .await?;
    Ok(exists)
}

async fn allocate_payto(
    tx: &mut Transaction<'_, Postgres>,
    args: &CreateAccountArgs,
) -> Result<Option<String>> {
    if let Some(requested) = &args.internal_payto {
        if payto_taken(tx, requested).await? {
            return Ok(None);
        }
        return Ok(Some(requested.clone()));
    }
    match args.wire_type.as_str() {
        "x-taler-bank" => {
            let payto = format!("payto://x-taler-bank/{}/{}", args.hostname, args.login);
            if payto_taken(tx, &payto).await? {
                return Ok(None);
            }
            Ok(Some(payto))
        }
        _ => {
            for _ in 0..IBAN_ALLOCATION_RETRIES {
                let iban = Iban::random(&args.iban_country, &mut rand::thread_rng());
                let payto = format!("payto://iban/{}", iban);
                if !payto_taken(tx, &payto).await? {
                    return Ok(Some(payto));
                }
            }
            Err(BankError::Internal(
                "could not allocate an unused IBAN".to_string(),
            ))
        }
    }
}

impl Database {
    pub(crate) async fn account_by_login(&self, login: &str) -> Result<Option<AccountRow>> {
        let row = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE login = $1"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn account_password_hash(&self, login: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password_hash FROM accounts WHERE login = $1")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(h,)| h))
    }

    pub async fn account_create(&self, args: &CreateAccountArgs) -> Result<AccountCreationOutcome> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;

            if account_by_login_tx(&mut tx, &args.login, false).await?.is_some() {
                return Ok(AccountCreationOutcome::LoginReuse);
            }
            let Some(payto) = allocate_payto(&mut tx, args).await? else {
                return Ok(AccountCreationOutcome::PaytoReuse);
            };

            sqlx::query(
                r#"
                INSERT INTO accounts
                    (login, password_hash, name, internal_payto, cashout_payto, email, phone,
                     is_public, is_taler_exchange, debit_threshold_value, debit_threshold_frac,
                     min_cashout_value, min_cashout_frac, tan_channel, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(&args.login)
            .bind(&args.password_hash)
            .bind(&args.name)
            .bind(&payto)
            .bind(&args.cashout_payto)
            .bind(&args.email)
            .bind(&args.phone)
            .bind(args.is_public)
            .bind(args.is_taler_exchange)
            .bind(args.debit_threshold.value() as i64)
            .bind(args.debit_threshold.frac() as i32)
            .bind(args.min_cashout.as_ref().map(|a| a.value() as i64))
            .bind(args.min_cashout.as_ref().map(|a| a.frac() as i32))
            .bind(&args.tan_channel)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            if let Some(bonus) = &args.registration_bonus {
                if !args.is_taler_exchange && !bonus.is_zero() {
                    let spec = TransferSpec {
                        debtor_login: "admin",
                        creditor_payto: &payto,
                        subject: BONUS_SUBJECT,
                        amount: bonus,
                        timestamp: Utc::now(),
                        allow_admin_creditor: false,
                    };
                    match transfer(&mut tx, &self.currency, &spec).await? {
                        TransferOutcome::Success(_) => {}
                        TransferOutcome::BalanceInsufficient => {
                            tx.rollback().await?;
                            return Ok(AccountCreationOutcome::BonusBalanceInsufficient);
                        }
                        other => {
                            tx.rollback().await?;
                            return Err(BankError::Internal(format!(
                                "bonus transfer failed: {other:?}"
                            )));
                        }
                    }
                }
            }

            tx.commit().await?;
            Ok(AccountCreationOutcome::Success {
                internal_payto: payto,
            })
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct AccountPatch {
    pub name: Option<String>,
    pub is_public: Option<bool>,
    pub debit_threshold: Option<Amount>,
    pub cashout_payto: PatchField<String>,
    pub email: PatchField<String>,
    pub phone: PatchField<String>,
    pub min_cashout: PatchField<Amount>,
    pub tan_channel: PatchField<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AccountPatchOutcome {
    Success,
    UnknownAccount,
    NonAdminLegalName,
    NonAdminCashout,
    NonAdminDebtLimit,
    NonAdminMinCashout,
    /// The new TAN channel has no matching contact address.
    MissingTanInfo,
}

impl Database {
    pub async fn account_reconfig(
        &self,
        login: &str,
        patch: &AccountPatch,
        is_admin: bool,
        allow_edit_name: bool,
        allow_edit_cashout: bool,
    ) -> Result<AccountPatchOutcome> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;
            let Some(current) = account_by_login_tx(&mut tx, login, true).await? else {
                return Ok(AccountPatchOutcome::UnknownAccount);
            };

            if !is_admin {
                if let Some(name) = &patch.name {
                    if *name != current.name && !allow_edit_name {
                        return Ok(AccountPatchOutcome::NonAdminLegalName);
                    }
                }
                if !patch.cashout_payto.is_keep() && !allow_edit_cashout {
                    return Ok(AccountPatchOutcome::NonAdminCashout);
                }
                if patch.debit_threshold.is_some() {
                    return Ok(AccountPatchOutcome::NonAdminDebtLimit);
                }
                if !patch.min_cashout.is_keep() {
                    return Ok(AccountPatchOutcome::NonAdminMinCashout);
                }
            }

            let name = patch.name.clone().unwrap_or_else(|| current.name.clone());
            let is_public = patch.is_public.unwrap_or(current.is_public);
            let (threshold_value, threshold_frac) = match &patch.debit_threshold {
                Some(a) => (a.value() as i64, a.frac() as i32),
                None => (current.debit_threshold_value, current.debit_threshold_frac),
            };
            let cashout_payto = patch
                .cashout_payto
                .clone()
                .apply(current.cashout_payto.clone());
            let email = patch.email.clone().apply(current.email.clone());
            let phone = patch.phone.clone().apply(current.phone.clone());
            let min_cashout = patch.min_cashout.clone().apply(
                current.min_cashout(&self.currency)?,
            );
            let tan_channel = patch.tan_channel.clone().apply(current.tan_channel.clone());

            // a configured TAN channel must stay addressable
            match tan_channel.as_deref() {
                Some("sms") if phone.is_none() => return Ok(AccountPatchOutcome::MissingTanInfo),
                Some("email") if email.is_none() => {
                    return Ok(AccountPatchOutcome::MissingTanInfo)
                }
                _ => {}
            }

            sqlx::query(
                r#"
                UPDATE accounts SET
                    name = $1, is_public = $2, debit_threshold_value = $3,
                    debit_threshold_frac = $4, cashout_payto = $5, email = $6, phone = $7,
                    min_cashout_value = $8, min_cashout_frac = $9, tan_channel = $10
                WHERE account_id = $11
                "#,
            )
            .bind(&name)
            .bind(is_public)
            .bind(threshold_value)
            .bind(threshold_frac)
            .bind(&cashout_payto)
            .bind(&email)
            .bind(&phone)
            .bind(min_cashout.as_ref().map(|a| a.value() as i64))
            .bind(min_cashout.as_ref().map(|a| a.frac() as i32))
            .bind(&tan_channel)
            .bind(current.account_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(AccountPatchOutcome::Success)
        })
        .await
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PasswordChangeOutcome {
    Success,
    UnknownAccount,
    OldPasswordMismatch,
    OldPasswordRequired,
}

impl Database {
    pub async fn account_reconfig_password(
        &self,
        login: &str,
        new_password_hash: &str,
        old_password: Option<&str>,
        is_admin: bool,
    ) -> Result<PasswordChangeOutcome> {
        let Some(current_hash) = self.account_password_hash(login).await? else {
            return Ok(PasswordChangeOutcome::UnknownAccount);
        };
        if !is_admin {
            let Some(old) = old_password else {
                return Ok(PasswordChangeOutcome::OldPasswordRequired);
            };
            if !auth::verify_password(old.to_string(), current_hash).await? {
                return Ok(PasswordChangeOutcome::OldPasswordMismatch);
            }
        }
        sqlx::query("UPDATE accounts SET password_hash = $1 WHERE login = $2")
            .bind(new_password_hash)
            .bind(login)
            .execute(&self.pool)
            .await?;
        Ok(PasswordChangeOutcome::Success)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AccountDeletionOutcome {
    Success,
    UnknownAccount,
    BalanceNotZero,
}

impl Database {
    pub async fn account_delete(&self, login: &str) -> Result<AccountDeletionOutcome> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;
            let Some(account) = account_by_login_tx(&mut tx, login, true).await? else {
                return Ok(AccountDeletionOutcome::UnknownAccount);
            };
            if account.balance_value != 0 || account.balance_frac != 0 {
                return Ok(AccountDeletionOutcome::BalanceNotZero);
            }
            // abort whatever is still in flight, then let the FK cascade
            // clear tokens, challenges and operations
            sqlx::query(
                "UPDATE withdrawal_operations SET status = 'aborted' WHERE account_id = $1 AND status IN ('pending', 'selected')",
            )
            .bind(account.account_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE cashout_operations SET status = 'aborted' WHERE account_id = $1 AND status = 'pending'",
            )
            .bind(account.account_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM accounts WHERE account_id = $1")
                .bind(account.account_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(AccountDeletionOutcome::Success)
        })
        .await
    }

    /// Public account listing, cursor-paged over account ids and
    /// optionally filtered by login substring.
    pub async fn accounts_public(
        &self,
        filter: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<AccountRow>> {
        let pattern = format!("%{}%", filter.unwrap_or(""));
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM accounts
            WHERE is_public AND login LIKE $1 AND account_id > $2
            ORDER BY account_id
            LIMIT $3
            "#
        ))
        .bind(&pattern)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Admin listing of every account, same paging scheme.
    pub async fn accounts_admin(
        &self,
        filter: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<AccountRow>> {
        let pattern = format!("%{}%", filter.unwrap_or(""));
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM accounts
            WHERE login LIKE $1 AND account_id > $2
            ORDER BY account_id
            LIMIT $3
            "#
        ))
        .bind(&pattern)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Seed the `admin` account at startup; a no-op when it exists.
    pub async fn seed_admin(&self, password_hash: &str, payto: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (login, password_hash, name, internal_payto,
                 debit_threshold_value, debit_threshold_frac, created_at)
            VALUES ('admin', $1, 'Bank administrator', $2, 0, 0, $3)
            ON CONFLICT (login) DO NOTHING
            "#,
        )
        .bind(password_hash)
        .bind(payto)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
