//! Double-entry ledger operations.
//!
//! A logical transfer writes one debit row and one credit row so each
//! account reads its own history under a single per-account cursor. Both
//! balances and the debit ceiling are settled inside the enclosing
//! SERIALIZABLE transaction.

use super::accounts::{account_by_login_tx, account_by_payto_tx, AccountRow};
use super::{amount_from_columns, Database};
use crate::errors::Result;
use crate::metrics;
use bank_core::amount::{Balance, BalanceOutcome};
use bank_core::Amount;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::{Duration, Instant};

/// Upper bound on `|delta|` for history pages.
pub const MAX_HISTORY_DELTA: i64 = 1024;

#[derive(Debug, Clone, FromRow)]
pub struct BankTransactionRow {
    pub row_id: i64,
    pub account_id: i64,
    pub creditor_payto: String,
    pub debtor_payto: String,
    pub subject: String,
    pub amount_value: i64,
    pub amount_frac: i32,
    pub direction: String,
    pub transaction_date: DateTime<Utc>,
}

impl BankTransactionRow {
    pub fn amount(&self, currency: &str) -> Result<Amount> {
        amount_from_columns(currency, self.amount_value, self.amount_frac)
    }
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub debit_row_id: i64,
    pub credit_row_id: i64,
    pub timestamp: DateTime<Utc>,
    pub debtor_account_id: i64,
    pub creditor_account_id: i64,
}

#[derive(Debug)]
pub enum TransferOutcome {
    UnknownDebtor,
    UnknownCreditor,
    BothPartySame,
    AdminCreditor,
    BalanceInsufficient,
    RequestUidReuse,
    Success(TransferResult),
}

pub(crate) struct TransferSpec<'a> {
    pub debtor_login: &'a str,
    pub creditor_payto: &'a str,
    pub subject: &'a str,
    pub amount: &'a Amount,
    pub timestamp: DateTime<Utc>,
    /// Registration bonuses and cashouts may move money on admin's
    /// behalf; customer transfers may not credit admin.
    pub allow_admin_creditor: bool,
}

fn balance_of(account: &AccountRow, currency: &str) -> Result<Balance> {
    Ok(Balance::new(
        amount_from_columns(currency, account.balance_value, account.balance_frac)?,
        account.has_debt,
    ))
}

async fn store_balance(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
    balance: &Balance,
) -> Result<()> {
    sqlx::query("UPDATE accounts SET balance_value = $1, balance_frac = $2, has_debt = $3 WHERE account_id = $4")
        .bind(balance.amount.value() as i64)
        .bind(balance.amount.frac() as i32)
        .bind(balance.has_debt)
        .bind(account_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_side(
    tx: &mut Transaction<'_, Postgres>,
    account_id: i64,
    direction: &str,
    debtor_payto: &str,
    creditor_payto: &str,
    subject: &str,
    amount: &Amount,
    timestamp: DateTime<Utc>,
) -> Result<i64> {
    let (row_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO bank_transactions
            (account_id, creditor_payto, debtor_payto, subject, amount_value, amount_frac, direction, transaction_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING row_id
        "#,
    )
    .bind(account_id)
    .bind(creditor_payto)
    .bind(debtor_payto)
    .bind(subject)
    .bind(amount.value() as i64)
    .bind(amount.frac() as i32)
    .bind(direction)
    .bind(timestamp)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row_id)
}

/// Move money between two local accounts inside the caller's transaction.
pub(crate) async fn transfer(
    tx: &mut Transaction<'_, Postgres>,
    currency: &str,
    spec: &TransferSpec<'_>,
) -> Result<TransferOutcome> {
    let Some(debtor) = account_by_login_tx(tx, spec.debtor_login, true).await? else {
        return Ok(TransferOutcome::UnknownDebtor);
    };
    let Some(creditor) = account_by_payto_tx(tx, spec.creditor_payto, true).await? else {
        return Ok(TransferOutcome::UnknownCreditor);
    };
    if debtor.account_id == creditor.account_id {
        return Ok(TransferOutcome::BothPartySame);
    }
    if creditor.login == "admin" && !spec.allow_admin_creditor {
        return Ok(TransferOutcome::AdminCreditor);
    }

    let threshold = amount_from_columns(
        currency,
        debtor.debit_threshold_value,
        debtor.debit_threshold_frac,
    )?;
    let new_debtor_balance = match balance_of(&debtor, currency)?.debit(spec.amount, &threshold)? {
        BalanceOutcome::Updated(b) => b,
        BalanceOutcome::Insufficient => return Ok(TransferOutcome::BalanceInsufficient),
    };
    let new_creditor_balance = balance_of(&creditor, currency)?.credit(spec.amount)?;

    store_balance(tx, debtor.account_id, &new_debtor_balance).await?;
    store_balance(tx, creditor.account_id, &new_creditor_balance).await?;

    let debit_row_id = insert_side(
        tx,
        debtor.account_id,
        "debit",
        &debtor.internal_payto,
        &creditor.internal_payto,
        spec.subject,
        spec.amount,
        spec.timestamp,
    )
    .await?;
    let credit_row_id = insert_side(
        tx,
        creditor.account_id,
        "credit",
        &debtor.internal_payto,
        &creditor.internal_payto,
        spec.subject,
        spec.amount,
        spec.timestamp,
    )
    .await?;

    Ok(TransferOutcome::Success(TransferResult {
        debit_row_id,
        credit_row_id,
        timestamp: spec.timestamp,
        debtor_account_id: debtor.account_id,
        creditor_account_id: creditor.account_id,
    }))
}

#[derive(FromRow)]
struct RequestLogRow {
    creditor_payto: String,
    subject: String,
    amount_value: i64,
    amount_frac: i32,
    tx_row_id: i64,
    created_at: DateTime<Utc>,
}

/// Check the per-debtor idempotency log; `Ok(Some(..))` replays the
/// original result, `Ok(None)` means the uid is fresh.
async fn check_request_uid(
    tx: &mut Transaction<'_, Postgres>,
    debtor_login: &str,
    request_uid: &str,
    spec: &TransferSpec<'_>,
) -> Result<Option<TransferOutcome>> {
    let row: Option<RequestLogRow> = sqlx::query_as(
        r#"
        SELECT r.creditor_payto, r.subject, r.amount_value, r.amount_frac, r.tx_row_id, r.created_at
        FROM transaction_requests r
        JOIN accounts a ON a.account_id = r.account_id
        WHERE r.request_uid = $1 AND a.login = $2
        "#,
    )
    .bind(request_uid)
    .bind(debtor_login)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let same = row.creditor_payto == spec.creditor_payto
        && row.subject == spec.subject
        && row.amount_value == spec.amount.value() as i64
        && row.amount_frac == spec.amount.frac() as i32;
    if !same {
        return Ok(Some(TransferOutcome::RequestUidReuse));
    }
    Ok(Some(TransferOutcome::Success(TransferResult {
        debit_row_id: row.tx_row_id,
        credit_row_id: row.tx_row_id,
        timestamp: row.created_at,
        debtor_account_id: 0,
        creditor_account_id: 0,
    })))
}

impl Database {
    /// Customer-initiated bank transaction (`POST .../transactions`).
    pub async fn create_transaction(
        &self,
        debtor_login: &str,
        creditor_payto: &str,
        subject: &str,
        amount: &Amount,
        request_uid: Option<&str>,
    ) -> Result<TransferOutcome> {
        let spec = TransferSpec {
            debtor_login,
            creditor_payto,
            subject,
            amount,
            timestamp: Utc::now(),
            allow_admin_creditor: false,
        };
        let spec = &spec;
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                if let Some(uid) = request_uid {
                    if let Some(replay) = check_request_uid(&mut tx, debtor_login, uid, spec).await? {
                        tx.commit().await?;
                        return Ok((replay, true));
                    }
                }
                let outcome = transfer(&mut tx, &self.currency, spec).await?;
                if let (Some(uid), TransferOutcome::Success(result)) = (request_uid, &outcome) {
                    sqlx::query(
                        r#"
                        INSERT INTO transaction_requests
                            (request_uid, account_id, creditor_payto, subject, amount_value, amount_frac, tx_row_id, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(uid)
                    .bind(result.debtor_account_id)
                    .bind(spec.creditor_payto)
                    .bind(spec.subject)
                    .bind(spec.amount.value() as i64)
                    .bind(spec.amount.frac() as i32)
                    .bind(result.debit_row_id)
                    .bind(result.timestamp)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok((outcome, false))
            })
            .await;

        match outcome {
            Ok((TransferOutcome::Success(result), replayed)) => {
                if !replayed {
                    metrics::TRANSACTIONS_TOTAL.inc();
                    self.hub.notify(result.debtor_account_id, result.debit_row_id);
                    self.hub.notify(result.creditor_account_id, result.credit_row_id);
                }
                Ok(TransferOutcome::Success(result))
            }
            Ok((other, _)) => Ok(other),
            Err(e) => Err(e),
        }
    }

    /// Fetch one transaction row, visible only to its owning account.
    pub async fn transaction_by_id(
        &self,
        login: &str,
        row_id: i64,
    ) -> Result<Option<BankTransactionRow>> {
        let row: Option<BankTransactionRow> = sqlx::query_as(
            r#"
            SELECT t.row_id, t.account_id, t.creditor_payto, t.debtor_payto, t.subject,
                   t.amount_value, t.amount_frac, t.direction, t.transaction_date
            FROM bank_transactions t
            JOIN accounts a ON a.account_id = t.account_id
            WHERE t.row_id = $1 AND a.login = $2
            "#,
        )
        .bind(row_id)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn history_page(
        &self,
        account_id: i64,
        start: i64,
        delta: i64,
    ) -> Result<Vec<BankTransactionRow>> {
        let limit = delta.unsigned_abs().min(MAX_HISTORY_DELTA as u64) as i64;
        let rows: Vec<BankTransactionRow> = if delta >= 0 {
            sqlx::query_as(
                r#"
                SELECT row_id, account_id, creditor_payto, debtor_payto, subject,
                       amount_value, amount_frac, direction, transaction_date
                FROM bank_transactions
                WHERE account_id = $1 AND row_id > $2
                ORDER BY row_id ASC
                LIMIT $3
                "#,
            )
            .bind(account_id)
            .bind(start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT row_id, account_id, creditor_payto, debtor_payto, subject,
                       amount_value, amount_frac, direction, transaction_date
                FROM bank_transactions
                WHERE account_id = $1 AND row_id < $2
                ORDER BY row_id DESC
                LIMIT $3
                "#,
            )
            .bind(account_id)
            .bind(start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    /// Cursor-paged history with optional long polling. Returns `None`
    /// for an unknown account.
    pub async fn transaction_history(
        &self,
        login: &str,
        start: Option<i64>,
        delta: i64,
        long_poll: Option<Duration>,
    ) -> Result<Option<Vec<BankTransactionRow>>> {
        let Some(account) = self.account_by_login(login).await? else {
            return Ok(None);
        };
        let start = start.unwrap_or(if delta >= 0 { 0 } else { i64::MAX });

        // register before the snapshot so a commit between snapshot and
        // wait still wakes us
        let mut waiter = match long_poll {
            Some(_) if delta > 0 => Some(self.hub.subscribe(account.account_id)),
            _ => None,
        };
        let deadline = long_poll.map(|d| Instant::now() + d);

        loop {
            let rows = self.history_page(account.account_id, start, delta).await?;
            if !rows.is_empty() || waiter.is_none() {
                return Ok(Some(rows));
            }
            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if remaining.is_zero() {
                return Ok(Some(rows));
            }
            let Some(rx) = waiter.as_mut() else {
                return Ok(Some(rows));
            };
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(_) => continue,
                Err(_elapsed) => return Ok(Some(Vec::new())),
            }
        }
    }
}
