//! Cashout operations and the stored conversion rate.
//!
//! The regional debit leg settles here (user -> `exchange` account); the
//! fiat credit leg is executed outside the core.

use super::accounts::account_by_login_tx;
use super::ledger::{transfer, TransferOutcome, TransferSpec};
use super::{amount_from_columns, Database};
use crate::errors::{BankError, Result};
use crate::metrics;
use bank_core::conversion::ConversionRate;
use bank_core::Amount;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::cmp::Ordering;

#[derive(Debug, Clone, FromRow)]
pub struct CashoutRow {
    pub cashout_id: i64,
    pub account_id: i64,
    pub login: String,
    pub request_uid: String,
    pub amount_debit_value: i64,
    pub amount_debit_frac: i32,
    pub amount_credit_value: i64,
    pub amount_credit_frac: i32,
    pub subject: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl CashoutRow {
    pub fn amount_debit(&self, currency: &str) -> Result<Amount> {
        amount_from_columns(currency, self.amount_debit_value, self.amount_debit_frac)
    }

    pub fn amount_credit(&self, fiat_currency: &str) -> Result<Amount> {
        amount_from_columns(fiat_currency, self.amount_credit_value, self.amount_credit_frac)
    }
}

const CASHOUT_COLUMNS: &str = r#"
    c.cashout_id, c.account_id, a.login, c.request_uid,
    c.amount_debit_value, c.amount_debit_frac,
    c.amount_credit_value, c.amount_credit_frac,
    c.subject, c.status, c.created_at
"#;

#[derive(Debug)]
pub enum CashoutCreationOutcome {
    Success { cashout_id: i64 },
    UnknownAccount,
    RequestUidReuse,
    UnderMin,
    BalanceInsufficient,
    /// Conversion requires the reserved `exchange` account.
    NoExchangeAccount,
}

impl Database {
    /// Execute a cashout whose TAN gate has already been passed.
    pub async fn cashout_create(
        &self,
        login: &str,
        request_uid: &str,
        amount_debit: &Amount,
        amount_credit: &Amount,
        subject: &str,
    ) -> Result<CashoutCreationOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(account) = account_by_login_tx(&mut tx, login, false).await? else {
                    return Ok((CashoutCreationOutcome::UnknownAccount, None));
                };

                let existing: Option<CashoutRow> = sqlx::query_as(&format!(
                    r#"
                    SELECT {CASHOUT_COLUMNS}
                    FROM cashout_operations c
                    JOIN accounts a ON a.account_id = c.account_id
                    WHERE c.request_uid = $1 AND c.account_id = $2
                    "#
                ))
                .bind(request_uid)
                .bind(account.account_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(existing) = existing {
                    let same = existing.amount_debit_value == amount_debit.value() as i64
                        && existing.amount_debit_frac == amount_debit.frac() as i32
                        && existing.amount_credit_value == amount_credit.value() as i64
                        && existing.amount_credit_frac == amount_credit.frac() as i32
                        && existing.subject == subject;
                    return Ok(if same {
                        (
                            CashoutCreationOutcome::Success {
                                cashout_id: existing.cashout_id,
                            },
                            None,
                        )
                    } else {
                        (CashoutCreationOutcome::RequestUidReuse, None)
                    });
                }

                if let Some(min) = account.min_cashout(&self.currency)? {
                    if amount_debit.checked_cmp(&min)? == Ordering::Less {
                        return Ok((CashoutCreationOutcome::UnderMin, None));
                    }
                }

                let Some(exchange) = account_by_login_tx(&mut tx, "exchange", false).await? else {
                    return Ok((CashoutCreationOutcome::NoExchangeAccount, None));
                };

                let spec = TransferSpec {
                    debtor_login: login,
                    creditor_payto: &exchange.internal_payto,
                    subject,
                    amount: amount_debit,
                    timestamp: Utc::now(),
                    allow_admin_creditor: false,
                };
                let result = match transfer(&mut tx, &self.currency, &spec).await? {
                    TransferOutcome::Success(result) => result,
                    TransferOutcome::BalanceInsufficient => {
                        return Ok((CashoutCreationOutcome::BalanceInsufficient, None))
                    }
                    other => {
                        return Err(BankError::Internal(format!(
                            "cashout transfer failed: {other:?}"
                        )))
                    }
                };

                let (cashout_id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO cashout_operations
                        (account_id, request_uid, amount_debit_value, amount_debit_frac,
                         amount_credit_value, amount_credit_frac, subject, status, tx_row_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, 'confirmed', $8, $9)
                    RETURNING cashout_id
                    "#,
                )
                .bind(account.account_id)
                .bind(request_uid)
                .bind(amount_debit.value() as i64)
                .bind(amount_debit.frac() as i32)
                .bind(amount_credit.value() as i64)
                .bind(amount_credit.frac() as i32)
                .bind(subject)
                .bind(result.debit_row_id)
                .bind(result.timestamp)
                .fetch_one(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok((CashoutCreationOutcome::Success { cashout_id }, Some(result)))
            })
            .await?;

        if let (CashoutCreationOutcome::Success { .. }, Some(result)) = &outcome {
            metrics::CASHOUTS_TOTAL.inc();
            metrics::TRANSACTIONS_TOTAL.inc();
            self.hub.notify(result.debtor_account_id, result.debit_row_id);
            self.hub.notify(result.creditor_account_id, result.credit_row_id);
        }
        Ok(outcome.0)
    }

    pub async fn cashout_get(&self, login: &str, cashout_id: i64) -> Result<Option<CashoutRow>> {
        let row = sqlx::query_as(&format!(
            r#"
            SELECT {CASHOUT_COLUMNS}
            FROM cashout_operations c
            JOIN accounts a ON a.account_id = c.account_id
            WHERE c.cashout_id = $1 AND a.login = $2
            "#
        ))
        .bind(cashout_id)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Cashouts of one account, or of every account when `login` is None
    /// (admin listing).
    pub async fn cashouts_list(&self, login: Option<&str>) -> Result<Vec<CashoutRow>> {
        let rows = match login {
            Some(login) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {CASHOUT_COLUMNS}
                    FROM cashout_operations c
                    JOIN accounts a ON a.account_id = c.account_id
                    WHERE a.login = $1
                    ORDER BY c.cashout_id
                    "#
                ))
                .bind(login)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {CASHOUT_COLUMNS}
                    FROM cashout_operations c
                    JOIN accounts a ON a.account_id = c.account_id
                    ORDER BY c.cashout_id
                    "#
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn conversion_rate_get(&self) -> Result<Option<ConversionRate>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config FROM conversion_rate WHERE lone_row")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| BankError::Internal(format!("stored conversion rate invalid: {e}")))
        })
        .transpose()
    }

    pub async fn conversion_rate_set(&self, rate: &ConversionRate) -> Result<()> {
        let json = serde_json::to_string(rate)
            .map_err(|e| BankError::Internal(format!("conversion rate serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO conversion_rate (lone_row, config) VALUES (TRUE, $1)
            ON CONFLICT (lone_row) DO UPDATE SET config = $1
            "#,
        )
        .bind(&json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
