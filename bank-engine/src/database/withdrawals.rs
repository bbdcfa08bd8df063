//! Two-phase Taler withdrawal state machine.
//!
//! Transitions run inside the storage transaction; handlers only map
//! outcomes to HTTP. No funds move before `confirm`.

use super::accounts::account_by_login_tx;
use super::ledger::{transfer, TransferOutcome, TransferSpec};
use super::Database;
use crate::errors::Result;
use crate::metrics;
use crate::models::WithdrawalState;
use bank_core::amount::BalanceOutcome;
use bank_core::Amount;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRow {
    pub withdrawal_uuid: Uuid,
    pub account_id: i64,
    pub login: String,
    pub internal_payto: String,
    pub amount_value: i64,
    pub amount_frac: i32,
    pub status: String,
    pub selected_exchange_payto: Option<String>,
    pub reserve_pub: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalRow {
    pub fn state(&self) -> WithdrawalState {
        self.status.parse().unwrap_or(WithdrawalState::Aborted)
    }

    pub fn amount(&self, currency: &str) -> Result<Amount> {
        super::amount_from_columns(currency, self.amount_value, self.amount_frac)
    }
}

const WITHDRAWAL_COLUMNS: &str = r#"
    w.withdrawal_uuid, w.account_id, a.login, a.internal_payto,
    w.amount_value, w.amount_frac, w.status, w.selected_exchange_payto,
    w.reserve_pub, w.created_at
"#;

async fn withdrawal_tx(
    tx: &mut Transaction<'_, Postgres>,
    uuid: Uuid,
    for_update: bool,
) -> Result<Option<WithdrawalRow>> {
    let suffix = if for_update { "FOR UPDATE OF w" } else { "" };
    let row = sqlx::query_as(&format!(
        r#"
        SELECT {WITHDRAWAL_COLUMNS}
        FROM withdrawal_operations w
        JOIN accounts a ON a.account_id = w.account_id
        WHERE w.withdrawal_uuid = $1 {suffix}
        "#
    ))
    .bind(uuid)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row)
}

#[derive(Debug)]
pub enum WithdrawalCreationOutcome {
    Success,
    UnknownAccount,
    AccountIsExchange,
    BalanceInsufficient,
}

#[derive(Debug)]
pub enum WithdrawalSelectionOutcome {
    Success { state: WithdrawalState },
    UnknownOperation,
    AlreadyAborted,
    SelectionConflict,
    ReservePubReuse,
}

#[derive(Debug)]
pub enum WithdrawalAbortOutcome {
    Success,
    UnknownOperation,
    AlreadyConfirmed,
}

#[derive(Debug)]
pub enum WithdrawalConfirmOutcome {
    Success,
    UnknownOperation,
    NotSelected,
    AlreadyAborted,
    UnknownExchange,
    BalanceInsufficient,
}

impl Database {
    /// Create a pending withdrawal. The amount is only feasibility-checked
    /// here; the debit happens at confirmation.
    pub async fn withdrawal_create(
        &self,
        login: &str,
        uuid: Uuid,
        amount: &Amount,
    ) -> Result<WithdrawalCreationOutcome> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;
            let Some(account) = account_by_login_tx(&mut tx, login, false).await? else {
                return Ok(WithdrawalCreationOutcome::UnknownAccount);
            };
            if account.is_taler_exchange {
                return Ok(WithdrawalCreationOutcome::AccountIsExchange);
            }
            let balance = bank_core::amount::Balance::new(
                account.balance_amount(&self.currency)?,
                account.has_debt,
            );
            let threshold = account.debit_threshold(&self.currency)?;
            if let BalanceOutcome::Insufficient = balance.debit(amount, &threshold)? {
                return Ok(WithdrawalCreationOutcome::BalanceInsufficient);
            }
            sqlx::query(
                r#"
                INSERT INTO withdrawal_operations
                    (withdrawal_uuid, account_id, amount_value, amount_frac, status, created_at)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                "#,
            )
            .bind(uuid)
            .bind(account.account_id)
            .bind(amount.value() as i64)
            .bind(amount.frac() as i32)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(WithdrawalCreationOutcome::Success)
        })
        .await
    }

    pub async fn withdrawal_get(&self, uuid: Uuid) -> Result<Option<WithdrawalRow>> {
        let row = sqlx::query_as(&format!(
            r#"
            SELECT {WITHDRAWAL_COLUMNS}
            FROM withdrawal_operations w
            JOIN accounts a ON a.account_id = w.account_id
            WHERE w.withdrawal_uuid = $1
            "#
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Status with optional long polling until the state leaves
    /// `old_state`.
    pub async fn withdrawal_poll(
        &self,
        uuid: Uuid,
        old_state: Option<WithdrawalState>,
        long_poll: Option<Duration>,
    ) -> Result<Option<WithdrawalRow>> {
        let Some(row) = self.withdrawal_get(uuid).await? else {
            return Ok(None);
        };
        let (Some(target), Some(wait)) = (old_state, long_poll) else {
            return Ok(Some(row));
        };
        // subscribe, then re-snapshot, so a transition between the two
        // cannot strand the waiter
        let mut waiter = self.hub.subscribe(row.account_id);
        let mut row = match self.withdrawal_get(uuid).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let deadline = Instant::now() + wait;
        while row.state() == target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, waiter.recv()).await {
                Ok(_) => {
                    row = match self.withdrawal_get(uuid).await? {
                        Some(r) => r,
                        None => return Ok(None),
                    };
                }
                Err(_elapsed) => break,
            }
        }
        Ok(Some(row))
    }

    /// Wallet-side selection of reserve key and exchange.
    pub async fn withdrawal_select(
        &self,
        uuid: Uuid,
        reserve_pub: &str,
        exchange_payto: &str,
    ) -> Result<WithdrawalSelectionOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(row) = withdrawal_tx(&mut tx, uuid, true).await? else {
                    return Ok((WithdrawalSelectionOutcome::UnknownOperation, None));
                };
                match row.state() {
                    WithdrawalState::Aborted => Ok((WithdrawalSelectionOutcome::AlreadyAborted, None)),
                    WithdrawalState::Selected | WithdrawalState::Confirmed => {
                        let same = row.reserve_pub.as_deref() == Some(reserve_pub)
                            && row.selected_exchange_payto.as_deref() == Some(exchange_payto);
                        if same {
                            Ok((
                                WithdrawalSelectionOutcome::Success { state: row.state() },
                                None,
                            ))
                        } else {
                            Ok((WithdrawalSelectionOutcome::SelectionConflict, None))
                        }
                    }
                    WithdrawalState::Pending => {
                        let (reuse,): (bool,) = sqlx::query_as(
                            r#"
                            SELECT EXISTS(
                                SELECT 1 FROM withdrawal_operations
                                WHERE reserve_pub = $1 AND withdrawal_uuid <> $2
                            ) OR EXISTS(
                                SELECT 1 FROM bank_transactions
                                WHERE subject = $1 AND direction = 'credit'
                            )
                            "#,
                        )
                        .bind(reserve_pub)
                        .bind(uuid)
                        .fetch_one(&mut *tx)
                        .await?;
                        if reuse {
                            return Ok((WithdrawalSelectionOutcome::ReservePubReuse, None));
                        }
                        sqlx::query(
                            r#"
                            UPDATE withdrawal_operations
                            SET status = 'selected', reserve_pub = $1, selected_exchange_payto = $2
                            WHERE withdrawal_uuid = $3
                            "#,
                        )
                        .bind(reserve_pub)
                        .bind(exchange_payto)
                        .bind(uuid)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        Ok((
                            WithdrawalSelectionOutcome::Success {
                                state: WithdrawalState::Selected,
                            },
                            Some(row.account_id),
                        ))
                    }
                }
            })
            .await?;
        if let (_, Some(account_id)) = &outcome {
            self.hub.notify(*account_id, 0);
        }
        Ok(outcome.0)
    }

    /// Abort; idempotent on an already aborted operation.
    pub async fn withdrawal_abort(&self, uuid: Uuid) -> Result<WithdrawalAbortOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(row) = withdrawal_tx(&mut tx, uuid, true).await? else {
                    return Ok((WithdrawalAbortOutcome::UnknownOperation, None));
                };
                match row.state() {
                    WithdrawalState::Confirmed => Ok((WithdrawalAbortOutcome::AlreadyConfirmed, None)),
                    WithdrawalState::Aborted => Ok((WithdrawalAbortOutcome::Success, None)),
                    WithdrawalState::Pending | WithdrawalState::Selected => {
                        sqlx::query(
                            "UPDATE withdrawal_operations SET status = 'aborted' WHERE withdrawal_uuid = $1",
                        )
                        .bind(uuid)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        Ok((WithdrawalAbortOutcome::Success, Some(row.account_id)))
                    }
                }
            })
            .await?;
        if let (_, Some(account_id)) = &outcome {
            self.hub.notify(*account_id, 0);
        }
        Ok(outcome.0)
    }

    /// Confirm a selected withdrawal: moves the funds to the selected
    /// exchange in the same transaction that flips the state.
    pub async fn withdrawal_confirm(&self, uuid: Uuid) -> Result<WithdrawalConfirmOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(row) = withdrawal_tx(&mut tx, uuid, true).await? else {
                    return Ok((WithdrawalConfirmOutcome::UnknownOperation, None));
                };
                match row.state() {
                    WithdrawalState::Confirmed => Ok((WithdrawalConfirmOutcome::Success, None)),
                    WithdrawalState::Aborted => Ok((WithdrawalConfirmOutcome::AlreadyAborted, None)),
                    WithdrawalState::Pending => Ok((WithdrawalConfirmOutcome::NotSelected, None)),
                    WithdrawalState::Selected => {
                        let (Some(exchange_payto), Some(reserve_pub)) =
                            (row.selected_exchange_payto.clone(), row.reserve_pub.clone())
                        else {
                            return Err(crate::errors::BankError::Internal(
                                "selected withdrawal without selection data".to_string(),
                            ));
                        };
                        let Some(exchange) =
                            super::accounts::account_by_payto_tx(&mut tx, &exchange_payto, false)
                                .await?
                        else {
                            return Ok((WithdrawalConfirmOutcome::UnknownExchange, None));
                        };
                        if !exchange.is_taler_exchange {
                            return Ok((WithdrawalConfirmOutcome::UnknownExchange, None));
                        }
                        let amount = row.amount(&self.currency)?;
                        let spec = TransferSpec {
                            debtor_login: &row.login,
                            creditor_payto: &exchange_payto,
                            subject: &reserve_pub,
                            amount: &amount,
                            timestamp: Utc::now(),
                            allow_admin_creditor: false,
                        };
                        match transfer(&mut tx, &self.currency, &spec).await? {
                            TransferOutcome::Success(result) => {
                                sqlx::query(
                                    r#"
                                    UPDATE withdrawal_operations
                                    SET status = 'confirmed', confirmation_date = $1
                                    WHERE withdrawal_uuid = $2
                                    "#,
                                )
                                .bind(result.timestamp)
                                .bind(uuid)
                                .execute(&mut *tx)
                                .await?;
                                tx.commit().await?;
                                Ok((WithdrawalConfirmOutcome::Success, Some(result)))
                            }
                            TransferOutcome::BalanceInsufficient => {
                                Ok((WithdrawalConfirmOutcome::BalanceInsufficient, None))
                            }
                            other => Err(crate::errors::BankError::Internal(format!(
                                "withdrawal transfer failed: {other:?}"
                            ))),
                        }
                    }
                }
            })
            .await?;
        if let (WithdrawalConfirmOutcome::Success, Some(result)) = &outcome {
            metrics::WITHDRAWALS_CONFIRMED.inc();
            metrics::TRANSACTIONS_TOTAL.inc();
            self.hub.notify(result.debtor_account_id, result.debit_row_id);
            self.hub.notify(result.creditor_account_id, result.credit_row_id);
        }
        Ok(outcome.0)
    }
}
