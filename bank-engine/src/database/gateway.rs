//! Wire Gateway storage: exchange-facing transfers and histories.

use super::accounts::account_by_login_tx;
use super::ledger::{transfer, BankTransactionRow, TransferOutcome, TransferSpec, MAX_HISTORY_DELTA};
use super::Database;
use crate::errors::{BankError, Result};
use crate::metrics;
use bank_core::{base32, Amount};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::time::{Duration, Instant};
use tracing::warn;

/// Subject of an outgoing exchange wire: `"{wtid} {exchange_base_url}"`.
pub fn format_outgoing_subject(wtid: &str, exchange_base_url: &str) -> String {
    format!("{} {}", wtid, exchange_base_url)
}

pub fn parse_outgoing_subject(subject: &str) -> Option<(&str, &str)> {
    let (wtid, url) = subject.split_once(' ')?;
    if base32::decode32(wtid).is_err() {
        return None;
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    Some((wtid, url))
}

/// An incoming subject is the bare reserve public key.
pub fn parse_incoming_subject(subject: &str) -> Option<&str> {
    let candidate = subject.trim();
    base32::decode32(candidate).ok()?;
    Some(candidate)
}

#[derive(Debug)]
pub enum WireTransferOutcome {
    Success { row_id: i64, timestamp: DateTime<Utc> },
    RequestUidReuse,
    NotAnExchange,
    UnknownCreditor,
    BothPartySame,
    AdminCreditor,
    BalanceInsufficient,
}

#[derive(Debug)]
pub enum AddIncomingOutcome {
    Success { row_id: i64, timestamp: DateTime<Utc> },
    NotAnExchange,
    UnknownDebtor,
    BothPartySame,
    ReservePubReuse,
    BalanceInsufficient,
}

#[derive(FromRow)]
struct TransferLogRow {
    wtid: String,
    exchange_base_url: String,
    credit_payto: String,
    amount_value: i64,
    amount_frac: i32,
    tx_row_id: i64,
    created_at: DateTime<Utc>,
}

impl Database {
    /// Exchange-initiated outbound wire (`POST .../transfer`), idempotent
    /// by `request_uid` over the full request tuple.
    pub async fn wire_transfer(
        &self,
        exchange_login: &str,
        request_uid: &str,
        amount: &Amount,
        exchange_base_url: &str,
        wtid: &str,
        credit_payto: &str,
    ) -> Result<WireTransferOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(exchange) = account_by_login_tx(&mut tx, exchange_login, false).await?
                else {
                    return Ok((WireTransferOutcome::NotAnExchange, None));
                };
                if !exchange.is_taler_exchange {
                    return Ok((WireTransferOutcome::NotAnExchange, None));
                }

                let existing: Option<TransferLogRow> = sqlx::query_as(
                    r#"
                    SELECT wtid, exchange_base_url, credit_payto, amount_value, amount_frac, tx_row_id, created_at
                    FROM transfer_requests
                    WHERE request_uid = $1 AND account_id = $2
                    "#,
                )
                .bind(request_uid)
                .bind(exchange.account_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(existing) = existing {
                    let same = existing.wtid == wtid
                        && existing.exchange_base_url == exchange_base_url
                        && existing.credit_payto == credit_payto
                        && existing.amount_value == amount.value() as i64
                        && existing.amount_frac == amount.frac() as i32;
                    return Ok(if same {
                        (
                            WireTransferOutcome::Success {
                                row_id: existing.tx_row_id,
                                timestamp: existing.created_at,
                            },
                            None,
                        )
                    } else {
                        (WireTransferOutcome::RequestUidReuse, None)
                    });
                }

                let subject = format_outgoing_subject(wtid, exchange_base_url);
                let spec = TransferSpec {
                    debtor_login: exchange_login,
                    creditor_payto: credit_payto,
                    subject: &subject,
                    amount,
                    timestamp: Utc::now(),
                    allow_admin_creditor: false,
                };
                let result = match transfer(&mut tx, &self.currency, &spec).await? {
                    TransferOutcome::Success(result) => result,
                    TransferOutcome::UnknownCreditor => {
                        return Ok((WireTransferOutcome::UnknownCreditor, None))
                    }
                    TransferOutcome::BothPartySame => {
                        return Ok((WireTransferOutcome::BothPartySame, None))
                    }
                    TransferOutcome::AdminCreditor => {
                        return Ok((WireTransferOutcome::AdminCreditor, None))
                    }
                    TransferOutcome::BalanceInsufficient => {
                        return Ok((WireTransferOutcome::BalanceInsufficient, None))
                    }
                    other => {
                        return Err(BankError::Internal(format!(
                            "wire transfer failed: {other:?}"
                        )))
                    }
                };

                sqlx::query(
                    r#"
                    INSERT INTO transfer_requests
                        (request_uid, account_id, wtid, exchange_base_url, credit_payto,
                         amount_value, amount_frac, tx_row_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(request_uid)
                .bind(exchange.account_id)
                .bind(wtid)
                .bind(exchange_base_url)
                .bind(credit_payto)
                .bind(amount.value() as i64)
                .bind(amount.frac() as i32)
                .bind(result.debit_row_id)
                .bind(result.timestamp)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok((
                    WireTransferOutcome::Success {
                        row_id: result.debit_row_id,
                        timestamp: result.timestamp,
                    },
                    Some(result),
                ))
            })
            .await?;

        if let (WireTransferOutcome::Success { .. }, Some(result)) = &outcome {
            metrics::TRANSACTIONS_TOTAL.inc();
            self.hub.notify(result.debtor_account_id, result.debit_row_id);
            self.hub.notify(result.creditor_account_id, result.credit_row_id);
        }
        Ok(outcome.0)
    }

    /// Book an incoming reserve top-up (`POST .../admin/add-incoming`).
    pub async fn wire_add_incoming(
        &self,
        exchange_login: &str,
        amount: &Amount,
        reserve_pub: &str,
        debit_payto: &str,
    ) -> Result<AddIncomingOutcome> {
        let outcome = self
            .retry_serializable(|| async move {
                let mut tx = self.begin_serializable().await?;
                let Some(exchange) = account_by_login_tx(&mut tx, exchange_login, false).await?
                else {
                    return Ok((AddIncomingOutcome::NotAnExchange, None));
                };
                if !exchange.is_taler_exchange {
                    return Ok((AddIncomingOutcome::NotAnExchange, None));
                }

                let (reuse,): (bool,) = sqlx::query_as(
                    r#"
                    SELECT EXISTS(
                        SELECT 1 FROM bank_transactions
                        WHERE account_id = $1 AND direction = 'credit' AND subject = $2
                    ) OR EXISTS(
                        SELECT 1 FROM withdrawal_operations WHERE reserve_pub = $2
                    )
                    "#,
                )
                .bind(exchange.account_id)
                .bind(reserve_pub)
                .fetch_one(&mut *tx)
                .await?;
                if reuse {
                    return Ok((AddIncomingOutcome::ReservePubReuse, None));
                }

                let Some(debtor) =
                    super::accounts::account_by_payto_tx(&mut tx, debit_payto, false).await?
                else {
                    return Ok((AddIncomingOutcome::UnknownDebtor, None));
                };

                let spec = TransferSpec {
                    debtor_login: &debtor.login,
                    creditor_payto: &exchange.internal_payto,
                    subject: reserve_pub,
                    amount,
                    timestamp: Utc::now(),
                    allow_admin_creditor: false,
                };
                match transfer(&mut tx, &self.currency, &spec).await? {
                    TransferOutcome::Success(result) => {
                        tx.commit().await?;
                        Ok((
                            AddIncomingOutcome::Success {
                                row_id: result.credit_row_id,
                                timestamp: result.timestamp,
                            },
                            Some(result),
                        ))
                    }
                    TransferOutcome::BothPartySame => Ok((AddIncomingOutcome::BothPartySame, None)),
                    TransferOutcome::BalanceInsufficient => {
                        Ok((AddIncomingOutcome::BalanceInsufficient, None))
                    }
                    other => Err(BankError::Internal(format!(
                        "add-incoming transfer failed: {other:?}"
                    ))),
                }
            })
            .await?;

        if let (AddIncomingOutcome::Success { .. }, Some(result)) = &outcome {
            metrics::TRANSACTIONS_TOTAL.inc();
            self.hub.notify(result.debtor_account_id, result.debit_row_id);
            self.hub.notify(result.creditor_account_id, result.credit_row_id);
        }
        Ok(outcome.0)
    }

    async fn gateway_page(
        &self,
        account_id: i64,
        direction: &str,
        start: i64,
        delta: i64,
    ) -> Result<Vec<BankTransactionRow>> {
        let limit = delta.unsigned_abs().min(MAX_HISTORY_DELTA as u64) as i64;
        let order = if delta >= 0 { "ASC" } else { "DESC" };
        let cmp = if delta >= 0 { ">" } else { "<" };
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT row_id, account_id, creditor_payto, debtor_payto, subject,
                   amount_value, amount_frac, direction, transaction_date
            FROM bank_transactions
            WHERE account_id = $1 AND direction = $2 AND row_id {cmp} $3
            ORDER BY row_id {order}
            LIMIT $4
            "#
        ))
        .bind(account_id)
        .bind(direction)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Exchange history in one direction, with malformed subjects skipped
    /// and long polling on an empty forward page.
    pub async fn gateway_history(
        &self,
        exchange_login: &str,
        direction: &str,
        start: Option<i64>,
        delta: i64,
        long_poll: Option<Duration>,
    ) -> Result<Option<Vec<BankTransactionRow>>> {
        let Some(account) = self.account_by_login(exchange_login).await? else {
            return Ok(None);
        };
        if !account.is_taler_exchange {
            return Ok(None);
        }
        let start = start.unwrap_or(if delta >= 0 { 0 } else { i64::MAX });

        let mut waiter = match long_poll {
            Some(_) if delta > 0 => Some(self.hub.subscribe(account.account_id)),
            _ => None,
        };
        let deadline = long_poll.map(|d| Instant::now() + d);

        loop {
            let rows = self.gateway_page(account.account_id, direction, start, delta).await?;
            let filtered: Vec<BankTransactionRow> = rows
                .into_iter()
                .filter(|row| {
                    let ok = match direction {
                        "credit" => parse_incoming_subject(&row.subject).is_some(),
                        _ => parse_outgoing_subject(&row.subject).is_some(),
                    };
                    if !ok {
                        warn!(
                            "skipping transaction {} with unparseable subject {:?}",
                            row.row_id, row.subject
                        );
                    }
                    ok
                })
                .collect();
            if !filtered.is_empty() || waiter.is_none() {
                return Ok(Some(filtered));
            }
            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if remaining.is_zero() {
                return Ok(Some(filtered));
            }
            let Some(rx) = waiter.as_mut() else {
                return Ok(Some(filtered));
            };
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(_) => continue,
                Err(_elapsed) => return Ok(Some(Vec::new())),
            }
        }
    }

    /// Merchant-facing revenue history: every credit of the account.
    pub async fn revenue_history(
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

        let mut waiter = match long_poll {
            Some(_) if delta > 0 => Some(self.hub.subscribe(account.account_id)),
            _ => None,
        };
        let deadline = long_poll.map(|d| Instant::now() + d);

        loop {
            let rows = self.gateway_page(account.account_id, "credit", start, delta).await?;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn wtid() -> String {
        base32::encode(&[0x42u8; 32])
    }

    #[test]
    fn outgoing_subject_round_trip() {
        let subject = format_outgoing_subject(&wtid(), "https://exchange.example.com/");
        let (parsed_wtid, url) = parse_outgoing_subject(&subject).unwrap();
        assert_eq!(parsed_wtid, wtid());
        assert_eq!(url, "https://exchange.example.com/");
    }

    #[test]
    fn outgoing_subject_rejects_malformed() {
        assert!(parse_outgoing_subject("no-space-here").is_none());
        assert!(parse_outgoing_subject("SHORT https://x.example/").is_none());
        let s = format!("{} ftp://x.example/", wtid());
        assert!(parse_outgoing_subject(&s).is_none());
    }

    #[test]
    fn incoming_subject_is_reserve_pub() {
        let pub_key = base32::encode(&[9u8; 32]);
        assert_eq!(parse_incoming_subject(&format!(" {pub_key} ")), Some(pub_key.as_str()));
        assert!(parse_incoming_subject("Gift for Bob").is_none());
        assert!(parse_incoming_subject(&base32::encode(&[1u8; 16])).is_none());
    }
}
