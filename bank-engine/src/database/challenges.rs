//! TAN challenges gating sensitive operations.
//!
//! A challenge wraps the original request body; solving it replays the
//! operation with 2FA satisfied. Retry accounting and expiry live here so
//! concurrent solve attempts cannot overspend the retry budget.

use super::Database;
use crate::errors::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Operations that a challenge can guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOp {
    AccountDelete,
    AccountReconfig,
    AccountAuthReconfig,
    BankTransaction,
    WithdrawalConfirm,
    Cashout,
}

impl fmt::Display for ChallengeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeOp::AccountDelete => "account-delete",
            ChallengeOp::AccountReconfig => "account-reconfig",
            ChallengeOp::AccountAuthReconfig => "account-auth-reconfig",
            ChallengeOp::BankTransaction => "bank-transaction",
            ChallengeOp::WithdrawalConfirm => "withdrawal-confirm",
            ChallengeOp::Cashout => "cashout",
        };
        f.write_str(s)
    }
}

impl FromStr for ChallengeOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "account-delete" => Ok(ChallengeOp::AccountDelete),
            "account-reconfig" => Ok(ChallengeOp::AccountReconfig),
            "account-auth-reconfig" => Ok(ChallengeOp::AccountAuthReconfig),
            "bank-transaction" => Ok(ChallengeOp::BankTransaction),
            "withdrawal-confirm" => Ok(ChallengeOp::WithdrawalConfirm),
            "cashout" => Ok(ChallengeOp::Cashout),
            other => Err(format!("unknown challenge op {other:?}")),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChallengeRow {
    pub challenge_id: i64,
    pub account_id: i64,
    pub login: String,
    pub op: String,
    pub body: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub retry_counter: i32,
    pub confirmation_date: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum ChallengeSolveOutcome {
    /// Code accepted; the wrapped operation can replay now.
    Success { op: ChallengeOp, body: String },
    UnknownChallenge,
    AlreadySolved,
    Expired,
    BadCode,
    NoRetry,
}

const CHALLENGE_COLUMNS: &str = r#"
    c.challenge_id, c.account_id, a.login, c.op, c.body, c.code,
    c.created_at, c.expiration_date, c.last_sent_at, c.retry_counter,
    c.confirmation_date
"#;

impl Database {
    pub async fn challenge_create(
        &self,
        login: &str,
        op: ChallengeOp,
        body: &str,
        code: &str,
        validity: Duration,
        retries: u32,
    ) -> Result<Option<i64>> {
        let now = Utc::now();
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO tan_challenges
                (account_id, op, body, code, created_at, expiration_date, retry_counter)
            SELECT account_id, $1, $2, $3, $4, $5, $6 FROM accounts WHERE login = $7
            RETURNING challenge_id
            "#,
        )
        .bind(op.to_string())
        .bind(body)
        .bind(code)
        .bind(now)
        .bind(now + validity)
        .bind(retries as i32)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn challenge_get(&self, id: i64, login: &str) -> Result<Option<ChallengeRow>> {
        let row = sqlx::query_as(&format!(
            r#"
            SELECT {CHALLENGE_COLUMNS}
            FROM tan_challenges c
            JOIN accounts a ON a.account_id = c.account_id
            WHERE c.challenge_id = $1 AND a.login = $2
            "#
        ))
        .bind(id)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Rotate the code if the retransmission period has passed and stamp
    /// the send time. Returns the code that should go out.
    pub async fn challenge_mark_sent(
        &self,
        id: i64,
        fresh_code: &str,
        retransmission_period: Duration,
    ) -> Result<Option<String>> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;
            let row: Option<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
                "SELECT code, last_sent_at FROM tan_challenges WHERE challenge_id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some((code, last_sent_at)) = row else {
                return Ok(None);
            };
            let now = Utc::now();
            let rotate = match last_sent_at {
                Some(at) => now - at >= retransmission_period,
                None => false,
            };
            let outgoing = if rotate { fresh_code.to_string() } else { code };
            sqlx::query(
                "UPDATE tan_challenges SET code = $1, last_sent_at = $2 WHERE challenge_id = $3",
            )
            .bind(&outgoing)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(Some(outgoing))
        })
        .await
    }

    pub async fn challenge_solve(
        &self,
        id: i64,
        login: &str,
        code: &str,
    ) -> Result<ChallengeSolveOutcome> {
        self.retry_serializable(|| async move {
            let mut tx = self.begin_serializable().await?;
            let row: Option<ChallengeRow> = sqlx::query_as(&format!(
                r#"
                SELECT {CHALLENGE_COLUMNS}
                FROM tan_challenges c
                JOIN accounts a ON a.account_id = c.account_id
                WHERE c.challenge_id = $1 AND a.login = $2
                FOR UPDATE OF c
                "#
            ))
            .bind(id)
            .bind(login)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else {
                return Ok(ChallengeSolveOutcome::UnknownChallenge);
            };
            if row.confirmation_date.is_some() {
                return Ok(ChallengeSolveOutcome::AlreadySolved);
            }
            let now = Utc::now();
            if row.expiration_date <= now {
                return Ok(ChallengeSolveOutcome::Expired);
            }
            if row.retry_counter <= 0 {
                return Ok(ChallengeSolveOutcome::NoRetry);
            }
            if row.code != code {
                sqlx::query(
                    "UPDATE tan_challenges SET retry_counter = retry_counter - 1 WHERE challenge_id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(if row.retry_counter <= 1 {
                    ChallengeSolveOutcome::NoRetry
                } else {
                    ChallengeSolveOutcome::BadCode
                });
            }
            sqlx::query(
                "UPDATE tan_challenges SET confirmation_date = $1 WHERE challenge_id = $2",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            let op = row
                .op
                .parse()
                .map_err(|e: String| crate::errors::BankError::Internal(e))?;
            Ok(ChallengeSolveOutcome::Success { op, body: row.body })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_ops_round_trip_db_text() {
        for op in [
            ChallengeOp::AccountDelete,
            ChallengeOp::AccountReconfig,
            ChallengeOp::AccountAuthReconfig,
            ChallengeOp::BankTransaction,
            ChallengeOp::WithdrawalConfirm,
            ChallengeOp::Cashout,
        ] {
            assert_eq!(op.to_string().parse::<ChallengeOp>().unwrap(), op);
        }
    }
}
