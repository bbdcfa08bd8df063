//! Bearer-token persistence. Expiry is enforced by the auth gate, not
//! here; logout deletes eagerly, expired rows are left behind.

use super::Database;
use crate::errors::{BankError, Result};
use crate::models::TokenScope;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct TokenRow {
    login: String,
    scope: String,
    is_refreshable: bool,
    expiration_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct BearerTokenRecord {
    pub login: String,
    pub scope: TokenScope,
    pub is_refreshable: bool,
    pub expiration: Option<DateTime<Utc>>,
}

impl Database {
    pub async fn token_create(
        &self,
        login: &str,
        token: &[u8; 32],
        scope: TokenScope,
        is_refreshable: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            INSERT INTO bearer_tokens (token, account_id, scope, is_refreshable, creation_time, expiration_time)
            SELECT $1, account_id, $2, $3, $4, $5 FROM accounts WHERE login = $6
            "#,
        )
        .bind(&token[..])
        .bind(scope.to_string())
        .bind(is_refreshable)
        .bind(Utc::now())
        .bind(expiration)
        .bind(login)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    pub async fn token_get(&self, token: &[u8; 32]) -> Result<Option<BearerTokenRecord>> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT a.login, t.scope, t.is_refreshable, t.expiration_time
            FROM bearer_tokens t
            JOIN accounts a ON a.account_id = t.account_id
            WHERE t.token = $1
            "#,
        )
        .bind(&token[..])
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(BearerTokenRecord {
                login: r.login,
                scope: r
                    .scope
                    .parse()
                    .map_err(|e: String| BankError::Internal(e))?,
                is_refreshable: r.is_refreshable,
                expiration: r.expiration_time,
            })
        })
        .transpose()
    }

    /// Idempotent: deleting an unknown token succeeds.
    pub async fn token_delete(&self, token: &[u8; 32]) -> Result<()> {
        sqlx::query("DELETE FROM bearer_tokens WHERE token = $1")
            .bind(&token[..])
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
