//! Request authentication and the admin/self access policy.
//!
//! Every protected handler resolves the `Authorization` header to an
//! [`Identity`] first. Basic credentials are checked against the stored
//! argon2 hash on the blocking pool; Bearer credentials are
//! `secret-token:`-prefixed Crockford Base32 of the 32 token bytes.

use crate::database::Database;
use crate::errors::{BankError, Result};
use crate::models::TokenScope;
use actix_web::HttpRequest;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use bank_core::{base32, TalerErrorCode};
use chrono::Utc;
use rand::rngs::OsRng;

pub const TOKEN_PREFIX: &str = "secret-token:";

#[derive(Debug, Clone)]
pub struct Identity {
    pub login: String,
    pub is_admin: bool,
}

impl Identity {
    fn new(login: String) -> Self {
        let is_admin = login == "admin";
        Identity { login, is_admin }
    }
}

fn unauthorized(hint: &str) -> BankError {
    BankError::unauthorized(TalerErrorCode::GenericUnauthorized, hint)
}

/// Hash a password with argon2id and a fresh salt.
pub async fn hash_password(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| BankError::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| BankError::Internal(format!("hashing task failed: {e}")))?
}

/// Constant-time verification against a stored PHC hash string.
pub async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| BankError::Internal(format!("stored hash unreadable: {e}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| BankError::Internal(format!("verification task failed: {e}")))?
}

/// Split `login:password` out of a Basic credential blob.
pub fn parse_basic(credentials: &str) -> Option<(String, String)> {
    let decoded = data_encoding::BASE64
        .decode(credentials.trim().as_bytes())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (login, password) = text.split_once(':')?;
    if login.is_empty() {
        return None;
    }
    Some((login.to_string(), password.to_string()))
}

/// Extract the 32 raw token bytes from a Bearer credential.
pub fn parse_bearer(credentials: &str) -> Result<[u8; 32]> {
    let encoded = credentials
        .trim()
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| unauthorized("bearer token must carry the secret-token: prefix"))?;
    base32::decode32(encoded)
        .map_err(|_| BankError::unauthorized(TalerErrorCode::GenericTokenUnknown, "malformed token"))
}

/// Authenticate the request, demanding at least `scope`.
pub async fn authenticate(db: &Database, req: &HttpRequest, scope: TokenScope) -> Result<Identity> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing Authorization header"))?;

    let (scheme, credentials) = header
        .split_once(' ')
        .ok_or_else(|| unauthorized("malformed Authorization header"))?;

    match scheme {
        "Basic" => {
            let (login, password) =
                parse_basic(credentials).ok_or_else(|| unauthorized("malformed Basic credentials"))?;
            let hash = db
                .account_password_hash(&login)
                .await?
                .ok_or_else(|| {
                    BankError::unauthorized(TalerErrorCode::BankLoginFailed, "bad credentials")
                })?;
            if !verify_password(password, hash).await? {
                return Err(BankError::unauthorized(
                    TalerErrorCode::BankLoginFailed,
                    "bad credentials",
                ));
            }
            Ok(Identity::new(login))
        }
        "Bearer" => {
            let token = parse_bearer(credentials)?;
            let record = db.token_get(&token).await?.ok_or_else(|| {
                BankError::unauthorized(TalerErrorCode::GenericTokenUnknown, "unknown token")
            })?;
            if let Some(expiration) = record.expiration {
                if expiration <= Utc::now() {
                    return Err(BankError::unauthorized(
                        TalerErrorCode::GenericTokenExpired,
                        "token expired",
                    ));
                }
            }
            match scope {
                TokenScope::ReadOnly => {}
                TokenScope::ReadWrite => {
                    if record.scope == TokenScope::ReadOnly {
                        return Err(BankError::forbidden(
                            TalerErrorCode::GenericTokenPermissionInsufficient,
                            "readonly token cannot perform this operation",
                        ));
                    }
                }
                TokenScope::Refreshable => {
                    if !record.is_refreshable {
                        return Err(BankError::forbidden(
                            TalerErrorCode::GenericTokenPermissionInsufficient,
                            "token is not refreshable",
                        ));
                    }
                }
            }
            Ok(Identity::new(record.login))
        }
        _ => Err(unauthorized("unsupported authorization scheme")),
    }
}

/// Enforce the `{USERNAME}` path segment: the caller must be that user,
/// or admin where the route admits admin.
pub fn authorize_for(identity: &Identity, username: &str, allow_admin: bool) -> Result<()> {
    if identity.login == username {
        return Ok(());
    }
    if identity.is_admin && allow_admin {
        return Ok(());
    }
    Err(BankError::forbidden(
        TalerErrorCode::GenericUnauthorized,
        "account mismatch",
    ))
}

/// Routes restricted to the admin identity.
pub fn require_admin(identity: &Identity) -> Result<()> {
    if identity.is_admin {
        return Ok(());
    }
    Err(BankError::forbidden(
        TalerErrorCode::GenericUnauthorized,
        "admin only",
    ))
}

/// Authenticate and bind to the path username in one step.
pub async fn authenticate_for(
    db: &Database,
    req: &HttpRequest,
    username: &str,
    scope: TokenScope,
    allow_admin: bool,
) -> Result<Identity> {
    let identity = authenticate(db, req, scope).await?;
    authorize_for(&identity, username, allow_admin)?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_parse() {
        let blob = data_encoding::BASE64.encode(b"alice:hunter2:with:colons");
        let (login, password) = parse_basic(&blob).unwrap();
        assert_eq!(login, "alice");
        assert_eq!(password, "hunter2:with:colons");
    }

    #[test]
    fn basic_rejects_empty_login_and_garbage() {
        assert!(parse_basic(&data_encoding::BASE64.encode(b":pw")).is_none());
        assert!(parse_basic(&data_encoding::BASE64.encode(b"nopassword")).is_none());
        assert!(parse_basic("!!!not-base64!!!").is_none());
    }

    #[test]
    fn bearer_requires_prefix_and_length() {
        let token = [7u8; 32];
        let wire = format!("{}{}", TOKEN_PREFIX, base32::encode(&token));
        assert_eq!(parse_bearer(&wire).unwrap(), token);

        assert!(parse_bearer(&base32::encode(&token)).is_err());
        let short = format!("{}{}", TOKEN_PREFIX, base32::encode(&[7u8; 8]));
        assert!(parse_bearer(&short).is_err());
    }

    #[test]
    fn path_policy() {
        let alice = Identity::new("alice".to_string());
        let admin = Identity::new("admin".to_string());

        assert!(authorize_for(&alice, "alice", false).is_ok());
        assert!(authorize_for(&alice, "bob", true).is_err());
        assert!(authorize_for(&admin, "bob", true).is_ok());
        assert!(authorize_for(&admin, "bob", false).is_err());
        assert!(require_admin(&admin).is_ok());
        assert!(require_admin(&alice).is_err());
    }

    #[tokio::test]
    async fn password_hash_round_trip() {
        let hash = hash_password("correct horse".to_string()).await.unwrap();
        assert!(verify_password("correct horse".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_password("wrong".to_string(), hash).await.unwrap());
    }
}
