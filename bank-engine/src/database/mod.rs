//! Storage layer.
//!
//! One public method per logical operation; every mutation runs inside a
//! single SERIALIZABLE transaction and is retried a bounded number of
//! times when Postgres reports a serialization failure. Business outcomes
//! are returned as enums, never smuggled through errors.

pub mod accounts;
pub mod cashouts;
pub mod challenges;
pub mod gateway;
pub mod ledger;
pub mod tokens;
pub mod withdrawals;

use crate::errors::{BankError, Result};
use crate::metrics;
use bank_core::Amount;
use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Attempts per logical operation before giving up with a soft error.
const MAX_SERIALIZATION_RETRIES: u32 = 3;

/// Capacity of a per-account wakeup channel; long-poll waiters only care
/// about "something changed", so lagging receivers are fine.
const HUB_CHANNEL_CAPACITY: usize = 16;

/// Per-account wakeup fan-out for long polling. Publishers fire after a
/// commit that touched the account; waiters subscribe *before* taking
/// their final snapshot so no insert is lost in between.
#[derive(Default)]
pub struct NotificationHub {
    channels: DashMap<i64, broadcast::Sender<i64>>,
}

impl NotificationHub {
    pub fn subscribe(&self, account_id: i64) -> broadcast::Receiver<i64> {
        self.channels
            .entry(account_id)
            .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn notify(&self, account_id: i64, row_id: i64) {
        if let Some(sender) = self.channels.get(&account_id) {
            if sender.send(row_id).is_err() {
                // nobody is waiting; drop the entry to keep the map small
                drop(sender);
                self.channels
                    .remove_if(&account_id, |_, s| s.receiver_count() == 0);
            }
        }
    }
}

pub struct Database {
    pool: PgPool,
    currency: String,
    pub hub: NotificationHub,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32, currency: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database {
            pool,
            currency: currency.to_string(),
            hub: NotificationHub::default(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BankError::Internal(format!("migration failed: {e}")))
    }

    pub(crate) async fn begin_serializable(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Run `op` until it commits, retrying serialization failures.
    pub(crate) async fn retry_serializable<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(BankError::Database(err)) if is_serialization_failure(&err) => {
                    attempt += 1;
                    metrics::SERIALIZATION_RETRIES.inc();
                    if attempt > MAX_SERIALIZATION_RETRIES {
                        warn!("giving up after {attempt} serialization failures");
                        return Err(BankError::SoftFailure);
                    }
                }
                other => return other,
            }
        }
    }
}

pub(crate) fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

/// Rebuild an [`Amount`] from its `(value, frac)` column pair. The stored
/// values are written by us, so a failure here is an invariant breach.
pub(crate) fn amount_from_columns(currency: &str, value: i64, frac: i32) -> Result<Amount> {
    Amount::new(currency, value as u64, frac as u32)
        .map_err(|e| BankError::Internal(format!("stored amount invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_wakes_subscriber() {
        let hub = NotificationHub::default();
        let mut rx = hub.subscribe(7);
        hub.notify(7, 42);
        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn hub_drops_idle_entries() {
        let hub = NotificationHub::default();
        {
            let _rx = hub.subscribe(7);
        }
        // receiver gone: the next notify cleans the entry up
        hub.notify(7, 1);
        assert!(hub.channels.is_empty());
    }

    #[tokio::test]
    async fn hub_notify_without_subscribers_is_noop() {
        let hub = NotificationHub::default();
        hub.notify(1, 1);
        assert!(hub.channels.is_empty());
    }
}
