//! End-to-end storage scenarios against a real Postgres.
//!
//! These need a provisioned database and are ignored by default:
//!
//!     DATABASE_URL=postgres://localhost/bank_test cargo test -- --ignored

use bank_core::{base32, Amount};
use bank_engine::auth;
use bank_engine::database::accounts::{AccountCreationOutcome, CreateAccountArgs, BONUS_SUBJECT};
use bank_engine::database::challenges::{ChallengeOp, ChallengeSolveOutcome};
use bank_engine::database::gateway::WireTransferOutcome;
use bank_engine::database::ledger::TransferOutcome;
use bank_engine::database::withdrawals::{
    WithdrawalAbortOutcome, WithdrawalConfirmOutcome, WithdrawalSelectionOutcome,
};
use bank_engine::database::Database;
use chrono::Duration;
use rand::Rng;
use uuid::Uuid;

const CURRENCY: &str = "KUDOS";

fn amt(s: &str) -> Amount {
    s.parse().unwrap()
}

fn unique(prefix: &str) -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("{prefix}-{n:016x}")
}

async fn setup() -> Database {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/bank_test".to_string());
    let db = Database::new(&url, 5, CURRENCY).await.unwrap();
    db.run_migrations().await.unwrap();
    if db.account_password_hash("admin").await.unwrap().is_none() {
        let hash = auth::hash_password("admin-password".to_string()).await.unwrap();
        db.seed_admin(&hash, "payto://x-taler-bank/test/admin").await.unwrap();
    }
    db
}

async fn give_balance(db: &Database, login: &str, amount: &Amount) {
    sqlx::query("UPDATE accounts SET balance_value = $1, balance_frac = $2, has_debt = FALSE WHERE login = $3")
        .bind(amount.value() as i64)
        .bind(amount.frac() as i32)
        .bind(login)
        .execute(db.pool())
        .await
        .unwrap();
}

async fn balance_of(db: &Database, login: &str) -> (Amount, bool) {
    let (value, frac, has_debt): (i64, i32, bool) =
        sqlx::query_as("SELECT balance_value, balance_frac, has_debt FROM accounts WHERE login = $1")
            .bind(login)
            .fetch_one(db.pool())
            .await
            .unwrap();
    (
        Amount::new(CURRENCY, value as u64, frac as u32).unwrap(),
        has_debt,
    )
}

fn account_args(login: &str, is_exchange: bool, bonus: Option<Amount>) -> CreateAccountArgs {
    CreateAccountArgs {
        login: login.to_string(),
        password_hash: "unchecked".to_string(),
        name: login.to_string(),
        internal_payto: None,
        cashout_payto: None,
        email: None,
        phone: None,
        is_public: false,
        is_taler_exchange: is_exchange,
        debit_threshold: amt("KUDOS:0"),
        min_cashout: None,
        tan_channel: None,
        registration_bonus: bonus,
        wire_type: "x-taler-bank".to_string(),
        iban_country: "CH".to_string(),
        hostname: "bank.test".to_string(),
    }
}

async fn register(db: &Database, login: &str, is_exchange: bool) -> String {
    match db.account_create(&account_args(login, is_exchange, None)).await.unwrap() {
        AccountCreationOutcome::Success { internal_payto } => internal_payto,
        other => panic!("account creation failed: {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn registration_bonus_moves_admin_funds() {
    let db = setup().await;
    give_balance(&db, "admin", &amt("KUDOS:1000")).await;

    let alice = unique("alice");
    let outcome = db
        .account_create(&account_args(&alice, false, Some(amt("KUDOS:100"))))
        .await
        .unwrap();
    assert!(matches!(outcome, AccountCreationOutcome::Success { .. }));

    let (balance, has_debt) = balance_of(&db, &alice).await;
    assert_eq!(balance, amt("KUDOS:100"));
    assert!(!has_debt);
    let (admin_balance, _) = balance_of(&db, "admin").await;
    assert_eq!(admin_balance, amt("KUDOS:900"));

    let history = db
        .transaction_history(&alice, None, 10, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].subject, BONUS_SUBJECT);
    assert_eq!(history[0].direction, "credit");
}

#[tokio::test]
#[ignore]
async fn bonus_fails_when_admin_cannot_cover_it() {
    let db = setup().await;
    give_balance(&db, "admin", &amt("KUDOS:1")).await;

    let outcome = db
        .account_create(&account_args(&unique("broke"), false, Some(amt("KUDOS:100"))))
        .await
        .unwrap();
    assert!(matches!(outcome, AccountCreationOutcome::BonusBalanceInsufficient));
}

#[tokio::test]
#[ignore]
async fn two_phase_withdrawal_settles_on_confirm() {
    let db = setup().await;
    let alice = unique("alice");
    register(&db, &alice, false).await;
    give_balance(&db, &alice, &amt("KUDOS:100")).await;
    let exchange = unique("exchange");
    let exchange_payto = register(&db, &exchange, true).await;

    let uuid = Uuid::new_v4();
    db.withdrawal_create(&alice, uuid, &amt("KUDOS:5")).await.unwrap();
    assert_eq!(db.withdrawal_get(uuid).await.unwrap().unwrap().status, "pending");

    let reserve_pub = base32::encode(&rand::thread_rng().gen::<[u8; 32]>());
    let selection = db
        .withdrawal_select(uuid, &reserve_pub, &exchange_payto)
        .await
        .unwrap();
    assert!(matches!(selection, WithdrawalSelectionOutcome::Success { .. }));

    // selecting again with the same values stays idempotent
    let again = db
        .withdrawal_select(uuid, &reserve_pub, &exchange_payto)
        .await
        .unwrap();
    assert!(matches!(again, WithdrawalSelectionOutcome::Success { .. }));

    let confirm = db.withdrawal_confirm(uuid).await.unwrap();
    assert!(matches!(confirm, WithdrawalConfirmOutcome::Success));

    let (alice_balance, _) = balance_of(&db, &alice).await;
    assert_eq!(alice_balance, amt("KUDOS:95"));
    let (exchange_balance, _) = balance_of(&db, &exchange).await;
    assert_eq!(exchange_balance, amt("KUDOS:5"));

    let history = db
        .transaction_history(&exchange, None, 10, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.last().unwrap().subject, reserve_pub);

    // repeated confirm is idempotent
    let confirm = db.withdrawal_confirm(uuid).await.unwrap();
    assert!(matches!(confirm, WithdrawalConfirmOutcome::Success));
    let (alice_balance, _) = balance_of(&db, &alice).await;
    assert_eq!(alice_balance, amt("KUDOS:95"));
}

#[tokio::test]
#[ignore]
async fn wire_transfer_is_idempotent_by_request_uid() {
    let db = setup().await;
    let exchange = unique("exchange");
    register(&db, &exchange, true).await;
    give_balance(&db, &exchange, &amt("KUDOS:50")).await;
    let alice = unique("alice");
    let alice_payto = register(&db, &alice, false).await;

    let request_uid = unique("req");
    let wtid = base32::encode(&rand::thread_rng().gen::<[u8; 32]>());
    let url = "https://exchange.example.com/";

    let first = db
        .wire_transfer(&exchange, &request_uid, &amt("KUDOS:2"), url, &wtid, &alice_payto)
        .await
        .unwrap();
    let WireTransferOutcome::Success { row_id, timestamp } = first else {
        panic!("transfer failed: {first:?}");
    };

    let second = db
        .wire_transfer(&exchange, &request_uid, &amt("KUDOS:2"), url, &wtid, &alice_payto)
        .await
        .unwrap();
    let WireTransferOutcome::Success {
        row_id: row_id2,
        timestamp: timestamp2,
    } = second
    else {
        panic!("replay failed: {second:?}");
    };
    assert_eq!(row_id, row_id2);
    assert_eq!(timestamp, timestamp2);

    let (alice_balance, _) = balance_of(&db, &alice).await;
    assert_eq!(alice_balance, amt("KUDOS:2"));

    // same uid with a different tuple conflicts
    let conflict = db
        .wire_transfer(&exchange, &request_uid, &amt("KUDOS:3"), url, &wtid, &alice_payto)
        .await
        .unwrap();
    assert!(matches!(conflict, WireTransferOutcome::RequestUidReuse));
}

#[tokio::test]
#[ignore]
async fn debit_limit_blocks_overdraft() {
    let db = setup().await;
    let alice = unique("alice");
    register(&db, &alice, false).await;
    sqlx::query("UPDATE accounts SET debit_threshold_value = 10 WHERE login = $1")
        .bind(&alice)
        .execute(db.pool())
        .await
        .unwrap();
    let bob = unique("bob");
    let bob_payto = register(&db, &bob, false).await;

    let blocked = db
        .create_transaction(&alice, &bob_payto, "too much", &amt("KUDOS:11"), None)
        .await
        .unwrap();
    assert!(matches!(blocked, TransferOutcome::BalanceInsufficient));
    let (alice_balance, has_debt) = balance_of(&db, &alice).await;
    assert!(alice_balance.is_zero());
    assert!(!has_debt);

    let allowed = db
        .create_transaction(&alice, &bob_payto, "within limit", &amt("KUDOS:10"), None)
        .await
        .unwrap();
    assert!(matches!(allowed, TransferOutcome::Success(_)));
    let (alice_balance, has_debt) = balance_of(&db, &alice).await;
    assert_eq!(alice_balance, amt("KUDOS:10"));
    assert!(has_debt);
}

#[tokio::test]
#[ignore]
async fn tan_retries_are_bounded() {
    let db = setup().await;
    let alice = unique("alice");
    register(&db, &alice, false).await;

    let id = db
        .challenge_create(&alice, ChallengeOp::Cashout, "{}", "123456", Duration::hours(1), 3)
        .await
        .unwrap()
        .unwrap();

    for expected_bad in 0..2 {
        let outcome = db.challenge_solve(id, &alice, "000000").await.unwrap();
        assert!(
            matches!(outcome, ChallengeSolveOutcome::BadCode),
            "attempt {expected_bad} was not BadCode"
        );
    }
    let outcome = db.challenge_solve(id, &alice, "000000").await.unwrap();
    assert!(matches!(outcome, ChallengeSolveOutcome::NoRetry));
    // even the right code is now rejected
    let outcome = db.challenge_solve(id, &alice, "123456").await.unwrap();
    assert!(matches!(outcome, ChallengeSolveOutcome::NoRetry));

    // a fresh challenge with the right code succeeds and carries the body
    let id = db
        .challenge_create(
            &alice,
            ChallengeOp::Cashout,
            r#"{"request_uid":"x"}"#,
            "654321",
            Duration::hours(1),
            3,
        )
        .await
        .unwrap()
        .unwrap();
    match db.challenge_solve(id, &alice, "654321").await.unwrap() {
        ChallengeSolveOutcome::Success { op, body } => {
            assert_eq!(op, ChallengeOp::Cashout);
            assert_eq!(body, r#"{"request_uid":"x"}"#);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn abort_and_confirm_conflict() {
    let db = setup().await;
    let alice = unique("alice");
    register(&db, &alice, false).await;
    give_balance(&db, &alice, &amt("KUDOS:10")).await;
    let exchange = unique("exchange");
    let exchange_payto = register(&db, &exchange, true).await;

    let uuid = Uuid::new_v4();
    db.withdrawal_create(&alice, uuid, &amt("KUDOS:5")).await.unwrap();
    let reserve_pub = base32::encode(&rand::thread_rng().gen::<[u8; 32]>());
    db.withdrawal_select(uuid, &reserve_pub, &exchange_payto).await.unwrap();

    assert!(matches!(
        db.withdrawal_abort(uuid).await.unwrap(),
        WithdrawalAbortOutcome::Success
    ));
    assert!(matches!(
        db.withdrawal_confirm(uuid).await.unwrap(),
        WithdrawalConfirmOutcome::AlreadyAborted
    ));
    // abort is idempotent
    assert!(matches!(
        db.withdrawal_abort(uuid).await.unwrap(),
        WithdrawalAbortOutcome::Success
    ));
    // no funds moved
    let (alice_balance, _) = balance_of(&db, &alice).await;
    assert_eq!(alice_balance, amt("KUDOS:10"));
}
