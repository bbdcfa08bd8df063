use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref TRANSACTIONS_TOTAL: IntCounter = IntCounter::new(
        "bank_transactions_total",
        "Ledger transfers committed"
    ).expect("metric can be created");

    pub static ref WITHDRAWALS_CONFIRMED: IntCounter = IntCounter::new(
        "bank_withdrawals_confirmed_total",
        "Taler withdrawals confirmed"
    ).expect("metric can be created");

    pub static ref CASHOUTS_TOTAL: IntCounter = IntCounter::new(
        "bank_cashouts_total",
        "Cashouts executed"
    ).expect("metric can be created");

    pub static ref TAN_SENDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bank_tan_sends_total", "TAN codes dispatched"),
        &["channel", "outcome"]
    ).expect("metric can be created");

    pub static ref SERIALIZATION_RETRIES: IntCounter = IntCounter::new(
        "bank_serialization_retries_total",
        "Transactions retried after a serialization failure"
    ).expect("metric can be created");
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(TRANSACTIONS_TOTAL.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(WITHDRAWALS_CONFIRMED.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(CASHOUTS_TOTAL.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(TAN_SENDS_TOTAL.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(SERIALIZATION_RETRIES.clone()))
        .expect("collector can be registered");
}

pub fn metrics_handler() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
