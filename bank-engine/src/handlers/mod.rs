//! HTTP surface: routing, shared state and the root endpoints.

pub mod accounts;
pub mod cashouts;
pub mod challenges;
pub mod conversion;
pub mod gateway;
pub mod transactions;
pub mod withdrawals;

use crate::config::Config;
use crate::database::Database;
use crate::errors::{BankError, Result};
use crate::metrics;
use crate::models::{BankConfigResponse, CurrencySpecification, HistoryParams};
use actix_web::{web, HttpResponse};
use bank_core::TalerErrorCode;
use std::sync::Arc;
use std::time::Duration;

/// Longest tolerated long-poll, to bound parked connections.
const MAX_LONG_POLL_MS: u64 = 60_000;

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
}

/// Resolve `(start, delta, long_poll)` out of history query parameters.
pub(crate) fn history_args(params: &HistoryParams) -> Result<(Option<i64>, i64, Option<Duration>)> {
    let delta = params.delta.unwrap_or(-20);
    if delta == 0 {
        return Err(BankError::bad_request(
            TalerErrorCode::GenericParameterMalformed,
            "delta must not be zero",
        ));
    }
    let long_poll = params
        .long_poll_ms
        .map(|ms| Duration::from_millis(ms.min(MAX_LONG_POLL_MS)));
    Ok((params.start, delta, long_poll))
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "bank-engine",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "Failed to gather metrics",
            "details": e.to_string(),
        })),
    }
}

/// `GET /config`
pub async fn bank_config(state: web::Data<AppState>) -> HttpResponse {
    let bank = &state.config.bank;
    HttpResponse::Ok().json(BankConfigResponse {
        bank_name: bank.name.clone(),
        base_url: bank.base_url.clone(),
        currency: bank.currency.clone(),
        currency_specification: CurrencySpecification::default_for(&bank.currency),
        allow_conversion: state.config.conversion_enabled(),
        allow_registrations: bank.allow_registrations,
        allow_deletions: bank.allow_deletions,
        allow_edit_name: bank.allow_edit_name,
        allow_edit_cashout_payto_uri: bank.allow_edit_cashout_payto_uri,
        default_debit_threshold: bank.default_debit_threshold.clone(),
        supported_tan_channels: state.config.supported_tan_channels(),
        wire_type: bank.wire_type.clone(),
    })
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/config", web::get().to(bank_config))
        .route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/public-accounts", web::get().to(accounts::list_public_accounts))
        .route("/accounts", web::post().to(accounts::create_account))
        .route("/accounts", web::get().to(accounts::list_accounts))
        .service(
            web::scope("/accounts/{username}")
                .route("", web::get().to(accounts::get_account))
                .route("", web::patch().to(accounts::patch_account))
                .route("", web::delete().to(accounts::delete_account))
                .route("/auth", web::patch().to(accounts::patch_account_auth))
                .route("/token", web::post().to(accounts::create_token))
                .route("/token", web::delete().to(accounts::delete_token))
                .route("/transactions", web::get().to(transactions::get_transactions))
                .route("/transactions", web::post().to(transactions::create_transaction))
                .route("/transactions/{tid}", web::get().to(transactions::get_transaction))
                .route("/withdrawals", web::post().to(withdrawals::create_withdrawal))
                .route(
                    "/withdrawals/{wid}/confirm",
                    web::post().to(withdrawals::confirm_withdrawal),
                )
                .route(
                    "/withdrawals/{wid}/abort",
                    web::post().to(withdrawals::abort_withdrawal),
                )
                .route("/cashouts", web::post().to(cashouts::create_cashout))
                .route("/cashouts", web::get().to(cashouts::list_cashouts))
                .route("/cashouts/{cid}", web::get().to(cashouts::get_cashout))
                .route("/challenge/{cid}", web::post().to(challenges::resend_challenge))
                .route(
                    "/challenge/{cid}/confirm",
                    web::post().to(challenges::confirm_challenge),
                )
                .route(
                    "/taler-wire-gateway/config",
                    web::get().to(gateway::wire_gateway_config),
                )
                .route(
                    "/taler-wire-gateway/transfer",
                    web::post().to(gateway::transfer),
                )
                .route(
                    "/taler-wire-gateway/admin/add-incoming",
                    web::post().to(gateway::add_incoming),
                )
                .route(
                    "/taler-wire-gateway/history/incoming",
                    web::get().to(gateway::history_incoming),
                )
                .route(
                    "/taler-wire-gateway/history/outgoing",
                    web::get().to(gateway::history_outgoing),
                )
                .route("/taler-revenue/config", web::get().to(gateway::revenue_config))
                .route("/taler-revenue/history", web::get().to(gateway::revenue_history)),
        )
        // wallet integration endpoints, addressed by operation id only
        .route("/withdrawals/{wid}", web::get().to(withdrawals::get_withdrawal))
        .route("/withdrawals/{wid}", web::post().to(withdrawals::select_withdrawal))
        .route("/taler-wire-gateway/config", web::get().to(gateway::wire_gateway_config))
        .route("/cashouts", web::get().to(cashouts::list_all_cashouts))
        .service(
            web::scope("/conversion-info")
                .route("/config", web::get().to(conversion::conversion_config))
                .route("/cashout-rate", web::get().to(conversion::cashout_rate))
                .route("/cashin-rate", web::get().to(conversion::cashin_rate))
                .route(
                    "/conversion-rate",
                    web::post().to(conversion::set_conversion_rate),
                ),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryParams;

    #[test]
    fn history_defaults_and_caps() {
        let params = HistoryParams {
            start: None,
            delta: None,
            long_poll_ms: Some(600_000),
        };
        let (start, delta, poll) = history_args(&params).unwrap();
        assert_eq!(start, None);
        assert_eq!(delta, -20);
        assert_eq!(poll, Some(Duration::from_millis(MAX_LONG_POLL_MS)));
    }

    #[test]
    fn zero_delta_rejected() {
        let params = HistoryParams {
            start: Some(5),
            delta: Some(0),
            long_poll_ms: None,
        };
        assert!(history_args(&params).is_err());
    }
}
