//! Conversion-info endpoints.

use super::AppState;
use crate::auth;
use crate::errors::{BankError, Result};
use crate::models::{ConversionInfoConfig, ConversionRateQuery, ConversionResponse, TokenScope};
use actix_web::{web, HttpRequest, HttpResponse};
use bank_core::conversion::{ConversionRate, ConversionSide};
use bank_core::TalerErrorCode;

async fn require_conversion(state: &AppState) -> Result<(ConversionRate, String)> {
    let Some(fiat) = state.config.bank.fiat_currency.clone() else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion is not enabled",
        ));
    };
    let Some(rate) = state.db.conversion_rate_get().await? else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion rate not configured",
        ));
    };
    Ok((rate, fiat))
}

/// `GET /conversion-info/config`
pub async fn conversion_config(state: web::Data<AppState>) -> Result<HttpResponse> {
    let (rate, fiat) = require_conversion(&state).await?;
    Ok(HttpResponse::Ok().json(ConversionInfoConfig {
        regional_currency: state.config.bank.currency.clone(),
        fiat_currency: fiat,
        conversion_rate: rate,
    }))
}

fn rate_response(
    side: &ConversionSide,
    query: &ConversionRateQuery,
    input_currency: &str,
) -> Result<ConversionResponse> {
    match (&query.amount_debit, &query.amount_credit) {
        (Some(debit), _) => {
            if debit.currency() != input_currency {
                return Err(BankError::bad_request(
                    TalerErrorCode::GenericCurrencyMismatch,
                    "amount_debit has the wrong currency",
                ));
            }
            let credit = side.convert(debit)?;
            Ok(ConversionResponse {
                amount_debit: debit.clone(),
                amount_credit: credit,
            })
        }
        (None, Some(credit)) => {
            if credit.currency() != side.fee.currency() {
                return Err(BankError::bad_request(
                    TalerErrorCode::GenericCurrencyMismatch,
                    "amount_credit has the wrong currency",
                ));
            }
            let debit = side.invert(credit, input_currency)?;
            // the inverse must actually reach the requested output
            if side.convert(&debit)? != *credit {
                return Err(BankError::conflict(
                    TalerErrorCode::BankBadConversion,
                    "no input amount converts to exactly this output",
                ));
            }
            Ok(ConversionResponse {
                amount_debit: debit,
                amount_credit: credit.clone(),
            })
        }
        (None, None) => Err(BankError::bad_request(
            TalerErrorCode::GenericParameterMissing,
            "amount_debit or amount_credit required",
        )),
    }
}

/// `GET /conversion-info/cashout-rate`
pub async fn cashout_rate(
    state: web::Data<AppState>,
    query: web::Query<ConversionRateQuery>,
) -> Result<HttpResponse> {
    let (rate, _fiat) = require_conversion(&state).await?;
    let response = rate_response(&rate.cashout, &query, &state.config.bank.currency)?;
    Ok(HttpResponse::Ok().json(response))
}

/// `GET /conversion-info/cashin-rate`
pub async fn cashin_rate(
    state: web::Data<AppState>,
    query: web::Query<ConversionRateQuery>,
) -> Result<HttpResponse> {
    let (rate, fiat) = require_conversion(&state).await?;
    let response = rate_response(&rate.cashin, &query, &fiat)?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /conversion-info/conversion-rate` (admin)
pub async fn set_conversion_rate(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<ConversionRate>,
) -> Result<HttpResponse> {
    let identity = auth::authenticate(&state.db, &req, TokenScope::ReadWrite).await?;
    auth::require_admin(&identity)?;
    let Some(fiat) = state.config.bank.fiat_currency.as_deref() else {
        return Err(BankError::not_implemented(
            TalerErrorCode::BankConversionNotSupported,
            "conversion is not enabled",
        ));
    };

    let rate = payload.into_inner();
    let regional = state.config.bank.currency.as_str();
    // cashin produces regional money, cashout produces fiat
    for (side, out_currency) in [(&rate.cashin, regional), (&rate.cashout, fiat)] {
        if side.fee.currency() != out_currency
            || side.tiny_amount.currency() != out_currency
            || side.min_amount.currency() != out_currency
        {
            return Err(BankError::bad_request(
                TalerErrorCode::GenericCurrencyMismatch,
                "conversion side uses the wrong output currency",
            ));
        }
    }

    state.db.conversion_rate_set(&rate).await?;
    Ok(HttpResponse::NoContent().finish())
}
