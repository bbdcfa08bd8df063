//! Domain primitives for the regional-currency bank.
//!
//! Everything in this crate is pure: monetary amounts, payto URIs,
//! the Crockford Base32 wire codec, the fiat conversion engine and the
//! Taler error-code registry. No I/O, no async, no database types.

pub mod amount;
pub mod base32;
pub mod codes;
pub mod conversion;
pub mod payto;

pub use amount::{Amount, AmountError, Balance, BalanceOutcome};
pub use codes::TalerErrorCode;
pub use conversion::{ConversionError, ConversionRate, DecimalNumber, RoundingMode};
pub use payto::{Iban, PaytoError, PaytoUri};
