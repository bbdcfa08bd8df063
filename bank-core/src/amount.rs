//! Fixed-point monetary amounts with a currency tag.
//!
//! An [`Amount`] is a non-negative decimal with an integer part bounded by
//! 2^52 and eight fractional digits, rendered canonically as `CUR:v[.frac]`.
//! Signed account balances are modeled by [`Balance`], an unsigned magnitude
//! plus a debt flag, so the debit-ceiling rule can be enforced without ever
//! leaving unsigned arithmetic.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional units per currency unit.
pub const FRACTION_BASE: u32 = 100_000_000;

/// Largest representable integer part, 2^52.
pub const MAX_VALUE: u64 = 1 << 52;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount format: {0}")]
    InvalidFormat(String),

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("amount value exceeds 2^52")]
    Overflow,

    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),
}

/// A currency-tagged fixed-point amount.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Amount {
    currency: String,
    value: u64,
    frac: u32,
}

fn valid_currency(code: &str) -> bool {
    (1..=11).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_uppercase())
}

impl Amount {
    pub fn new(currency: &str, value: u64, frac: u32) -> Result<Self, AmountError> {
        if !valid_currency(currency) {
            return Err(AmountError::InvalidCurrency(currency.to_string()));
        }
        if value > MAX_VALUE || frac >= FRACTION_BASE {
            return Err(AmountError::Overflow);
        }
        Ok(Amount {
            currency: currency.to_string(),
            value,
            frac,
        })
    }

    pub fn zero(currency: &str) -> Result<Self, AmountError> {
        Amount::new(currency, 0, 0)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn frac(&self) -> u32 {
        self.frac
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.frac == 0
    }

    /// Total number of fractional units. Needs 128 bits: 2^52 * 1e8
    /// overflows u64.
    pub fn units(&self) -> u128 {
        self.value as u128 * FRACTION_BASE as u128 + self.frac as u128
    }

    /// Rebuild an amount from fractional units, failing past 2^52.
    pub fn from_units(currency: &str, units: u128) -> Result<Self, AmountError> {
        let value = units / FRACTION_BASE as u128;
        let frac = (units % FRACTION_BASE as u128) as u32;
        if value > MAX_VALUE as u128 {
            return Err(AmountError::Overflow);
        }
        Amount::new(currency, value as u64, frac)
    }

    fn require_same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(other)?;
        let mut value = self
            .value
            .checked_add(other.value)
            .ok_or(AmountError::Overflow)?;
        let mut frac = self.frac + other.frac;
        if frac >= FRACTION_BASE {
            frac -= FRACTION_BASE;
            value = value.checked_add(1).ok_or(AmountError::Overflow)?;
        }
        if value > MAX_VALUE {
            return Err(AmountError::Overflow);
        }
        Amount::new(&self.currency, value, frac)
    }

    /// Subtraction; `Overflow` doubles as the underflow signal since
    /// amounts are unsigned.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(other)?;
        let a = self.units();
        let b = other.units();
        if b > a {
            return Err(AmountError::Overflow);
        }
        Amount::from_units(&self.currency, a - b)
    }

    pub fn checked_cmp(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.require_same_currency(other)?;
        Ok(self.units().cmp(&other.units()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.value)?;
        if self.frac != 0 {
            let digits = format!("{:08}", self.frac);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (currency, rest) = s
            .split_once(':')
            .ok_or_else(|| AmountError::InvalidFormat(s.to_string()))?;
        if !valid_currency(currency) {
            return Err(AmountError::InvalidCurrency(currency.to_string()));
        }
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (rest, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidFormat(s.to_string()));
        }
        let value: u64 = int_part
            .parse()
            .map_err(|_| AmountError::InvalidFormat(s.to_string()))?;
        let frac = match frac_part {
            None => 0,
            Some(f) => {
                if f.is_empty() || f.len() > 8 || !f.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(AmountError::InvalidFormat(s.to_string()));
                }
                // right-pad to eight digits
                let mut frac: u32 = f.parse().map_err(|_| AmountError::InvalidFormat(s.to_string()))?;
                for _ in f.len()..8 {
                    frac *= 10;
                }
                frac
            }
        };
        Amount::new(currency, value, frac)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Outcome of applying a debit against a balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceOutcome {
    Updated(Balance),
    /// The post-debit debt would exceed the account's debit threshold.
    Insufficient,
}

/// A signed account balance as (unsigned magnitude, debt flag).
///
/// Invariants: `!has_debt` implies the signed balance is >= 0;
/// `has_debt` implies the magnitude is strictly positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub amount: Amount,
    pub has_debt: bool,
}

impl Balance {
    pub fn zero(currency: &str) -> Result<Self, AmountError> {
        Ok(Balance {
            amount: Amount::zero(currency)?,
            has_debt: false,
        })
    }

    pub fn new(amount: Amount, has_debt: bool) -> Self {
        let has_debt = has_debt && !amount.is_zero();
        Balance { amount, has_debt }
    }

    /// Apply an incoming credit.
    pub fn credit(&self, delta: &Amount) -> Result<Balance, AmountError> {
        if !self.has_debt {
            return Ok(Balance::new(self.amount.checked_add(delta)?, false));
        }
        match delta.checked_cmp(&self.amount)? {
            Ordering::Less => Ok(Balance::new(self.amount.checked_sub(delta)?, true)),
            _ => Ok(Balance::new(delta.checked_sub(&self.amount)?, false)),
        }
    }

    /// Apply an outgoing debit, refusing to push the debt past `threshold`.
    pub fn debit(&self, delta: &Amount, threshold: &Amount) -> Result<BalanceOutcome, AmountError> {
        let new = if self.has_debt {
            Balance::new(self.amount.checked_add(delta)?, true)
        } else {
            match delta.checked_cmp(&self.amount)? {
                Ordering::Greater => Balance::new(delta.checked_sub(&self.amount)?, true),
                _ => Balance::new(self.amount.checked_sub(delta)?, false),
            }
        };
        if new.has_debt && new.amount.checked_cmp(threshold)? == Ordering::Greater {
            return Ok(BalanceOutcome::Insufficient);
        }
        Ok(BalanceOutcome::Updated(new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_format_canonical() {
        assert_eq!(amt("KUDOS:10").to_string(), "KUDOS:10");
        assert_eq!(amt("KUDOS:10.5").to_string(), "KUDOS:10.5");
        assert_eq!(amt("KUDOS:10.50000000").to_string(), "KUDOS:10.5");
        assert_eq!(amt("KUDOS:0.00000001").to_string(), "KUDOS:0.00000001");
        assert_eq!(amt("EUR:0").to_string(), "EUR:0");
    }

    #[test]
    fn parse_fractional_padding() {
        assert_eq!(amt("EUR:1.5"), Amount::new("EUR", 1, 50_000_000).unwrap());
        assert_eq!(amt("EUR:1.00000001"), Amount::new("EUR", 1, 1).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in [
            "KUDOS",
            "KUDOS:",
            "KUDOS:.5",
            "KUDOS:1.",
            "KUDOS:1.123456789",
            "kudos:1",
            "TOOLONGCURRENCY:1",
            "KUDOS:-1",
            "KUDOS:1,5",
            ":1",
        ] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn parse_rejects_value_above_bound() {
        let over = format!("KUDOS:{}", MAX_VALUE + 1);
        assert_eq!(over.parse::<Amount>(), Err(AmountError::Overflow));
        let at = format!("KUDOS:{}", MAX_VALUE);
        assert!(at.parse::<Amount>().is_ok());
    }

    #[test]
    fn add_carries_fraction() {
        let a = amt("KUDOS:1.60000000");
        let b = amt("KUDOS:2.70000000");
        assert_eq!(a.checked_add(&b).unwrap(), amt("KUDOS:4.3"));
    }

    #[test]
    fn add_rejects_currency_mismatch() {
        let a = amt("KUDOS:1");
        let b = amt("EUR:1");
        assert!(matches!(
            a.checked_add(&b),
            Err(AmountError::CurrencyMismatch(_, _))
        ));
    }

    #[test]
    fn sub_underflow_fails() {
        assert!(amt("KUDOS:1").checked_sub(&amt("KUDOS:2")).is_err());
        assert_eq!(
            amt("KUDOS:2.5").checked_sub(&amt("KUDOS:1.75")).unwrap(),
            amt("KUDOS:0.75")
        );
    }

    #[test]
    fn serde_round_trip() {
        let a = amt("KUDOS:42.125");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"KUDOS:42.125\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn balance_credit_clears_debt() {
        let b = Balance::new(amt("KUDOS:3"), true);
        let b = b.credit(&amt("KUDOS:5")).unwrap();
        assert_eq!(b, Balance::new(amt("KUDOS:2"), false));

        let b = Balance::new(amt("KUDOS:3"), true);
        let b = b.credit(&amt("KUDOS:3")).unwrap();
        assert!(!b.has_debt);
        assert!(b.amount.is_zero());
    }

    #[test]
    fn balance_debit_respects_threshold() {
        let b = Balance::zero("KUDOS").unwrap();
        let threshold = amt("KUDOS:10");
        match b.debit(&amt("KUDOS:10"), &threshold).unwrap() {
            BalanceOutcome::Updated(nb) => {
                assert!(nb.has_debt);
                assert_eq!(nb.amount, amt("KUDOS:10"));
            }
            BalanceOutcome::Insufficient => panic!("debit within threshold refused"),
        }
        assert_eq!(
            b.debit(&amt("KUDOS:11"), &threshold).unwrap(),
            BalanceOutcome::Insufficient
        );
    }

    #[test]
    fn balance_debit_from_credit_side() {
        let b = Balance::new(amt("KUDOS:5"), false);
        let threshold = amt("KUDOS:0");
        match b.debit(&amt("KUDOS:5"), &threshold).unwrap() {
            BalanceOutcome::Updated(nb) => {
                assert!(nb.amount.is_zero());
                assert!(!nb.has_debt);
            }
            BalanceOutcome::Insufficient => panic!(),
        }
        assert_eq!(
            b.debit(&amt("KUDOS:5.00000001"), &threshold).unwrap(),
            BalanceOutcome::Insufficient
        );
    }
}
