//! Fiat <-> regional currency conversion engine.
//!
//! A conversion is a pure function of the input amount and the configured
//! rate: apply the ratio with u128 intermediates, subtract the flat fee in
//! the output currency, round to the tiny unit, then enforce the minimum.

use crate::amount::{Amount, AmountError, FRACTION_BASE, MAX_VALUE};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("converted amount is below the minimum")]
    TooSmall,

    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// A dimensionless decimal ratio with the same fixed-point shape as
/// [`Amount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecimalNumber {
    pub value: u64,
    pub frac: u32,
}

impl DecimalNumber {
    pub fn new(value: u64, frac: u32) -> Result<Self, AmountError> {
        if value > MAX_VALUE || frac >= FRACTION_BASE {
            return Err(AmountError::Overflow);
        }
        Ok(DecimalNumber { value, frac })
    }

    pub fn units(&self) -> u128 {
        self.value as u128 * FRACTION_BASE as u128 + self.frac as u128
    }
}

impl fmt::Display for DecimalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        if self.frac != 0 {
            let digits = format!("{:08}", self.frac);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl FromStr for DecimalNumber {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // same grammar as an amount, minus the currency tag
        let fake = format!("RATIO:{}", s);
        let amount: Amount = fake.parse()?;
        DecimalNumber::new(amount.value(), amount.frac())
    }
}

impl Serialize for DecimalNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DecimalNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundingMode {
    Zero,
    Up,
    Nearest,
}

/// One direction of the conversion configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSide {
    pub ratio: DecimalNumber,
    /// Flat fee, in the output currency.
    pub fee: Amount,
    /// Rounding unit, in the output currency.
    pub tiny_amount: Amount,
    pub rounding_mode: RoundingMode,
    /// Smallest acceptable result, in the output currency.
    pub min_amount: Amount,
}

impl ConversionSide {
    /// Convert `input` into this side's output currency.
    pub fn convert(&self, input: &Amount) -> Result<Amount, ConversionError> {
        let product = input.units() * self.ratio.units() / FRACTION_BASE as u128;
        let gross = Amount::from_units(self.fee.currency(), product)?;
        let net = gross
            .checked_sub(&self.fee)
            .map_err(|_| ConversionError::TooSmall)?;
        let rounded = round_to_tiny(&net, &self.tiny_amount, self.rounding_mode)?;
        if rounded.checked_cmp(&self.min_amount)? == std::cmp::Ordering::Less {
            return Err(ConversionError::TooSmall);
        }
        Ok(rounded)
    }
}

impl ConversionSide {
    /// Smallest input amount whose conversion reaches `output`, before
    /// rounding. Callers re-run [`convert`](Self::convert) on the result
    /// to validate a client-supplied pair.
    pub fn invert(&self, output: &Amount, input_currency: &str) -> Result<Amount, ConversionError> {
        let ratio_units = self.ratio.units();
        if ratio_units == 0 {
            return Err(ConversionError::TooSmall);
        }
        let target = output.checked_add(&self.fee)?;
        let units = (target.units() * FRACTION_BASE as u128).div_ceil(ratio_units);
        Ok(Amount::from_units(input_currency, units)?)
    }
}

/// Process-wide conversion configuration: cashin is fiat -> regional,
/// cashout is regional -> fiat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub cashin: ConversionSide,
    pub cashout: ConversionSide,
}

impl ConversionRate {
    pub fn to_cashin(&self, fiat: &Amount) -> Result<Amount, ConversionError> {
        self.cashin.convert(fiat)
    }

    pub fn to_cashout(&self, regional: &Amount) -> Result<Amount, ConversionError> {
        self.cashout.convert(regional)
    }
}

/// Round `amount` to a multiple of `tiny`.
fn round_to_tiny(
    amount: &Amount,
    tiny: &Amount,
    mode: RoundingMode,
) -> Result<Amount, ConversionError> {
    let units = amount.units();
    let tiny_units = tiny.units();
    if tiny_units == 0 {
        return Ok(amount.clone());
    }
    let quot = units / tiny_units;
    let rem = units % tiny_units;
    let rounded_quot = match mode {
        RoundingMode::Zero => quot,
        RoundingMode::Up => {
            if rem > 0 {
                quot + 1
            } else {
                quot
            }
        }
        RoundingMode::Nearest => {
            // half-even
            match (rem * 2).cmp(&tiny_units) {
                std::cmp::Ordering::Less => quot,
                std::cmp::Ordering::Greater => quot + 1,
                std::cmp::Ordering::Equal => {
                    if quot % 2 == 0 {
                        quot
                    } else {
                        quot + 1
                    }
                }
            }
        }
    };
    Ok(Amount::from_units(
        amount.currency(),
        rounded_quot * tiny_units,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn side(ratio: &str, fee: &str, tiny: &str, mode: RoundingMode, min: &str) -> ConversionSide {
        ConversionSide {
            ratio: ratio.parse().unwrap(),
            fee: amt(fee),
            tiny_amount: amt(tiny),
            rounding_mode: mode,
            min_amount: amt(min),
        }
    }

    #[test]
    fn ratio_parse_and_display() {
        let r: DecimalNumber = "0.8".parse().unwrap();
        assert_eq!(r.to_string(), "0.8");
        assert_eq!(r.units(), 80_000_000);
        assert!("1.123456789".parse::<DecimalNumber>().is_err());
    }

    #[test]
    fn straight_ratio_application() {
        // EUR -> KUDOS at 1:1, no fee
        let s = side("1", "KUDOS:0", "KUDOS:0.00000001", RoundingMode::Zero, "KUDOS:0");
        assert_eq!(s.convert(&amt("EUR:12.5")).unwrap(), amt("KUDOS:12.5"));
    }

    #[test]
    fn ratio_truncates_before_rounding() {
        // 0.33 * 1 = 0.33, ratio multiplication is exact here
        let s = side("0.33", "FIAT:0", "FIAT:0.00000001", RoundingMode::Zero, "FIAT:0");
        assert_eq!(s.convert(&amt("REG:1")).unwrap(), amt("FIAT:0.33"));
        // 1/3-ish products truncate at the 1e-8 unit
        let s = side(
            "0.33333333",
            "FIAT:0",
            "FIAT:0.00000001",
            RoundingMode::Zero,
            "FIAT:0",
        );
        assert_eq!(s.convert(&amt("REG:3")).unwrap(), amt("FIAT:0.99999999"));
    }

    #[test]
    fn fee_subtracted_in_output_currency() {
        let s = side("1", "FIAT:0.25", "FIAT:0.01", RoundingMode::Zero, "FIAT:0");
        assert_eq!(s.convert(&amt("REG:10")).unwrap(), amt("FIAT:9.75"));
        // fee larger than the gross result
        assert_eq!(s.convert(&amt("REG:0.2")), Err(ConversionError::TooSmall));
    }

    #[test]
    fn rounding_modes() {
        let zero = side("1", "FIAT:0", "FIAT:0.01", RoundingMode::Zero, "FIAT:0");
        let up = side("1", "FIAT:0", "FIAT:0.01", RoundingMode::Up, "FIAT:0");
        let nearest = side("1", "FIAT:0", "FIAT:0.01", RoundingMode::Nearest, "FIAT:0");

        assert_eq!(zero.convert(&amt("REG:1.019")).unwrap(), amt("FIAT:1.01"));
        assert_eq!(up.convert(&amt("REG:1.011")).unwrap(), amt("FIAT:1.02"));
        assert_eq!(up.convert(&amt("REG:1.01")).unwrap(), amt("FIAT:1.01"));
        assert_eq!(nearest.convert(&amt("REG:1.016")).unwrap(), amt("FIAT:1.02"));
        assert_eq!(nearest.convert(&amt("REG:1.014")).unwrap(), amt("FIAT:1.01"));
    }

    #[test]
    fn nearest_ties_go_to_even() {
        let nearest = side("1", "FIAT:0", "FIAT:0.01", RoundingMode::Nearest, "FIAT:0");
        // 1.015 sits exactly between 1.01 (odd quot 101) and 1.02 (even 102)
        assert_eq!(nearest.convert(&amt("REG:1.015")).unwrap(), amt("FIAT:1.02"));
        // 1.025 sits between 1.02 (even quot 102) and 1.03
        assert_eq!(nearest.convert(&amt("REG:1.025")).unwrap(), amt("FIAT:1.02"));
    }

    #[test]
    fn minimum_enforced_after_rounding() {
        let s = side("1", "FIAT:0", "FIAT:0.01", RoundingMode::Zero, "FIAT:5");
        assert_eq!(s.convert(&amt("REG:4.99")), Err(ConversionError::TooSmall));
        assert_eq!(s.convert(&amt("REG:5")).unwrap(), amt("FIAT:5"));
    }

    #[test]
    fn invert_reaches_the_requested_output() {
        let s = side("0.8", "FIAT:0.25", "FIAT:0.01", RoundingMode::Zero, "FIAT:0");
        let credit = amt("FIAT:10");
        let debit = s.invert(&credit, "REG").unwrap();
        assert_eq!(s.convert(&debit).unwrap(), credit);
        // one tiny unit less than the inverse no longer reaches it
        let smaller = debit.checked_sub(&amt("REG:0.01")).unwrap();
        assert!(s.convert(&smaller).unwrap().checked_cmp(&credit).unwrap().is_lt());
    }

    #[test]
    fn big_amounts_do_not_overflow_intermediates() {
        // close to the 2^52 value bound times a >1 ratio would overflow
        // 64-bit unit counts; the engine must survive on u128 and fail
        // only on the output-range check
        let s = side("2", "FIAT:0", "FIAT:0.01", RoundingMode::Zero, "FIAT:0");
        let input = Amount::new("REG", 1 << 51, 0).unwrap();
        let out = s.convert(&input).unwrap();
        assert_eq!(out, Amount::new("FIAT", 1 << 52, 0).unwrap());
        let too_big = Amount::new("REG", (1 << 51) + 1, 0).unwrap();
        assert!(s.convert(&too_big).is_err());
    }
}
