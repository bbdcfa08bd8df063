//! Property-based tests for the domain primitives.
//!
//! These verify the invariants the rest of the bank leans on:
//! - Amount round-trip: parse(format(a)) == a
//! - Arithmetic: subtraction undoes addition, no silent wrap-around
//! - Balance algebra: credit/debit conserve the signed value
//! - IBAN: generated IBANs pass mod-97, single-digit corruption fails it
//! - Conversion: results are tiny-unit multiples and respect the minimum

use bank_core::amount::{Amount, Balance, BalanceOutcome, FRACTION_BASE, MAX_VALUE};
use bank_core::base32;
use bank_core::conversion::{ConversionSide, DecimalNumber, RoundingMode};
use bank_core::payto::Iban;
use proptest::prelude::*;

fn amount_strategy() -> impl Strategy<Value = Amount> {
    (0u64..=MAX_VALUE, 0u32..FRACTION_BASE)
        .prop_map(|(value, frac)| Amount::new("KUDOS", value, frac).unwrap())
}

fn small_amount_strategy() -> impl Strategy<Value = Amount> {
    (0u64..1_000_000, 0u32..FRACTION_BASE)
        .prop_map(|(value, frac)| Amount::new("KUDOS", value, frac).unwrap())
}

fn rounding_mode_strategy() -> impl Strategy<Value = RoundingMode> {
    prop_oneof![
        Just(RoundingMode::Zero),
        Just(RoundingMode::Up),
        Just(RoundingMode::Nearest),
    ]
}

proptest! {
    #[test]
    fn amount_round_trips_through_canonical_string(a in amount_strategy()) {
        let rendered = a.to_string();
        let parsed: Amount = rendered.parse().unwrap();
        prop_assert_eq!(parsed, a);
    }

    #[test]
    fn subtraction_undoes_addition(a in small_amount_strategy(), b in small_amount_strategy()) {
        let sum = a.checked_add(&b).unwrap();
        prop_assert_eq!(sum.checked_sub(&b).unwrap(), a.clone());
        prop_assert_eq!(sum.checked_sub(&a).unwrap(), b);
    }

    #[test]
    fn addition_never_silently_wraps(frac in 0u32..FRACTION_BASE) {
        let a = Amount::new("KUDOS", MAX_VALUE, frac).unwrap();
        let one = Amount::new("KUDOS", 1, 0).unwrap();
        prop_assert!(a.checked_add(&one).is_err());
    }

    #[test]
    fn balance_credit_then_debit_restores(
        start in small_amount_strategy(),
        delta in small_amount_strategy(),
    ) {
        let balance = Balance::new(start, false);
        let credited = balance.credit(&delta).unwrap();
        let threshold = Amount::zero("KUDOS").unwrap();
        match credited.debit(&delta, &threshold).unwrap() {
            BalanceOutcome::Updated(restored) => prop_assert_eq!(restored, balance),
            BalanceOutcome::Insufficient => prop_assert!(false, "debit of own credit refused"),
        }
    }

    #[test]
    fn balance_signed_value_is_conserved(
        credits in prop::collection::vec(small_amount_strategy(), 0..8),
        debits in prop::collection::vec(small_amount_strategy(), 0..8),
    ) {
        // apply all credits, then debits under an unlimited threshold, and
        // compare against plain i128 unit accounting
        let threshold = Amount::new("KUDOS", MAX_VALUE, 0).unwrap();
        let mut balance = Balance::zero("KUDOS").unwrap();
        let mut expected: i128 = 0;
        for c in &credits {
            balance = balance.credit(c).unwrap();
            expected += c.units() as i128;
        }
        for d in &debits {
            match balance.debit(d, &threshold).unwrap() {
                BalanceOutcome::Updated(nb) => {
                    balance = nb;
                    expected -= d.units() as i128;
                }
                BalanceOutcome::Insufficient => {}
            }
        }
        let signed = if balance.has_debt {
            -(balance.amount.units() as i128)
        } else {
            balance.amount.units() as i128
        };
        prop_assert_eq!(signed, expected);
        prop_assert!(!(balance.has_debt && balance.amount.is_zero()));
    }

    #[test]
    fn generated_ibans_validate(seed in any::<u64>()) {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let iban = Iban::random("CH", &mut rng);
        prop_assert!(Iban::parse(iban.as_str()).is_ok());
    }

    #[test]
    fn corrupted_iban_digit_fails_checksum(seed in any::<u64>(), pos in 4usize..20) {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let iban = Iban::random("CH", &mut rng);
        let mut chars: Vec<char> = iban.as_str().chars().collect();
        let old = chars[pos].to_digit(10).unwrap();
        chars[pos] = char::from_digit((old + 1) % 10, 10).unwrap();
        let corrupted: String = chars.into_iter().collect();
        prop_assert!(Iban::parse(&corrupted).is_err());
    }

    #[test]
    fn conversion_result_is_tiny_multiple_and_above_min(
        input in small_amount_strategy(),
        mode in rounding_mode_strategy(),
        tiny_frac in 1u32..FRACTION_BASE,
    ) {
        let side = ConversionSide {
            ratio: DecimalNumber::new(0, 80_000_000).unwrap(),
            fee: Amount::zero("EUR").unwrap(),
            tiny_amount: Amount::new("EUR", 0, tiny_frac).unwrap(),
            rounding_mode: mode,
            min_amount: Amount::new("EUR", 0, 1).unwrap(),
        };
        if let Ok(out) = side.convert(&input) {
            prop_assert_eq!(out.units() % side.tiny_amount.units(), 0);
            prop_assert!(out.units() >= side.min_amount.units());
        }
    }

    #[test]
    fn crockford_round_trips(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let encoded = base32::encode(&bytes);
        prop_assert_eq!(base32::decode(&encoded).unwrap(), bytes);
    }
}
