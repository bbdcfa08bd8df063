//! payto:// URI handling (RFC 8905 subset).
//!
//! The bank accepts two target types: `payto://iban/[BIC/]IBAN` and
//! `payto://x-taler-bank/HOST/USERNAME`. Query parameters `amount`,
//! `message` and `receiver-name` are extracted when present; the canonical
//! form strips them and normalizes case so canonical equality is account
//! identity.

use crate::amount::Amount;
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaytoError {
    #[error("not a payto URI: {0}")]
    NotPayto(String),

    #[error("unsupported payto target type: {0}")]
    UnsupportedTarget(String),

    #[error("malformed payto path")]
    MalformedPath,

    #[error("invalid IBAN: {0}")]
    InvalidIban(String),

    #[error("malformed query parameter {0}")]
    MalformedQuery(String),
}

/// A checksum-validated IBAN, stored uppercase without separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iban(String);

impl Iban {
    pub fn parse(raw: &str) -> Result<Self, PaytoError> {
        let compact: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if !(15..=34).contains(&compact.len())
            || !compact.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return Err(PaytoError::InvalidIban(raw.to_string()));
        }
        if Self::mod97(&compact) != 1 {
            return Err(PaytoError::InvalidIban(raw.to_string()));
        }
        Ok(Iban(compact))
    }

    /// mod-97 of the rotated, letter-expanded IBAN string.
    fn mod97(compact: &str) -> u32 {
        let rotated = compact.bytes().cycle().skip(4).take(compact.len());
        let mut acc: u32 = 0;
        for b in rotated {
            if b.is_ascii_digit() {
                acc = (acc * 10 + (b - b'0') as u32) % 97;
            } else {
                let d = (b - b'A') as u32 + 10;
                acc = (acc * 100 + d) % 97;
            }
        }
        acc
    }

    /// Allocate a random checksum-valid IBAN for `country` with a
    /// 16-digit BBAN.
    pub fn random<R: Rng + ?Sized>(country: &str, rng: &mut R) -> Iban {
        let bban: String = (0..16).map(|_| rng.gen_range(0u8..10).to_string()).collect();
        let provisional = format!("{}00{}", country, bban);
        let check = 98 - Self::mod97(&provisional);
        Iban(format!("{}{:02}{}", country, check, bban))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bank account address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaytoUri {
    Iban { iban: Iban },
    XTalerBank { host: String, username: String },
}

/// Query parameters carried by a payto URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaytoParams {
    pub amount: Option<Amount>,
    pub message: Option<String>,
    pub receiver_name: Option<String>,
}

fn percent_decode(input: &str) -> Result<String, PaytoError> {
    let mut out = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| PaytoError::MalformedQuery(input.to_string()))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| PaytoError::MalformedQuery(input.to_string()))
}

impl PaytoUri {
    /// Parse a payto URI, returning the target and its query parameters.
    pub fn parse(uri: &str) -> Result<(PaytoUri, PaytoParams), PaytoError> {
        let rest = uri
            .strip_prefix("payto://")
            .ok_or_else(|| PaytoError::NotPayto(uri.to_string()))?;
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        let mut segments = path.split('/');
        let target = segments.next().unwrap_or_default();
        let tail: Vec<&str> = segments.collect();

        let parsed = match target {
            "iban" => {
                // an optional BIC segment precedes the IBAN; it carries no
                // account identity and is dropped
                let iban_raw = match tail.as_slice() {
                    [iban] => iban,
                    [_bic, iban] => iban,
                    _ => return Err(PaytoError::MalformedPath),
                };
                PaytoUri::Iban {
                    iban: Iban::parse(iban_raw)?,
                }
            }
            "x-taler-bank" => match tail.as_slice() {
                [host, username] if !host.is_empty() && !username.is_empty() => {
                    PaytoUri::XTalerBank {
                        host: host.to_ascii_lowercase(),
                        username: username.to_string(),
                    }
                }
                _ => return Err(PaytoError::MalformedPath),
            },
            other => return Err(PaytoError::UnsupportedTarget(other.to_string())),
        };

        let mut params = PaytoParams::default();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = percent_decode(value)?;
                match key {
                    "amount" => {
                        params.amount = Some(
                            value
                                .parse()
                                .map_err(|_| PaytoError::MalformedQuery(pair.to_string()))?,
                        )
                    }
                    "message" => params.message = Some(value),
                    "receiver-name" => params.receiver_name = Some(value),
                    _ => {}
                }
            }
        }
        Ok((parsed, params))
    }

    /// Canonical form: no query, no BIC, normalized case.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PaytoUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaytoUri::Iban { iban } => write!(f, "payto://iban/{}", iban),
            PaytoUri::XTalerBank { host, username } => {
                write!(f, "payto://x-taler-bank/{}/{}", host, username)
            }
        }
    }
}

impl FromStr for PaytoUri {
    type Err = PaytoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PaytoUri::parse(s)?.0)
    }
}

impl Serialize for PaytoUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for PaytoUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_IBAN: &str = "DE89370400440532013000";

    #[test]
    fn iban_checksum_accepts_known_good() {
        for iban in ["CH9300762011623852957", GOOD_IBAN, "GB82WEST12345698765432"] {
            assert!(Iban::parse(iban).is_ok(), "rejected {iban}");
        }
    }

    #[test]
    fn iban_checksum_rejects_corruption() {
        assert!(Iban::parse("DE89370400440532013001").is_err());
        assert!(Iban::parse("DE00370400440532013000").is_err());
        assert!(Iban::parse("SHORT").is_err());
        assert!(Iban::parse("DE893704004405320130_0").is_err());
    }

    #[test]
    fn iban_normalizes_case_and_separators() {
        let a = Iban::parse("de89 3704 0044 0532 0130 00").unwrap();
        assert_eq!(a.as_str(), GOOD_IBAN);
    }

    #[test]
    fn random_iban_is_valid() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let iban = Iban::random("CH", &mut rng);
            assert!(Iban::parse(iban.as_str()).is_ok(), "generated {iban}");
        }
    }

    #[test]
    fn parse_iban_payto() {
        let (uri, params) =
            PaytoUri::parse(&format!("payto://iban/{GOOD_IBAN}?receiver-name=Alice")).unwrap();
        assert_eq!(uri.canonical(), format!("payto://iban/{GOOD_IBAN}"));
        assert_eq!(params.receiver_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn bic_segment_is_dropped_from_canonical_form() {
        let with_bic: PaytoUri = format!("payto://iban/SOGEDEFF/{GOOD_IBAN}").parse().unwrap();
        let without: PaytoUri = format!("payto://iban/{GOOD_IBAN}").parse().unwrap();
        assert_eq!(with_bic, without);
    }

    #[test]
    fn parse_x_taler_bank() {
        let (uri, _) = PaytoUri::parse("payto://x-taler-bank/Bank.Example.COM/alice").unwrap();
        assert_eq!(uri.canonical(), "payto://x-taler-bank/bank.example.com/alice");
    }

    #[test]
    fn query_params_extracted() {
        let (_, params) = PaytoUri::parse(&format!(
            "payto://iban/{GOOD_IBAN}?amount=EUR:10.5&message=Hello%20World"
        ))
        .unwrap();
        assert_eq!(params.amount.unwrap().to_string(), "EUR:10.5");
        assert_eq!(params.message.as_deref(), Some("Hello World"));
    }

    #[test]
    fn rejects_unknown_target_and_malformed() {
        assert!(matches!(
            PaytoUri::parse("payto://ach/123/456"),
            Err(PaytoError::UnsupportedTarget(_))
        ));
        assert!(PaytoUri::parse("https://iban/DE89").is_err());
        assert!(PaytoUri::parse("payto://x-taler-bank/onlyhost").is_err());
        assert!(PaytoUri::parse(&format!("payto://iban/{GOOD_IBAN}?amount=nope")).is_err());
    }
}
