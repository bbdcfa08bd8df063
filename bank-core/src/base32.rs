//! Crockford Base32 codec.
//!
//! All opaque binary values on the wire (bearer tokens, reserve public
//! keys, wire transfer identifiers) travel as Crockford Base32: the
//! alphabet skips I, L, O and U, decoding is case-insensitive and maps
//! the lookalikes o/O to 0 and i/I/l/L to 1.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;
use thiserror::Error;

lazy_static! {
    static ref CROCKFORD: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str("0123456789ABCDEFGHJKMNPQRSTVWXYZ");
        spec.translate
            .from
            .push_str("abcdefghjkmnpqrstvwxyzOoIiLl");
        spec.translate.to.push_str("ABCDEFGHJKMNPQRSTVWXYZ001111");
        spec.encoding().expect("crockford spec is valid")
    };
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Base32Error {
    #[error("invalid crockford base32: {0}")]
    Malformed(String),

    #[error("decoded length {got}, expected {want}")]
    WrongLength { got: usize, want: usize },
}

pub fn encode(data: &[u8]) -> String {
    CROCKFORD.encode(data)
}

pub fn decode(text: &str) -> Result<Vec<u8>, Base32Error> {
    CROCKFORD
        .decode(text.as_bytes())
        .map_err(|e| Base32Error::Malformed(e.to_string()))
}

/// Decode a value that must be exactly 32 bytes (tokens, reserve pubs,
/// wtids).
pub fn decode32(text: &str) -> Result<[u8; 32], Base32Error> {
    let bytes = decode(text)?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| Base32Error::WrongLength { got, want: 32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let text = encode(&data);
        assert_eq!(decode(&text).unwrap(), data);
    }

    #[test]
    fn thirty_two_bytes_are_fifty_two_chars() {
        let data = [0xA5u8; 32];
        let text = encode(&data);
        assert_eq!(text.len(), 52);
        assert_eq!(decode32(&text).unwrap(), data);
    }

    #[test]
    fn decoding_is_case_insensitive() {
        let data = [7u8, 13, 64, 200, 31];
        let text = encode(&data);
        assert_eq!(decode(&text.to_lowercase()).unwrap(), data);
    }

    #[test]
    fn lookalikes_map_to_digits() {
        // o -> 0 and l -> 1 must decode to the same bytes
        let canonical = decode("10").unwrap();
        assert_eq!(decode("lO").unwrap(), canonical);
        assert_eq!(decode("Lo").unwrap(), canonical);
    }

    #[test]
    fn rejects_excluded_letters() {
        assert!(decode("U0").is_err());
        assert!(decode("!!").is_err());
    }

    #[test]
    fn wrong_length_reported() {
        let short = encode(&[1u8; 16]);
        assert_eq!(
            decode32(&short),
            Err(Base32Error::WrongLength { got: 16, want: 32 })
        );
    }
}
