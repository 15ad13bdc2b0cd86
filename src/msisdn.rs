//! Kenyan MSISDN normalisation
//!
//! Safaricom APIs want `2547XXXXXXXX` / `2541XXXXXXXX`; users type
//! `07…`, `+254…`, or the bare nine-digit subscriber number.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MsisdnError {
    #[error("Phone number is empty")]
    Empty,

    #[error("Phone number contains invalid characters: {0}")]
    InvalidCharacters(String),

    #[error("Not a Kenyan mobile number: {0}")]
    NotKenyanMobile(String),
}

const COUNTRY_CODE: &str = "254";

/// Normalise a Kenyan mobile number into its 12-digit international form.
pub fn normalize_msisdn(input: &str) -> Result<String, MsisdnError> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if compact.is_empty() {
        return Err(MsisdnError::Empty);
    }

    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MsisdnError::InvalidCharacters(input.to_string()));
    }

    let subscriber = if let Some(rest) = digits.strip_prefix(COUNTRY_CODE) {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits
    };

    let valid = subscriber.len() == 9 && matches!(subscriber.as_bytes()[0], b'7' | b'1');
    if !valid {
        return Err(MsisdnError::NotKenyanMobile(input.to_string()));
    }

    Ok(format!("{}{}", COUNTRY_CODE, subscriber))
}
