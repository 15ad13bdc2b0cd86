//! Money Module
//!
//! All ledger amounts are Kenyan shillings held as `rust_decimal::Decimal`
//! with at most two fractional digits. Client input goes through
//! [`Amount::parse`], which rejects rather than rounds.
//!
//! ## Accepted formats
//! - `"500"`, `"500.5"`, `"500.50"` (strings)
//! - `500`, `500.5` (JSON numbers, re-validated from their textual form)
//!
//! ## Rejected formats
//! - `.5`, `5.`, `+5`, `1e3`, empty strings
//! - zero or negative values
//! - more than two fractional digits (no silent truncation)

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fractional digits carried by every amount (cents).
pub const KES_DECIMALS: u32 = 2;

/// Upper bound that still fits the `NUMERIC(20, 2)` column.
const MAX_WHOLE_DIGITS: usize = 17;

/// Money parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount too large")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// A strictly positive KES amount, scaled to two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(Decimal);

impl Amount {
    /// Parse a client-supplied amount string.
    pub fn parse(input: &str) -> Result<Self, MoneyError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(MoneyError::InvalidFormat("empty string".into()));
        }
        if s.starts_with('-') {
            return Err(MoneyError::InvalidAmount);
        }
        if s.starts_with('+') {
            return Err(MoneyError::InvalidFormat("+ prefix not allowed".into()));
        }
        if s.contains('e') || s.contains('E') {
            return Err(MoneyError::InvalidFormat(
                "scientific notation not allowed".into(),
            ));
        }

        let (whole, frac) = match s.split_once('.') {
            None => (s, ""),
            Some((w, f)) => {
                if w.is_empty() {
                    return Err(MoneyError::InvalidFormat("use 0.5 not .5".into()));
                }
                if f.is_empty() {
                    return Err(MoneyError::InvalidFormat("use 5.0 not 5.".into()));
                }
                if f.contains('.') {
                    return Err(MoneyError::InvalidFormat("multiple decimal points".into()));
                }
                (w, f)
            }
        };

        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(MoneyError::InvalidFormat(format!("not a number: {}", s)));
        }

        let significant_frac = frac.trim_end_matches('0');
        if significant_frac.len() > KES_DECIMALS as usize {
            return Err(MoneyError::PrecisionOverflow {
                provided: frac.len() as u32,
                max: KES_DECIMALS,
            });
        }

        if whole.trim_start_matches('0').len() > MAX_WHOLE_DIGITS {
            return Err(MoneyError::Overflow);
        }

        let value = Decimal::from_str(s).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
        Self::from_decimal(value)
    }

    /// Validate an already-parsed decimal.
    pub fn from_decimal(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() || value.is_zero() {
            return Err(MoneyError::InvalidAmount);
        }
        let normalized = value.normalize();
        if normalized.scale() > KES_DECIMALS {
            return Err(MoneyError::PrecisionOverflow {
                provided: normalized.scale(),
                max: KES_DECIMALS,
            });
        }
        let mut scaled = normalized;
        scaled.rescale(KES_DECIMALS);
        Ok(Self(scaled))
    }

    /// Shorthand for whole-shilling amounts.
    pub fn from_shillings(shillings: u64) -> Result<Self, MoneyError> {
        Self::from_decimal(Decimal::from(shillings))
    }

    #[inline]
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// True when the amount has no cents (required by the Daraja APIs).
    pub fn is_whole(&self) -> bool {
        self.0.fract().is_zero()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        Amount::parse(&text).map_err(D::Error::custom)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // String keeps the cents exact
        serializer.serialize_str(&self.0.to_string())
    }
}

/// Format a signed KES value for display, e.g. `KES 1,234.50`.
pub fn format_kes(value: Decimal) -> String {
    let mut v = value.abs();
    v.rescale(KES_DECIMALS);
    let text = v.to_string();
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value.is_sign_negative() && !value.is_zero() {
        "-"
    } else {
        ""
    };
    format!("{}KES {}.{}", sign, grouped, frac)
}
