//! Money Module
//!
//! Currency-tagged amounts used by batch requests. Amounts travel as strings at
//! the API boundary and as `rust_decimal::Decimal` internally; all parsing MUST
//! go through this module.
//!
//! ## Design Principles
//! 1. Explicit Error Handling: no silent truncation or rounding
//! 2. Type Safety: `Amount` can only be built from a positive value and a
//!    well-formed `CurrencyCode`
//!
//! ## Usage
//! ```rust
//! use mass_payment::money::{Amount, parse_amount};
//!
//! let value = parse_amount("10.50").unwrap();
//! let amount = Amount::new(value, "USD").unwrap();
//! assert_eq!(amount.to_string(), "10.50 USD");
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum fractional digits accepted on an amount.
pub const MAX_AMOUNT_SCALE: u32 = 8;

// ============================================================================
// Error Types
// ============================================================================

/// Money parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),
}

// ============================================================================
// Currency
// ============================================================================

/// Three-letter upper-case currency code (e.g. `USD`, `GBP`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CurrencyCode {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(MoneyError::InvalidCurrency(s.to_string()));
        }
        Ok(Self(code.to_string()))
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Amount
// ============================================================================

/// Positive decimal quantity of a single currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AmountRepr")]
pub struct Amount {
    quantity: Decimal,
    currency: CurrencyCode,
}

#[derive(Deserialize)]
struct AmountRepr {
    quantity: Decimal,
    currency: CurrencyCode,
}

impl TryFrom<AmountRepr> for Amount {
    type Error = MoneyError;

    fn try_from(repr: AmountRepr) -> Result<Self, Self::Error> {
        Amount::from_parts(repr.quantity, repr.currency)
    }
}

impl Amount {
    /// Build an amount, rejecting zero/negative values and excess precision
    pub fn new(quantity: Decimal, currency: &str) -> Result<Self, MoneyError> {
        let currency = currency.parse()?;
        Self::from_parts(quantity, currency)
    }

    pub fn from_parts(quantity: Decimal, currency: CurrencyCode) -> Result<Self, MoneyError> {
        validate_quantity(quantity)?;
        Ok(Self { quantity, currency })
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quantity, self.currency)
    }
}

fn validate_quantity(quantity: Decimal) -> Result<(), MoneyError> {
    if quantity.is_sign_negative() || quantity.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }
    if quantity.scale() > MAX_AMOUNT_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: quantity.scale(),
            max: MAX_AMOUNT_SCALE,
        });
    }
    Ok(())
}

// ============================================================================
// Parse: Client → Internal
// ============================================================================

/// Parse a client-supplied amount string
///
/// # Errors
/// * `InvalidFormat` - empty, `.5`, `5.`, multiple dots, non-digits
/// * `InvalidAmount` - zero or signed input
/// * `PrecisionOverflow` - more than [`MAX_AMOUNT_SCALE`] fractional digits
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let s = amount_str.trim();
    if s.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let parts: Vec<&str> = s.split('.').collect();
    match parts.as_slice() {
        [whole] => check_digits(whole)?,
        [whole, frac] => {
            if whole.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing leading zero (e.g., use 0.5 instead of .5)".into(),
                ));
            }
            if frac.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
                ));
            }
            check_digits(whole)?;
            check_digits(frac)?;
            if frac.len() > MAX_AMOUNT_SCALE as usize {
                return Err(MoneyError::PrecisionOverflow {
                    provided: frac.len() as u32,
                    max: MAX_AMOUNT_SCALE,
                });
            }
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    }

    let value = Decimal::from_str(s).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
    validate_quantity(value)?;
    Ok(value)
}

fn check_digits(part: &str) -> Result<(), MoneyError> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "invalid character in amount: {}",
            part
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_valid() {
        assert_eq!(parse_amount("10").unwrap(), Decimal::from(10));
        assert_eq!(parse_amount("0.5").unwrap(), Decimal::new(5, 1));
        assert_eq!(parse_amount(" 1.25 ").unwrap(), Decimal::new(125, 2));
        assert_eq!(parse_amount("0.00000001").unwrap(), Decimal::new(1, 8));
    }

    #[test]
    fn test_parse_amount_rejects_bad_format() {
        assert!(matches!(parse_amount(""), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount(".5"), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("5."), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(
            parse_amount("1.2.3"),
            Err(MoneyError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_amount("1e5"),
            Err(MoneyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_amount_rejects_non_positive() {
        assert_eq!(parse_amount("0"), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_amount("0.000"), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_amount("-1"), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_amount("+1"), Err(MoneyError::InvalidAmount));
    }

    #[test]
    fn test_parse_amount_precision_overflow() {
        assert_eq!(
            parse_amount("0.000000001"),
            Err(MoneyError::PrecisionOverflow {
                provided: 9,
                max: MAX_AMOUNT_SCALE
            })
        );
    }

    #[test]
    fn test_currency_code() {
        assert_eq!("USD".parse::<CurrencyCode>().unwrap().as_str(), "USD");
        assert!("usd".parse::<CurrencyCode>().is_err());
        assert!("US".parse::<CurrencyCode>().is_err());
        assert!("USDT".parse::<CurrencyCode>().is_err());
    }

    #[test]
    fn test_amount_new() {
        let amount = Amount::new(Decimal::from(10), "USD").unwrap();
        assert_eq!(amount.quantity(), Decimal::from(10));
        assert_eq!(amount.currency().as_str(), "USD");
        assert_eq!(amount.to_string(), "10 USD");

        assert_eq!(
            Amount::new(Decimal::ZERO, "USD"),
            Err(MoneyError::InvalidAmount)
        );
        assert!(matches!(
            Amount::new(Decimal::ONE, "dollars"),
            Err(MoneyError::InvalidCurrency(_))
        ));
    }

    #[test]
    fn test_amount_serde_revalidates() {
        let json = r#"{"quantity":"1","currency":"usd"}"#;
        assert!(serde_json::from_str::<Amount>(json).is_err());

        let json = r#"{"quantity":"0","currency":"USD"}"#;
        assert!(serde_json::from_str::<Amount>(json).is_err());

        let json = r#"{"quantity":"2.5","currency":"USD"}"#;
        let amount: Amount = serde_json::from_str(json).unwrap();
        assert_eq!(amount.quantity(), Decimal::new(25, 1));
    }
}
