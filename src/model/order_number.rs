//! Order number parsing and Luhn validation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest order number accepted.
pub const MAX_ORDER_NUMBER_LEN: usize = 32;

/// Reasons an order number is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderNumberError {
    #[error("Order number is empty")]
    Empty,

    #[error("Order number exceeds {MAX_ORDER_NUMBER_LEN} digits")]
    TooLong,

    #[error("Order number contains non-digit character {0:?}")]
    NonDigit(char),

    #[error("Order number consists only of zeros")]
    AllZeros,

    #[error("Order number fails Luhn checksum")]
    Checksum,
}

/// A checksum-validated order number.
///
/// Only constructed through [`OrderNumber::parse`], so holding one means the
/// digits passed validation at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Parse and validate a raw order number.
    ///
    /// Surrounding whitespace is trimmed. The remaining token must be ASCII
    /// digits, pass the Luhn checksum and not be all zeros.
    pub fn parse(raw: &str) -> Result<Self, OrderNumberError> {
        let digits = raw.trim();
        validate(digits)?;
        Ok(Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(digits: &str) -> Result<(), OrderNumberError> {
    if digits.is_empty() {
        return Err(OrderNumberError::Empty);
    }
    if digits.len() > MAX_ORDER_NUMBER_LEN {
        return Err(OrderNumberError::TooLong);
    }
    if let Some(c) = digits.chars().find(|c| !c.is_ascii_digit()) {
        return Err(OrderNumberError::NonDigit(c));
    }
    // The all-zero token satisfies Luhn trivially but is never issued.
    if digits.bytes().all(|b| b == b'0') {
        return Err(OrderNumberError::AllZeros);
    }
    if !luhn_valid(digits) {
        return Err(OrderNumberError::Checksum);
    }
    Ok(())
}

/// Luhn checksum over an all-digit string.
fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OrderNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = OrderNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(number: OrderNumber) -> Self {
        number.0
    }
}
