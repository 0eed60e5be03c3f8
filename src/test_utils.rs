//! Test utilities: a scripted accrual oracle and fixture helpers.
//!
//! Exposed to integration tests through the `test-utils` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::model::OrderNumber;
use crate::oracle::{AccrualOracle, OracleError, OracleReply};

/// One scripted oracle answer.
#[derive(Debug, Clone)]
pub enum OracleStep {
    Reply(OracleReply),
    Fail(OracleError),
    /// Never answer within `Duration`; then report unavailable.
    Hang(Duration),
}

impl From<OracleReply> for OracleStep {
    fn from(reply: OracleReply) -> Self {
        OracleStep::Reply(reply)
    }
}

impl From<OracleError> for OracleStep {
    fn from(err: OracleError) -> Self {
        OracleStep::Fail(err)
    }
}

/// Oracle that plays back a script per order number.
///
/// Steps are consumed in order; the last step repeats forever. Orders with
/// no script get the fallback step (unregistered by default).
pub struct ScriptedOracle {
    scripts: RwLock<HashMap<String, VecDeque<OracleStep>>>,
    fallback: RwLock<OracleStep>,
    calls: AtomicUsize,
    calls_by_order: RwLock<HashMap<String, usize>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            fallback: RwLock::new(OracleStep::Reply(OracleReply::unregistered())),
            calls: AtomicUsize::new(0),
            calls_by_order: RwLock::new(HashMap::new()),
        }
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the script for one order.
    pub async fn script<I, S>(&self, order_number: &str, steps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<OracleStep>,
    {
        let steps: VecDeque<OracleStep> = steps.into_iter().map(Into::into).collect();
        self.scripts
            .write()
            .await
            .insert(order_number.to_string(), steps);
    }

    /// Answer for orders without a script.
    pub async fn set_fallback(&self, step: impl Into<OracleStep>) {
        *self.fallback.write().await = step.into();
    }

    /// Total lookups across all orders.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn calls_for(&self, order_number: &str) -> usize {
        self.calls_by_order
            .read()
            .await
            .get(order_number)
            .copied()
            .unwrap_or(0)
    }

    async fn next_step(&self, order_number: &str) -> OracleStep {
        let scripted = {
            let mut scripts = self.scripts.write().await;
            match scripts.get_mut(order_number) {
                Some(steps) if steps.len() > 1 => steps.pop_front(),
                Some(steps) => steps.front().cloned(),
                None => None,
            }
        };
        match scripted {
            Some(step) => step,
            None => self.fallback.read().await.clone(),
        }
    }
}

#[async_trait]
impl AccrualOracle for ScriptedOracle {
    async fn lookup(&self, number: &OrderNumber) -> Result<OracleReply, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_order
            .write()
            .await
            .entry(number.to_string())
            .or_default() += 1;

        match self.next_step(number.as_str()).await {
            OracleStep::Reply(reply) => Ok(reply),
            OracleStep::Fail(err) => Err(err),
            OracleStep::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Err(OracleError::Unavailable("scripted hang".to_string()))
            }
        }
    }
}

/// Build a Luhn-valid order number by appending a check digit to `prefix`.
pub fn luhn_number(prefix: u64) -> String {
    let payload = prefix.to_string();
    let sum: u32 = payload
        .chars()
        .rev()
        .enumerate()
        .map(|(i, c)| {
            let digit = c.to_digit(10).unwrap_or(0);
            if i % 2 == 0 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum();
    let check = (10 - sum % 10) % 10;
    format!("{}{}", payload, check)
}

/// Parse a known-good order number.
pub fn order_number(raw: &str) -> OrderNumber {
    OrderNumber::parse(raw).unwrap_or_else(|e| panic!("bad fixture {raw}: {e}"))
}

/// Amount in cents as a two-place decimal.
pub fn cents(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn_number_matches_known_values() {
        assert_eq!(luhn_number(1234567890), "12345678903");
        assert_eq!(luhn_number(7992739871), "79927398713");
        assert!(OrderNumber::parse(&luhn_number(42)).is_ok());
    }

    #[tokio::test]
    async fn test_script_last_step_sticks() {
        let oracle = ScriptedOracle::new();
        oracle
            .script(
                "12345678903",
                [OracleReply::processing(), OracleReply::processed(cents(50000))],
            )
            .await;
        let number = order_number("12345678903");

        assert_eq!(oracle.lookup(&number).await.unwrap(), OracleReply::processing());
        for _ in 0..3 {
            assert_eq!(
                oracle.lookup(&number).await.unwrap(),
                OracleReply::processed(cents(50000))
            );
        }
        assert_eq!(oracle.calls_for("12345678903").await, 4);
    }

    #[tokio::test]
    async fn test_unscripted_uses_fallback() {
        let oracle = ScriptedOracle::new();
        let number = order_number("79927398713");
        assert_eq!(oracle.lookup(&number).await.unwrap(), OracleReply::unregistered());

        oracle
            .set_fallback(OracleError::Unavailable("down".into()))
            .await;
        assert!(oracle.lookup(&number).await.is_err());
        assert_eq!(oracle.calls(), 2);
    }
}
