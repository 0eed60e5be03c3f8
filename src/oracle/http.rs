//! HTTP client for the accrual service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AccrualOracle, AccrualStatus, OracleConfig, OracleError, OracleReply};
use crate::model::OrderNumber;

/// Body of a 200 answer.
#[derive(Debug, Deserialize)]
struct AccrualBody {
    order: String,
    status: AccrualStatus,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// Parse a `Retry-After` value given in whole seconds.
///
/// Missing, non-numeric or zero values fall back to `default`.
pub fn parse_retry_after(header: Option<&str>, default: Duration) -> Duration {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Map a raw oracle response onto a reply or error.
///
/// - 200: JSON body with status and optional accrual
/// - 204: order not registered with the oracle yet
/// - 429: rate limited for `Retry-After` seconds
/// - anything else: transient failure
pub fn classify(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &[u8],
    default_retry_after: Duration,
) -> Result<OracleReply, OracleError> {
    match status {
        StatusCode::OK => {
            let parsed: AccrualBody = serde_json::from_slice(body)
                .map_err(|e| OracleError::Malformed(e.to_string()))?;

            if let Some(amount) = parsed.accrual {
                if amount.is_sign_negative() {
                    return Err(OracleError::Malformed(format!(
                        "negative accrual {} for order {}",
                        amount, parsed.order
                    )));
                }
            }

            Ok(OracleReply {
                status: parsed.status,
                accrual: parsed.accrual,
                retry_after: retry_after
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            })
        }
        StatusCode::NO_CONTENT => Ok(OracleReply::unregistered()),
        StatusCode::TOO_MANY_REQUESTS => Err(OracleError::RateLimited {
            retry_after: parse_retry_after(retry_after, default_retry_after),
        }),
        s if s.is_server_error() => Err(OracleError::Unavailable(format!("HTTP {}", s))),
        s => Err(OracleError::UnexpectedStatus(s.as_u16())),
    }
}

/// HTTP accrual service client.
pub struct HttpAccrualClient {
    client: Client,
    config: OracleConfig,
}

impl HttpAccrualClient {
    /// Create a new client with the given configuration.
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        if config.address.is_empty() {
            return Err(OracleError::Unavailable(
                "accrual service address not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!(
            "{}/api/orders/{}",
            self.config.address.trim_end_matches('/'),
            number
        )
    }

    fn map_transport_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::Timeout(self.config.timeout())
        } else {
            OracleError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl AccrualOracle for HttpAccrualClient {
    #[tracing::instrument(name = "oracle.lookup", skip_all, fields(order = %number))]
    async fn lookup(&self, number: &OrderNumber) -> Result<OracleReply, OracleError> {
        let url = self.order_url(number);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let result = classify(
            status,
            retry_after.as_deref(),
            &body,
            self.config.default_retry_after(),
        );

        match &result {
            Ok(reply) => debug!(status = ?reply.status, "Accrual lookup answered"),
            Err(OracleError::RateLimited { retry_after }) => {
                warn!(retry_after_secs = retry_after.as_secs(), "Accrual service rate limit hit")
            }
            Err(e) => warn!(http_status = %status, error = %e, "Accrual lookup failed"),
        }

        result
    }
}
