use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AccrualError, Verdict};
use crate::config::Config;
use crate::ledger::OrderStatus;

/// Bounded transport-level retries for network errors and 5xx responses.
/// Rate limiting (429) is deliberately not retried here: the pipeline owns
/// that pause, otherwise other in-flight polls would keep hammering the
/// service while one call waits.
const MAX_RETRIES: u32 = 3;
const RETRY_MIN: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_millis(1500);

/// Wire format of `GET {host}/api/orders/{number}`
#[derive(Debug, Deserialize)]
struct VerdictBody {
    #[allow(dead_code)]
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// Client for the external accrual service
pub struct AccrualClient {
    http: reqwest::Client,
    base_url: String,
    default_pause: Duration,
}

impl AccrualClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.accrual_address.trim_end_matches('/').to_string(),
            default_pause: config.default_pause,
        }
    }

    /// Asks the accrual service for its verdict on one order.
    pub async fn fetch_verdict(&self, number: &str) -> Result<Verdict, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        for attempt in 1..=MAX_RETRIES {
            let response = match self.http.get(&url).send().await {
                Ok(response) => response,
                Err(e) if attempt < MAX_RETRIES => {
                    let delay = linear_jitter_backoff(RETRY_MIN, RETRY_MAX, attempt);
                    warn!(%url, attempt, "accrual request failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    return Err(AccrualError::Hard(format!(
                        "accrual request failed after {} attempts: {}",
                        MAX_RETRIES, e
                    )))
                }
            };

            match response.status() {
                StatusCode::NO_CONTENT => return Err(AccrualError::NotRegistered),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok());
                    let delay = pause_from_retry_after(retry_after, self.default_pause);
                    debug!(order = number, "accrual service rate limited, pause {:?}", delay);
                    return Err(AccrualError::RateLimited { delay });
                }
                status if status.is_server_error() && attempt < MAX_RETRIES => {
                    let delay = linear_jitter_backoff(RETRY_MIN, RETRY_MAX, attempt);
                    warn!(%url, attempt, %status, "accrual returned server error, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                status if status.is_success() => {
                    let body: VerdictBody = response.json().await.map_err(|e| {
                        AccrualError::Hard(format!("malformed accrual response body: {}", e))
                    })?;
                    return verdict_from_body(body);
                }
                status => {
                    return Err(AccrualError::Hard(format!(
                        "unexpected accrual response status {} for order {}",
                        status, number
                    )))
                }
            }
        }

        unreachable!("retry loop always returns on the final attempt")
    }
}

fn verdict_from_body(body: VerdictBody) -> Result<Verdict, AccrualError> {
    let status = match body.status.as_str() {
        "REGISTERED" | "PROCESSING" => OrderStatus::Processing,
        "INVALID" => OrderStatus::Invalid,
        "PROCESSED" => OrderStatus::Processed,
        other => {
            return Err(AccrualError::Hard(format!(
                "unknown accrual status {:?}",
                other
            )))
        }
    };

    Ok(Verdict {
        status,
        accrual: body.accrual.unwrap_or(Decimal::ZERO),
    })
}

/// Pause for a 429: the `Retry-After` seconds when present and parseable,
/// otherwise the configured default.
fn pause_from_retry_after(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Linear jittered backoff: `attempt * rand(min..=max)`
fn linear_jitter_backoff(min: Duration, max: Duration, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis()) as u64;
    Duration::from_millis(jitter * attempt as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn body(status: &str, accrual: Option<Decimal>) -> VerdictBody {
        VerdictBody {
            order: "79927398713".to_string(),
            status: status.to_string(),
            accrual,
        }
    }

    #[test]
    fn registered_and_processing_both_map_to_processing() {
        let v = verdict_from_body(body("REGISTERED", None)).unwrap();
        assert_eq!(v.status, OrderStatus::Processing);

        let v = verdict_from_body(body("PROCESSING", None)).unwrap();
        assert_eq!(v.status, OrderStatus::Processing);
    }

    #[test]
    fn processed_carries_the_accrual_amount() {
        let v = verdict_from_body(body("PROCESSED", Some(dec!(729.98)))).unwrap();
        assert_eq!(v.status, OrderStatus::Processed);
        assert_eq!(v.accrual, dec!(729.98));
    }

    #[test]
    fn missing_accrual_defaults_to_zero() {
        let v = verdict_from_body(body("INVALID", None)).unwrap();
        assert_eq!(v.status, OrderStatus::Invalid);
        assert_eq!(v.accrual, Decimal::ZERO);
    }

    #[test]
    fn unknown_status_is_a_hard_error() {
        let err = verdict_from_body(body("EXPLODED", None)).unwrap_err();
        assert!(matches!(err, AccrualError::Hard(_)));
    }

    #[test]
    fn retry_after_parsing() {
        let default = Duration::from_secs(60);
        assert_eq!(
            pause_from_retry_after(Some("5"), default),
            Duration::from_secs(5)
        );
        assert_eq!(
            pause_from_retry_after(Some(" 12 "), default),
            Duration::from_secs(12)
        );
        assert_eq!(pause_from_retry_after(Some("soon"), default), default);
        assert_eq!(pause_from_retry_after(None, default), default);
    }

    #[test]
    fn backoff_grows_with_attempts_and_stays_bounded() {
        for attempt in 1..=3 {
            let d = linear_jitter_backoff(RETRY_MIN, RETRY_MAX, attempt);
            assert!(d >= RETRY_MIN * attempt);
            assert!(d <= RETRY_MAX * attempt);
        }
    }
}
