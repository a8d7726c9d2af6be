pub mod client;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::OrderStatus;

pub use client::AccrualClient;

/// The external service's classification of an order, already mapped onto
/// the internal status lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: OrderStatus,
    pub accrual: Decimal,
}

/// Everything `fetch_verdict` can surface to the pipeline. Callers match
/// exhaustively; there is no generic error to probe.
#[derive(Error, Debug)]
pub enum AccrualError {
    /// The service does not know the order yet. Expected for fresh orders;
    /// the pipeline skips it and retries on a later cycle.
    #[error("order is not registered in the accrual service")]
    NotRegistered,

    /// The service asked us to back off. Pauses the whole pipeline.
    #[error("accrual service rate limited, retry after {delay:?}")]
    RateLimited { delay: Duration },

    /// Transport retries exhausted, unexpected status, or malformed body.
    #[error("accrual failure: {0}")]
    Hard(String),
}

/// Seam for the reconciliation pipeline, so it can be driven against a mock
/// service in tests.
#[async_trait]
pub trait AccrualApi: Send + Sync + 'static {
    async fn fetch_verdict(&self, number: &str) -> Result<Verdict, AccrualError>;
}

#[async_trait]
impl AccrualApi for AccrualClient {
    async fn fetch_verdict(&self, number: &str) -> Result<Verdict, AccrualError> {
        AccrualClient::fetch_verdict(self, number).await
    }
}
