pub mod scheduler;

use async_trait::async_trait;

use crate::accrual::Verdict;
use crate::error::AppResult;
use crate::ledger::{LedgerRepository, Order};

pub use scheduler::{Pipeline, PipelineConfig, PipelineHandle};

/// Storage surface the reconciliation pipeline needs: discover orders still
/// awaiting a verdict, and apply a verdict atomically (status + accrual +
/// balance credit in one transaction).
#[async_trait]
pub trait VerdictStore: Send + Sync + 'static {
    async fn orders_awaiting_verdict(&self, limit: i64) -> AppResult<Vec<Order>>;
    async fn apply_verdict(&self, order: &Order, verdict: &Verdict) -> AppResult<()>;
}

#[async_trait]
impl VerdictStore for LedgerRepository {
    async fn orders_awaiting_verdict(&self, limit: i64) -> AppResult<Vec<Order>> {
        LedgerRepository::orders_awaiting_verdict(self, limit).await
    }

    async fn apply_verdict(&self, order: &Order, verdict: &Verdict) -> AppResult<()> {
        self.update_order_and_credit(order.id, order.user_id, verdict.status, verdict.accrual)
            .await
    }
}
