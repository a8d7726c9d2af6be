pub mod handlers;
pub mod models;

use std::sync::Arc;
use std::time::Duration;

use crate::ledger::LedgerRepository;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerRepository>,
    pub jwt_secret: String,
    pub jwt_ttl: Duration,
}
