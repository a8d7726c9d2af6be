//! Order-accrual reconciliation pipeline.
//!
//! A ticking producer pulls orders awaiting a verdict from storage and feeds
//! a bounded queue; a single consumer drains the queue, asks the accrual
//! service for each verdict and applies it atomically. When the service rate
//! limits, the consumer pauses itself and signals the producer to pause too,
//! so the whole pipeline backs off rather than just one request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::VerdictStore;
use crate::accrual::{AccrualApi, AccrualError};
use crate::config::Config;
use crate::ledger::Order;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tick between polling storage for pending orders
    pub poll_interval: Duration,
    /// Max orders pulled from storage per tick
    pub batch_size: i64,
    /// Capacity of the producer/consumer work queue
    pub queue_capacity: usize,
    /// Budget for the graceful drain on shutdown
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
            ..Self::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 10,
            queue_capacity: 10,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Owned handle to the running pipeline: the cancellation token and the
/// task handles, constructed once at startup and torn down via `shutdown`.
pub struct PipelineHandle {
    cancel: CancellationToken,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Stops the pipeline: no new work is enqueued after cancellation is
    /// observed, and the consumer finishes its current order before exiting.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let drain = async {
            for task in self.tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!("reconciliation task panicked during shutdown: {}", e);
                    }
                }
            }
        };

        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("reconciliation pipeline did not drain within the shutdown budget");
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Spawns the producer, consumer and error-sink tasks.
    pub fn spawn<S, A>(storage: Arc<S>, client: Arc<A>, config: PipelineConfig) -> PipelineHandle
    where
        S: VerdictStore,
        A: AccrualApi,
    {
        let cancel = CancellationToken::new();

        let (order_tx, order_rx) = mpsc::channel::<Order>(config.queue_capacity);
        // Capacity 1: a second rate-limit signal during an unconsumed pause
        // carries no extra information.
        let (pause_tx, pause_rx) = mpsc::channel::<Duration>(1);
        let (err_tx, err_rx) = mpsc::unbounded_channel::<String>();

        let producer = tokio::spawn(run_producer(
            storage.clone(),
            config.clone(),
            order_tx,
            pause_rx,
            err_tx.clone(),
            cancel.clone(),
        ));
        let consumer = tokio::spawn(run_consumer(
            storage,
            client,
            order_rx,
            pause_tx,
            err_tx,
            cancel.clone(),
        ));
        let sink = tokio::spawn(run_error_sink(err_rx, cancel.clone()));

        info!(
            poll_interval = ?config.poll_interval,
            batch_size = config.batch_size,
            "reconciliation pipeline started"
        );

        PipelineHandle {
            cancel,
            shutdown_timeout: config.shutdown_timeout,
            tasks: vec![producer, consumer, sink],
        }
    }
}

/// Timer-driven producer: each tick pulls a batch of non-terminal orders and
/// enqueues them in storage order. A pause signal from the consumer delays
/// the next poll by the server-specified amount.
async fn run_producer<S: VerdictStore>(
    storage: Arc<S>,
    config: PipelineConfig,
    order_tx: mpsc::Sender<Order>,
    mut pause_rx: mpsc::Receiver<Duration>,
    err_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconciliation producer stopping");
                return;
            }
            Some(delay) = pause_rx.recv() => {
                debug!("reconciliation producer pausing for {:?}", delay);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            _ = ticker.tick() => {}
        }

        let batch = match storage.orders_awaiting_verdict(config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                let _ = err_tx.send(format!("failed to get orders awaiting verdict: {}", e));
                continue;
            }
        };

        for order in batch {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = order_tx.send(order) => {
                    if sent.is_err() {
                        // Consumer is gone; nothing left to feed.
                        return;
                    }
                }
            }
        }
    }
}

/// Single consumer: drains the queue in enqueue order, fetches each verdict
/// and applies it. Errors on one order never stop the next.
async fn run_consumer<S, A>(
    storage: Arc<S>,
    client: Arc<A>,
    mut order_rx: mpsc::Receiver<Order>,
    pause_tx: mpsc::Sender<Duration>,
    err_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) where
    S: VerdictStore,
    A: AccrualApi,
{
    loop {
        let order = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconciliation consumer stopping");
                return;
            }
            received = order_rx.recv() => match received {
                Some(order) => order,
                None => return,
            },
        };

        match client.fetch_verdict(&order.number).await {
            Ok(verdict) => {
                if let Err(e) = storage.apply_verdict(&order, &verdict).await {
                    let _ = err_tx.send(format!("failed to apply verdict for order {}: {}", order.number, e));
                }
            }
            Err(AccrualError::NotRegistered) => {
                // Fresh order the service has not seen yet; the next tick
                // picks it up again.
                debug!(order = %order.number, "order not registered yet, deferring");
            }
            Err(AccrualError::RateLimited { delay }) => {
                // Pause the producer and this consumer; queued orders stay
                // queued and are drained once the pause elapses.
                let _ = pause_tx.try_send(delay);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(AccrualError::Hard(cause)) => {
                let _ = err_tx.send(format!("accrual verdict for order {} failed: {}", order.number, cause));
            }
        }
    }
}

/// Drains the error channel into the log so failures are observable without
/// ever aborting the pipeline.
async fn run_error_sink(mut err_rx: mpsc::UnboundedReceiver<String>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = err_rx.recv() => match received {
                Some(message) => error!("reconciliation: {}", message),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::Verdict;
    use crate::error::AppResult;
    use crate::ledger::OrderStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn order(number: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            number: number.to_string(),
            user_id: Uuid::new_v4(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        }
    }

    fn test_config(poll_secs: u64) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_secs(poll_secs),
            ..PipelineConfig::default()
        }
    }

    /// In-memory store: pending orders leave the pending set once a verdict
    /// lands, mimicking the non-terminal-status filter.
    struct MockStore {
        pending: Mutex<Vec<Order>>,
        applied: Mutex<Vec<(String, OrderStatus, Decimal)>>,
    }

    impl MockStore {
        fn with_orders(orders: Vec<Order>) -> Arc<Self> {
            Arc::new(Self {
                pending: Mutex::new(orders),
                applied: Mutex::new(Vec::new()),
            })
        }

        fn applied(&self) -> Vec<(String, OrderStatus, Decimal)> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VerdictStore for MockStore {
        async fn orders_awaiting_verdict(&self, limit: i64) -> AppResult<Vec<Order>> {
            let pending = self.pending.lock().unwrap();
            Ok(pending.iter().take(limit as usize).cloned().collect())
        }

        async fn apply_verdict(&self, order: &Order, verdict: &Verdict) -> AppResult<()> {
            if verdict.status.is_terminal() {
                self.pending.lock().unwrap().retain(|o| o.id != order.id);
            }
            self.applied.lock().unwrap().push((
                order.number.clone(),
                verdict.status,
                verdict.accrual,
            ));
            Ok(())
        }
    }

    /// Scripted accrual service: plays back a queue of responses per order
    /// and records when each call happened.
    struct MockAccrual {
        script: Mutex<HashMap<String, VecDeque<Result<Verdict, AccrualError>>>>,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl MockAccrual {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn respond(self: &Arc<Self>, number: &str, response: Result<Verdict, AccrualError>) {
            self.script
                .lock()
                .unwrap()
                .entry(number.to_string())
                .or_default()
                .push_back(response);
        }

        fn calls(&self) -> Vec<(Instant, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccrualApi for MockAccrual {
        async fn fetch_verdict(&self, number: &str) -> Result<Verdict, AccrualError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), number.to_string()));
            self.script
                .lock()
                .unwrap()
                .get_mut(number)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Err(AccrualError::NotRegistered))
        }
    }

    fn processed(amount: Decimal) -> Result<Verdict, AccrualError> {
        Ok(Verdict {
            status: OrderStatus::Processed,
            accrual: amount,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn processed_verdict_is_applied_with_its_accrual() {
        let store = MockStore::with_orders(vec![order("49927398716")]);
        let accrual = MockAccrual::new();
        accrual.respond("49927398716", processed(dec!(729.98)));

        let handle = Pipeline::spawn(store.clone(), accrual.clone(), test_config(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.shutdown().await;

        let applied = store.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            applied[0],
            ("49927398716".to_string(), OrderStatus::Processed, dec!(729.98))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn not_registered_order_is_retried_on_the_next_cycle() {
        let store = MockStore::with_orders(vec![order("49927398716")]);
        let accrual = MockAccrual::new();
        accrual.respond("49927398716", Err(AccrualError::NotRegistered));
        accrual.respond("49927398716", processed(dec!(10)));

        let handle = Pipeline::spawn(store.clone(), accrual.clone(), test_config(1));
        tokio::time::sleep(Duration::from_secs(4)).await;
        handle.shutdown().await;

        // Skipped once without mutation, then picked up and applied.
        assert!(accrual.calls().len() >= 2);
        let applied = store.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1, OrderStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pauses_the_pipeline_without_dropping_orders() {
        let first = order("49927398716");
        let second = order("1234567812345670");
        let store = MockStore::with_orders(vec![first, second]);
        let accrual = MockAccrual::new();
        accrual.respond(
            "49927398716",
            Err(AccrualError::RateLimited {
                delay: Duration::from_secs(5),
            }),
        );
        accrual.respond("49927398716", processed(dec!(1)));
        accrual.respond("1234567812345670", processed(dec!(2)));

        let handle = Pipeline::spawn(store.clone(), accrual.clone(), test_config(1));
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.shutdown().await;

        let calls = accrual.calls();
        assert!(calls.len() >= 2);
        // No further accrual request for at least the advertised delay.
        let gap = calls[1].0 - calls[0].0;
        assert!(gap >= Duration::from_secs(5), "gap was {:?}", gap);

        // The queued order survived the pause and was eventually applied.
        let applied = store.applied();
        assert!(applied.iter().any(|(n, _, _)| n == "1234567812345670"));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_on_one_order_does_not_stop_the_next() {
        let first = order("49927398716");
        let second = order("1234567812345670");
        let store = MockStore::with_orders(vec![first, second]);
        let accrual = MockAccrual::new();
        accrual.respond("49927398716", Err(AccrualError::Hard("boom".to_string())));
        accrual.respond("49927398716", Err(AccrualError::Hard("boom".to_string())));
        accrual.respond("1234567812345670", processed(dec!(5)));

        let handle = Pipeline::spawn(store.clone(), accrual.clone(), test_config(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.shutdown().await;

        let applied = store.applied();
        assert!(applied.iter().any(|(n, _, _)| n == "1234567812345670"));
        assert!(!applied.iter().any(|(n, _, _)| n == "49927398716"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_producer_and_consumer() {
        let store = MockStore::with_orders(vec![]);
        let accrual = MockAccrual::new();

        let handle = Pipeline::spawn(store, accrual.clone(), test_config(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.shutdown().await;

        // No pending orders, so no calls; the point is that shutdown returns.
        assert!(accrual.calls().is_empty());
    }
}
