// ============================================================================
// Quota Consumer - Async Consumption Pipeline
// ============================================================================
//
// Consumption is off the request hot path: the pipeline publishes events to
// a bounded channel and a small fixed pool of workers drains it. Each worker
// accumulates up to `batch_size` events or `flush_interval`, whichever comes
// first, then coalesces the batch per (scope, quota_type) into single
// increments. Addition is associative, so the committed used_value converges
// to the sum of accepted events regardless of worker interleaving.
//
// If the channel is full the publisher falls back to an inline increment, so
// bursts degrade to synchronous writes instead of losing events. Events that
// exhaust their retries are counted as dropped; dropping is preferred over
// blocking because the check path bounds over-admission.
//
// ============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AsyncQuotaConfig;
use crate::middleware::metrics;
use crate::models::{QuotaType, Scope};
use crate::services::quota_service::QuotaService;

#[derive(Debug, Clone)]
pub struct ConsumeEvent {
    pub scope: Scope,
    pub quota_type: QuotaType,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    inline_fallbacks: AtomicU64,
    batches: AtomicU64,
    last_flush_unix: AtomicI64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsumerStats {
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub dropped_events: u64,
    pub inline_fallbacks: u64,
    pub batch_count: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub workers_healthy: bool,
}

pub struct QuotaConsumer {
    service: Arc<QuotaService>,
    config: AsyncQuotaConfig,
    tx: Mutex<Option<mpsc::Sender<ConsumeEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<ConsumerCounters>,
    heartbeats: Arc<dashmap::DashMap<usize, Instant>>,
}

impl QuotaConsumer {
    /// Spawn the worker pool. With `enabled = false` no workers start and
    /// every publish takes the inline path.
    pub fn spawn(service: Arc<QuotaService>, config: AsyncQuotaConfig) -> Arc<Self> {
        let counters = Arc::new(ConsumerCounters::default());
        let heartbeats = Arc::new(dashmap::DashMap::new());

        if !config.enabled {
            return Arc::new(Self {
                service,
                config,
                tx: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                counters,
                heartbeats,
            });
        }

        let (tx, rx) = mpsc::channel::<ConsumeEvent>(config.channel_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(config.worker_count);

        for worker_id in 0..config.worker_count.max(1) {
            workers.push(tokio::spawn(Self::worker_loop(
                worker_id,
                Arc::clone(&service),
                config.clone(),
                Arc::clone(&rx),
                Arc::clone(&counters),
                Arc::clone(&heartbeats),
            )));
        }

        tracing::info!(
            workers = config.worker_count,
            channel = config.channel_size,
            batch = config.batch_size,
            "quota consumer pool started"
        );

        Arc::new(Self {
            service,
            config,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
            heartbeats,
        })
    }

    /// Publish a consume event. Returns immediately; a full (or closed)
    /// channel degrades to an inline increment so no event is silently lost
    /// under burst.
    pub async fn publish(&self, event: ConsumeEvent) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        metrics::QUOTA_EVENTS_PUBLISHED.inc();

        let sender = self.tx.lock().await.clone();
        if let Some(tx) = sender {
            match tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(event))
                | Err(mpsc::error::TrySendError::Closed(event)) => {
                    self.consume_inline(event).await;
                }
            }
        } else {
            self.consume_inline(event).await;
        }
    }

    async fn consume_inline(&self, event: ConsumeEvent) {
        self.counters.inline_fallbacks.fetch_add(1, Ordering::Relaxed);
        match self
            .service
            .consume(&event.scope, event.quota_type, event.amount)
            .await
        {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                metrics::QUOTA_EVENTS_PROCESSED.inc();
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::QUOTA_EVENTS_DROPPED.inc();
                tracing::error!(
                    scope = %event.scope,
                    quota_type = ?event.quota_type,
                    error = %e,
                    "inline quota consume failed, event dropped"
                );
            }
        }
    }

    async fn worker_loop(
        worker_id: usize,
        service: Arc<QuotaService>,
        config: AsyncQuotaConfig,
        rx: Arc<Mutex<mpsc::Receiver<ConsumeEvent>>>,
        counters: Arc<ConsumerCounters>,
        heartbeats: Arc<dashmap::DashMap<usize, Instant>>,
    ) {
        // Workers share one receiver behind a mutex; the idle wait is sliced
        // so every worker re-heartbeats within the health threshold even
        // while its peers hold the receiver.
        let idle_slice = config.flush_interval / config.worker_count.max(1) as u32;

        loop {
            heartbeats.insert(worker_id, Instant::now());

            // Wait for the first event of the batch; a closed channel ends
            // the worker once the backlog is drained.
            let first = {
                let mut rx = rx.lock().await;
                tokio::time::timeout(idle_slice, rx.recv()).await
            };
            let first = match first {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::debug!(worker_id, "quota consumer worker stopping");
                    break;
                }
                Err(_) => continue,
            };

            let mut batch = vec![first];
            let deadline = Instant::now() + config.flush_interval;
            while batch.len() < config.batch_size.max(1) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let next = {
                    let mut rx = rx.lock().await;
                    tokio::time::timeout(remaining, rx.recv()).await
                };
                match next {
                    Ok(Some(event)) => batch.push(event),
                    Ok(None) | Err(_) => break,
                }
            }

            heartbeats.insert(worker_id, Instant::now());
            Self::flush_batch(&service, &config, &counters, batch).await;
        }
    }

    /// Coalesce per (scope, quota_type) and commit. One store write per key,
    /// regardless of how many events the batch held.
    async fn flush_batch(
        service: &QuotaService,
        config: &AsyncQuotaConfig,
        counters: &ConsumerCounters,
        batch: Vec<ConsumeEvent>,
    ) {
        let mut grouped: HashMap<(Scope, QuotaType), (Decimal, u64)> = HashMap::new();
        for event in batch {
            let entry = grouped
                .entry((event.scope, event.quota_type))
                .or_insert((Decimal::ZERO, 0));
            entry.0 += event.amount;
            entry.1 += 1;
        }

        for ((scope, quota_type), (amount, event_count)) in grouped {
            let mut attempt = 0;
            loop {
                match service.consume(&scope, quota_type, amount).await {
                    Ok(()) => {
                        counters.processed.fetch_add(event_count, Ordering::Relaxed);
                        metrics::QUOTA_EVENTS_PROCESSED.inc_by(event_count as f64);
                        break;
                    }
                    Err(e) if attempt < config.retry_attempts => {
                        attempt += 1;
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            %scope, ?quota_type, attempt, error = %e,
                            "quota consume failed, retrying"
                        );
                        tokio::time::sleep(config.retry_delay).await;
                    }
                    Err(e) => {
                        counters.dropped.fetch_add(event_count, Ordering::Relaxed);
                        metrics::QUOTA_EVENTS_DROPPED.inc_by(event_count as f64);
                        tracing::error!(
                            %scope, ?quota_type, %amount, error = %e,
                            "quota consume retries exhausted, events dropped"
                        );
                        break;
                    }
                }
            }
        }

        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters
            .last_flush_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        metrics::QUOTA_BATCHES_FLUSHED.inc();
    }

    pub async fn stats(&self) -> ConsumerStats {
        let last_flush = self.counters.last_flush_unix.load(Ordering::Relaxed);
        let stale_after = self.config.flush_interval * 2;
        let workers_healthy = if self.config.enabled {
            let now = Instant::now();
            !self.heartbeats.is_empty()
                && self
                    .heartbeats
                    .iter()
                    .all(|beat| now.duration_since(*beat.value()) < stale_after)
        } else {
            true
        };

        ConsumerStats {
            total_events: self.counters.total.load(Ordering::Relaxed),
            processed_events: self.counters.processed.load(Ordering::Relaxed),
            failed_events: self.counters.failed.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped.load(Ordering::Relaxed),
            inline_fallbacks: self.counters.inline_fallbacks.load(Ordering::Relaxed),
            batch_count: self.counters.batches.load(Ordering::Relaxed),
            last_flush_at: (last_flush > 0).then(|| {
                DateTime::<Utc>::from_timestamp(last_flush, 0).unwrap_or_else(Utc::now)
            }),
            workers_healthy,
        }
    }

    /// Graceful shutdown: close the channel, then wait for the workers to
    /// drain the backlog.
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().await.take();
        drop(sender);

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "quota consumer worker join failed");
            }
        }
        tracing::info!("quota consumer drained and stopped");
    }
}
