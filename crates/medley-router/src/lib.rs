#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-router** – Multi-consumer router over the durable stream.
//!
//! Every registered handler gets its own durable consumer group, so groups
//! progress independently and one slow consumer never holds back another.
//! Four middleware layers wrap each handler, outermost first:
//!
//! 1. **Throttle** - per-handler token-bucket rate cap
//! 2. **Deduplicate** - TTL-bounded `event_id` set, drops repeats
//! 3. **Retry** - exponential backoff up to the handler's retry budget
//! 4. **Poison** - after retries exhaust, republish to
//!    `playback.poison.<handler>` with failure metadata, write a
//!    failed-events row, and acknowledge the original
//!
//! Handlers must be idempotent under redelivery: the dedup layer is not
//! sufficient, since a handler may crash after its side effect but before
//! the broker ack.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use medley_broker::{Broker, BrokerError, Delivery, StreamSubscription};
use medley_types::metrics::PipelineMetrics;
use medley_types::{poison_subject, FailedEventRecord, FailedEventSink, FailureLayer};

mod dedup;
mod throttle;

pub use dedup::DedupSet;
pub use throttle::Throttle;

/// Subject prefix the router never dispatches to regular handlers; dead
/// letters are for operators, not for the consumers that produced them.
const POISON_PREFIX: &str = "playback.poison.";

/// Cap on the retry middleware's backoff between handler attempts.
const MAX_HANDLER_BACKOFF: Duration = Duration::from_secs(30);

//─────────────────────────────
//  Handler contract
//─────────────────────────────

/// One consumer of the stream.
///
/// A handler consumes one delivery and returns ok or an error; the router
/// decides retry versus poison. The handler's name doubles as its durable
/// consumer-group name.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name; also the consumer group.
    fn name(&self) -> &str;

    /// Process one delivery.
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Per-handler middleware tuning.
#[derive(Debug, Clone)]
pub struct HandlerPolicy {
    /// Global rate cap in deliveries per second; `None` disables the layer.
    pub throttle_per_sec: Option<f64>,
    /// How long a seen `event_id` suppresses repeats.
    pub dedup_ttl: Duration,
    /// Handler retries before the poison layer takes over.
    pub max_retries: u32,
    /// First retry backoff; doubles per attempt, capped at 30s.
    pub retry_base: Duration,
    /// Whether exhausted deliveries go to the dead-letter subject. When
    /// disabled the delivery is left unacked for broker redelivery.
    pub poison_enabled: bool,
}

impl Default for HandlerPolicy {
    fn default() -> Self {
        Self {
            throttle_per_sec: None,
            dedup_ttl: Duration::from_secs(600),
            max_retries: 5,
            retry_base: Duration::from_millis(250),
            poison_enabled: true,
        }
    }
}

/// Failure metadata wrapped around a dead-lettered body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonEnvelope {
    /// Handler that gave up
    pub handler: String,
    /// Final error text
    pub error: String,
    /// Attempts consumed (initial + retries)
    pub attempts: u32,
    /// When the poison decision was made
    pub failed_at: chrono::DateTime<Utc>,
    /// Original subject
    pub original_subject: String,
    /// Original body, verbatim
    pub body: serde_json::Value,
}

/// Router failures.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Subscribing a consumer group failed
    #[error("subscription failed: {0}")]
    Subscribe(#[from] BrokerError),
    /// The router is already running
    #[error("router already started")]
    AlreadyStarted,
}

//─────────────────────────────
//  Router
//─────────────────────────────

struct Registration {
    handler: Arc<dyn EventHandler>,
    policy: HandlerPolicy,
    filter: String,
}

/// Owns message delivery to handlers.
pub struct Router {
    broker: Arc<dyn Broker>,
    failed_sink: Arc<dyn FailedEventSink>,
    metrics: Arc<PipelineMetrics>,
    registrations: Vec<Registration>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Router {
    /// Build an empty router.
    pub fn new(
        broker: Arc<dyn Broker>,
        failed_sink: Arc<dyn FailedEventSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            failed_sink,
            metrics,
            registrations: Vec::new(),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a handler under its own consumer group and subject filter.
    pub fn register(
        &mut self,
        handler: Arc<dyn EventHandler>,
        filter: &str,
        policy: HandlerPolicy,
    ) {
        info!(handler = handler.name(), filter, "handler registered");
        self.registrations.push(Registration {
            handler,
            policy,
            filter: filter.to_string(),
        });
    }

    /// Subscribe every registered handler and start dispatching. A stopped
    /// router can be started again; registrations persist across restarts.
    pub async fn start(&mut self) -> Result<(), RouterError> {
        if !self.tasks.is_empty() {
            return Err(RouterError::AlreadyStarted);
        }
        self.cancel = CancellationToken::new();
        for registration in &self.registrations {
            let subscription = self
                .broker
                .subscribe_durable(registration.handler.name(), &registration.filter)
                .await?;
            let worker = DispatchWorker {
                handler: Arc::clone(&registration.handler),
                policy: registration.policy.clone(),
                broker: Arc::clone(&self.broker),
                failed_sink: Arc::clone(&self.failed_sink),
                metrics: Arc::clone(&self.metrics),
                cancel: self.cancel.clone(),
            };
            self.tasks.push(tokio::spawn(worker.run(subscription)));
        }
        info!(handlers = self.tasks.len(), "router started");
        Ok(())
    }

    /// Halt dispatch: cancel every worker and wait for them to drain their
    /// in-flight delivery.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                warn!(%error, "dispatch worker panicked during shutdown");
            }
        }
        info!("router stopped");
    }
}

//─────────────────────────────
//  Dispatch worker
//─────────────────────────────

struct DispatchWorker {
    handler: Arc<dyn EventHandler>,
    policy: HandlerPolicy,
    broker: Arc<dyn Broker>,
    failed_sink: Arc<dyn FailedEventSink>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl DispatchWorker {
    async fn run(self, mut subscription: Box<dyn StreamSubscription>) {
        let name = self.handler.name().to_string();
        let mut throttle = self.policy.throttle_per_sec.map(Throttle::new);
        let mut dedup = DedupSet::new(self.policy.dedup_ttl);

        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = subscription.next() => match next {
                    Ok(delivery) => delivery,
                    Err(error) => {
                        error!(handler = %name, %error, "subscription failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            // Dead letters are never dispatched back into handlers.
            if delivery.subject.starts_with(POISON_PREFIX) {
                self.ack(&mut subscription, delivery.seq, &name).await;
                continue;
            }

            if let Some(throttle) = throttle.as_mut() {
                throttle.acquire().await;
            }

            if !dedup.observe(&delivery.headers.event_id) {
                self.metrics
                    .handler(&name)
                    .deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                debug!(handler = %name, event_id = %delivery.headers.event_id, "duplicate dropped");
                self.ack(&mut subscription, delivery.seq, &name).await;
                continue;
            }

            self.dispatch(&mut subscription, &name, delivery).await;
        }
        debug!(handler = %name, "dispatch worker stopped");
    }

    /// Retry then poison. The original is acked on success, on dedup, and
    /// on poison; it is left for broker redelivery when poison is disabled.
    async fn dispatch(
        &self,
        subscription: &mut Box<dyn StreamSubscription>,
        name: &str,
        delivery: Delivery,
    ) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.handler.handle(&delivery).await {
                Ok(()) => {
                    self.metrics
                        .handler(name)
                        .success
                        .fetch_add(1, Ordering::Relaxed);
                    self.ack(subscription, delivery.seq, name).await;
                    return;
                }
                Err(error) => {
                    self.metrics
                        .handler(name)
                        .failure
                        .fetch_add(1, Ordering::Relaxed);
                    if attempts <= self.policy.max_retries {
                        let backoff = self
                            .policy
                            .retry_base
                            .saturating_mul(1u32 << (attempts - 1).min(16))
                            .min(MAX_HANDLER_BACKOFF);
                        warn!(
                            handler = %name,
                            seq = delivery.seq,
                            attempts,
                            %error,
                            "handler failed, retrying after {backoff:?}"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }
                    self.poison(subscription, name, &delivery, attempts, &error)
                        .await;
                    return;
                }
            }
        }
    }

    async fn poison(
        &self,
        subscription: &mut Box<dyn StreamSubscription>,
        name: &str,
        delivery: &Delivery,
        attempts: u32,
        error: &anyhow::Error,
    ) {
        if !self.policy.poison_enabled {
            warn!(
                handler = %name,
                seq = delivery.seq,
                "retries exhausted, poison disabled; leaving for broker redelivery"
            );
            return;
        }

        let envelope = PoisonEnvelope {
            handler: name.to_string(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
            original_subject: delivery.subject.clone(),
            body: serde_json::from_slice(&delivery.body).unwrap_or(serde_json::Value::Null),
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(encode_error) => {
                error!(handler = %name, %encode_error, "poison envelope encoding failed");
                return;
            }
        };

        if let Err(publish_error) = self
            .broker
            .publish(&poison_subject(name), delivery.headers.clone(), body)
            .await
        {
            // Leave the original unacked; redelivery will retry the whole
            // poison decision.
            error!(handler = %name, %publish_error, "dead-letter publish failed");
            return;
        }

        if let Err(sink_error) = self
            .failed_sink
            .record_failure(FailedEventRecord {
                transaction_id: delivery.headers.transaction_id.parse().ok(),
                event_id: Some(delivery.headers.event_id.clone()),
                source: Some(delivery.headers.source.clone()),
                payload: serde_json::from_slice(&delivery.body).unwrap_or(serde_json::Value::Null),
                failure_reason: "poison".to_string(),
                failure_layer: FailureLayer::Handler,
                last_error: Some(error.to_string()),
                retry_count: attempts,
            })
            .await
        {
            warn!(handler = %name, %sink_error, "failed-events row for poison message not written");
        }

        self.metrics
            .handler(name)
            .poisoned
            .fetch_add(1, Ordering::Relaxed);
        warn!(handler = %name, seq = delivery.seq, "delivery dead-lettered");
        self.ack(subscription, delivery.seq, name).await;
    }

    async fn ack(&self, subscription: &mut Box<dyn StreamSubscription>, seq: u64, name: &str) {
        if let Err(error) = subscription.ack(seq).await {
            error!(handler = %name, seq, %error, "ack failed");
        }
    }
}
