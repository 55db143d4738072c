//! Pipeline assembly and the supervised service wrappers.
//!
//! Assembly wires the dependency graph leaves-first: stores, broker, WALs,
//! appender, consumers, router. The messaging tier runs as one supervised
//! service whose shutdown follows the mandatory ordering: stop the router,
//! flush and close the appender, close subscribers, close the publisher,
//! shut down the consumer WAL, then the producer WAL, then the broker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use medley_adapters::UpstreamAdapter;
use medley_analytics::{AnalyticsStore, EventAppender};
use medley_broker::{Broker, DurableStream};
use medley_detect::{
    build_detectors, build_notifiers, spawn_trust_recovery, DetectionContext, DetectionEngine,
    DetectionState, GeoResolver,
};
use medley_import::{HistoricalImporter, ImportConfig, LegacySource};
use medley_push::{PushHandler, PushHub};
use medley_router::{EventHandler, Router};
use medley_store::{KvProvider, SledProvider};
use medley_supervisor::{Service, Supervisor, Tier};
use medley_types::health::HealthRegistry;
use medley_types::metrics::PipelineMetrics;
use medley_types::{EventSink, FailedEventSink, SUBJECT_WILDCARD};
use medley_wal::consumer::ConsumerWal;
use medley_wal::ports::EventCommitter;
use medley_wal::producer::ProducerWal;

use crate::config::MedleyConfig;
use crate::ports::{
    AnalyticsBridgeHandler, NullGeoResolver, StoreAlertSink, StoreDetectionState, StoreProgress,
};

/// How long notifier webhooks may take before they are abandoned.
const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(10);

//─────────────────────────────
//  Assembled pipeline
//─────────────────────────────

/// Every long-lived component, wired and ready for the supervisor.
pub struct Pipeline {
    /// Boot configuration (immutable after assembly)
    pub config: MedleyConfig,
    /// Shared counters
    pub metrics: Arc<PipelineMetrics>,
    /// Shared health registry
    pub health: Arc<HealthRegistry>,
    /// Analytics store (shared pool)
    pub store: AnalyticsStore,
    /// Batched appender
    pub appender: Arc<EventAppender>,
    /// Embedded broker
    pub broker: Arc<DurableStream>,
    /// Durable front door
    pub producer_wal: Arc<ProducerWal>,
    /// Exactly-once bridge
    pub consumer_wal: Arc<ConsumerWal>,
    /// UI fan-out
    pub hub: Arc<PushHub>,
    detection_state: Arc<dyn DetectionState>,
    core: Arc<MessagingCore>,
}

impl Pipeline {
    /// Wire the whole graph. Nothing starts running until the supervisor
    /// does.
    pub async fn assemble(config: MedleyConfig) -> Result<Pipeline> {
        Self::assemble_with_geo(config, Arc::new(NullGeoResolver)).await
    }

    /// Wire the graph with a real geolocation resolver.
    pub async fn assemble_with_geo(
        config: MedleyConfig,
        geo: Arc<dyn GeoResolver>,
    ) -> Result<Pipeline> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::new());
        let health = Arc::new(HealthRegistry::new());

        // Stores first.
        let store = AnalyticsStore::open(&config.analytics_db_path)
            .await
            .context("opening analytics store")?;
        let producer_provider =
            SledProvider::open(&config.producer_wal_path).context("opening producer WAL store")?;
        let consumer_provider =
            SledProvider::open(&config.consumer_wal_path).context("opening consumer WAL store")?;
        let broker_provider =
            SledProvider::open(&config.broker_path).context("opening broker store")?;

        // Broker.
        let broker = Arc::new(
            DurableStream::open(&broker_provider, config.stream.clone())
                .context("opening durable stream")?,
        );

        // Appender over the shared pool.
        let appender = Arc::new(EventAppender::new(
            store.clone(),
            Arc::clone(&metrics),
            config.appender.clone(),
        ));

        // WALs.
        let failed_sink: Arc<dyn FailedEventSink> = Arc::new(store.clone());
        let producer_wal = Arc::new(ProducerWal::new(
            producer_provider.keyspace("wal")?,
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&failed_sink),
            Arc::clone(&metrics),
            config.producer_wal.clone(),
        ));
        let consumer_wal = Arc::new(ConsumerWal::new(
            consumer_provider.keyspace("wal")?,
            Arc::clone(&appender) as Arc<dyn EventCommitter>,
            Arc::new(store.clone()) as Arc<dyn EventCommitter>,
            Arc::clone(&failed_sink),
            Arc::clone(&metrics),
            config.consumer_wal.clone(),
        ));

        // Consumers.
        let hub = Arc::new(PushHub::new());
        let detection_state: Arc<dyn DetectionState> =
            Arc::new(StoreDetectionState::new(store.clone()));
        let engine = Arc::new(DetectionEngine::new(
            build_detectors(&config.detectors),
            DetectionContext {
                state: Arc::clone(&detection_state),
                geo,
                lookback: Duration::from_secs(24 * 3600),
            },
            Arc::new(StoreAlertSink::new(store.clone())),
            Arc::clone(&hub),
            build_notifiers(
                &config.notifiers,
                config.notifier_rate_per_min,
                NOTIFIER_TIMEOUT,
            ),
        ));

        // Router: one durable group per consumer.
        let mut router = Router::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&failed_sink),
            Arc::clone(&metrics),
        );
        router.register(
            Arc::new(AnalyticsBridgeHandler::new(Arc::clone(&consumer_wal)))
                as Arc<dyn EventHandler>,
            SUBJECT_WILDCARD,
            config.handler_policy.clone(),
        );
        router.register(
            Arc::new(PushHandler::new(Arc::clone(&hub))) as Arc<dyn EventHandler>,
            SUBJECT_WILDCARD,
            config.handler_policy.clone(),
        );
        router.register(
            engine as Arc<dyn EventHandler>,
            SUBJECT_WILDCARD,
            config.handler_policy.clone(),
        );

        let core = Arc::new(MessagingCore {
            broker: Arc::clone(&broker),
            producer_wal: Arc::clone(&producer_wal),
            consumer_wal: Arc::clone(&consumer_wal),
            appender: Arc::clone(&appender),
            hub: Arc::clone(&hub),
            router: Mutex::new(router),
            retention_interval: config.retention_interval,
        });

        info!("pipeline assembled");
        Ok(Pipeline {
            config,
            metrics,
            health,
            store,
            appender,
            broker,
            producer_wal,
            consumer_wal,
            hub,
            detection_state,
            core,
        })
    }

    /// The durable front door, for adapters and the historical import.
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.producer_wal) as Arc<dyn EventSink>
    }

    /// Build a checkpointed importer over a legacy source, for the external
    /// import start/stop/status surface.
    pub fn importer(
        &self,
        source: Arc<dyn LegacySource>,
        config: ImportConfig,
    ) -> Arc<HistoricalImporter> {
        Arc::new(HistoricalImporter::new(
            source,
            self.event_sink(),
            Arc::new(StoreProgress::new(self.store.clone())),
            config,
        ))
    }

    /// Build the supervised tree: data → messaging → api.
    pub fn into_supervisor(self, adapters: Vec<Arc<dyn UpstreamAdapter>>) -> Supervisor {
        let mut supervisor = Supervisor::new(
            self.config.supervisor.clone(),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
        );

        supervisor.add_service(
            Tier::Data,
            Arc::new(AnalyticsKeeper {
                store: self.store.clone(),
            }),
        );
        supervisor.add_service(Tier::Messaging, Arc::clone(&self.core) as Arc<dyn Service>);
        supervisor.add_service(
            Tier::Messaging,
            Arc::new(TrustRecovery {
                state: Arc::clone(&self.detection_state),
                amount: self.config.trust_decay,
                interval: self.config.trust_recovery_interval,
            }),
        );

        let sink = self.event_sink();
        for adapter in adapters {
            adapter.set_event_publisher(Arc::clone(&sink));
            supervisor.add_service(Tier::Api, Arc::new(AdapterService { adapter }));
        }
        supervisor
    }
}

//─────────────────────────────
//  Messaging tier service
//─────────────────────────────

/// Broker, WAL loops, appender, and router as one service with the
/// mandated internal shutdown ordering.
pub struct MessagingCore {
    broker: Arc<DurableStream>,
    producer_wal: Arc<ProducerWal>,
    consumer_wal: Arc<ConsumerWal>,
    appender: Arc<EventAppender>,
    hub: Arc<PushHub>,
    router: Mutex<Router>,
    retention_interval: Duration,
}

#[async_trait]
impl Service for MessagingCore {
    fn name(&self) -> &str {
        "messaging_core"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        // Replay both backlogs before any new work is accepted.
        self.producer_wal.recover_on_startup().await?;
        self.consumer_wal.recover_on_startup().await?;

        // One token per teardown step, so each concern stops on its own
        // step instead of in a shared sweep.
        let appender_cancel = CancellationToken::new();
        let consumer_cancel = CancellationToken::new();
        let producer_cancel = CancellationToken::new();
        let broker_cancel = CancellationToken::new();

        let appender_task = self.appender.spawn_flush_loop(appender_cancel.clone());
        let consumer_retry = self.consumer_wal.spawn_retry_loop(consumer_cancel.clone());
        let producer_retry = self.producer_wal.spawn_retry_loop(producer_cancel.clone());
        let producer_compactor = self.producer_wal.spawn_compactor(producer_cancel.clone());
        let retention = self
            .broker
            .spawn_retention_task(self.retention_interval, broker_cancel.clone());

        self.router.lock().await.start().await?;
        info!("messaging core running");
        cancel.cancelled().await;

        // Mandated shutdown ordering; each step completes before the next
        // begins.
        // 1. Stop the router: halts handler dispatch.
        self.router.lock().await.stop().await;
        // 2. Close the appender: flushes the remaining batch.
        appender_cancel.cancel();
        if let Err(error) = appender_task.await {
            warn!(%error, "appender flush loop panicked");
        }
        // 3. Close subscribers.
        self.hub.close_all();
        // 4. Close the publisher: the front door refuses new appends.
        self.producer_wal.close();
        // 5. Shut down the consumer WAL: stop its retry loop, close its
        //    store.
        consumer_cancel.cancel();
        if let Err(error) = consumer_retry.await {
            warn!(%error, "consumer WAL retry loop panicked");
        }
        if let Err(error) = self.consumer_wal.shutdown().await {
            warn!(%error, "consumer WAL shutdown failed");
        }
        // 6. Shut down the producer WAL: stop its retry loop and compactor,
        //    close its store.
        producer_cancel.cancel();
        if let Err(error) = producer_retry.await {
            warn!(%error, "producer WAL retry loop panicked");
        }
        if let Err(error) = producer_compactor.await {
            warn!(%error, "producer WAL compactor panicked");
        }
        if let Err(error) = self.producer_wal.shutdown().await {
            warn!(%error, "producer WAL shutdown failed");
        }
        // 7-8. Close the broker connection and stop the embedded broker:
        //      retention stops, then the stream refuses further traffic and
        //      flushes.
        broker_cancel.cancel();
        if let Err(error) = retention.await {
            warn!(%error, "stream retention task panicked");
        }
        if let Err(error) = self.broker.close().await {
            warn!(%error, "broker close failed");
        }
        info!("messaging core stopped");
        Ok(())
    }
}

//─────────────────────────────
//  Data and api tier services
//─────────────────────────────

/// Holds the analytics pool open for the lifetime of the tree and closes
/// it last.
struct AnalyticsKeeper {
    store: AnalyticsStore,
}

#[async_trait]
impl Service for AnalyticsKeeper {
    fn name(&self) -> &str {
        "analytics_store"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancelled().await;
        self.store.close().await;
        Ok(())
    }
}

/// Daily trust-score recovery as a supervised service.
struct TrustRecovery {
    state: Arc<dyn DetectionState>,
    amount: i64,
    interval: Duration,
}

#[async_trait]
impl Service for TrustRecovery {
    fn name(&self) -> &str {
        "trust_recovery"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let task = spawn_trust_recovery(
            Arc::clone(&self.state),
            self.amount,
            self.interval,
            cancel.clone(),
        );
        cancel.cancelled().await;
        task.await?;
        Ok(())
    }
}

/// One upstream adapter as a supervised service.
struct AdapterService {
    adapter: Arc<dyn UpstreamAdapter>,
}

#[async_trait]
impl Service for AdapterService {
    fn name(&self) -> &str {
        self.adapter.source()
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.adapter.start(cancel).await
    }
}
