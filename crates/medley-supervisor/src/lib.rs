#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-supervisor** – Lifecycle tree for the pipeline.
//!
//! A two-level tree, `root → {data, messaging, api}`. Startup proceeds
//! data → messaging → api; shutdown runs in reverse so nothing upstream
//! produces into a consumer that is already gone. Each service restarts on
//! crash with a capped frequency: more than `failure_threshold` crashes
//! within `failure_backoff` escalates to the root, which is the only
//! component allowed to take the process down.
//!
//! Shutdown enforces a global deadline; services that miss it are reported
//! and left behind, never force-killed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use medley_types::health::{HealthRegistry, HealthSnapshot, HealthState};
use medley_types::metrics::{MetricsSnapshot, PipelineMetrics};

//─────────────────────────────
//  Service contract
//─────────────────────────────

/// A supervised long-running component.
///
/// `run` is the service's whole life: it should start its work, hold until
/// the token cancels, and drain before returning. Returning while the token
/// is still live - with or without an error - counts as a crash.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name, used in health reports and logs.
    fn name(&self) -> &str;

    /// Run until cancelled.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Which tier of the tree a service belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Stores: WAL engines, the analytics pool
    Data,
    /// Broker, router, appender, WAL loops
    Messaging,
    /// Outward surfaces: adapters, import, probes
    Api,
}

impl Tier {
    const STARTUP_ORDER: [Tier; 3] = [Tier::Data, Tier::Messaging, Tier::Api];
}

/// Restart and shutdown tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Crashes tolerated within the backoff window before escalation.
    pub failure_threshold: u32,
    /// Window over which crashes are counted.
    pub failure_backoff: Duration,
    /// Pause before restarting a crashed service.
    pub restart_delay: Duration,
    /// Global shutdown deadline.
    pub shutdown_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_backoff: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// A service that exhausted its restart budget; the root must decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    /// The failed service
    pub service: String,
    /// Its tier
    pub tier: Tier,
}

/// Aggregate operational snapshot: health plus counters, one JSON object
/// for the external probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalSnapshot {
    /// Aggregated component health
    pub health: HealthSnapshot,
    /// Pipeline counters
    pub metrics: MetricsSnapshot,
}

//─────────────────────────────
//  Supervisor
//─────────────────────────────

struct Registered {
    service: Arc<dyn Service>,
    tier: Tier,
}

struct Running {
    name: String,
    tier: Tier,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The root of the service tree.
pub struct Supervisor {
    config: SupervisorConfig,
    health: Arc<HealthRegistry>,
    metrics: Arc<PipelineMetrics>,
    registered: Vec<Registered>,
    running: Vec<Running>,
    escalation_tx: mpsc::UnboundedSender<Escalation>,
    escalation_rx: Option<mpsc::UnboundedReceiver<Escalation>>,
}

impl Supervisor {
    /// Build an empty tree.
    pub fn new(
        config: SupervisorConfig,
        health: Arc<HealthRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        Self {
            config,
            health,
            metrics,
            registered: Vec::new(),
            running: Vec::new(),
            escalation_tx,
            escalation_rx: Some(escalation_rx),
        }
    }

    /// Add a service to a tier. Must happen before [`Self::start`].
    pub fn add_service(&mut self, tier: Tier, service: Arc<dyn Service>) {
        info!(service = service.name(), ?tier, "service registered");
        self.registered.push(Registered { service, tier });
    }

    /// Receiver for restart-budget escalations. The binary listens on this
    /// and exits the process; nothing below the root terminates siblings.
    pub fn escalations(&mut self) -> mpsc::UnboundedReceiver<Escalation> {
        self.escalation_rx
            .take()
            .expect("escalations() may only be taken once")
    }

    /// One JSON-ready object for `/healthz` and `/metrics`.
    pub fn snapshot(&self) -> OperationalSnapshot {
        OperationalSnapshot {
            health: self.health.snapshot(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Start every registered service, tier by tier: data, messaging, api.
    pub async fn start(&mut self) {
        for tier in Tier::STARTUP_ORDER {
            let services: Vec<Arc<dyn Service>> = self
                .registered
                .iter()
                .filter(|registered| registered.tier == tier)
                .map(|registered| Arc::clone(&registered.service))
                .collect();
            for service in services {
                self.launch(tier, service);
            }
            info!(?tier, "tier started");
        }
    }

    fn launch(&mut self, tier: Tier, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let cancel = CancellationToken::new();
        let worker = SuperviseLoop {
            service,
            tier,
            cancel: cancel.clone(),
            config: self.config.clone(),
            health: Arc::clone(&self.health),
            metrics: Arc::clone(&self.metrics),
            escalation_tx: self.escalation_tx.clone(),
        };
        let task = tokio::spawn(worker.run());
        self.running.push(Running {
            name,
            tier,
            cancel,
            task,
        });
    }

    /// Stop everything in reverse tier order under the global deadline.
    /// Services that miss the deadline are reported and left behind.
    pub async fn shutdown(&mut self) -> Vec<String> {
        let deadline = Instant::now() + self.config.shutdown_deadline;
        let mut laggards = Vec::new();

        for tier in Tier::STARTUP_ORDER.iter().rev() {
            let mut stopping = Vec::new();
            let mut remaining = Vec::new();
            for running in self.running.drain(..) {
                if running.tier == *tier {
                    running.cancel.cancel();
                    stopping.push(running);
                } else {
                    remaining.push(running);
                }
            }
            self.running = remaining;

            for running in stopping {
                let budget = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(budget, running.task).await {
                    Ok(Ok(())) => {
                        self.health.retire(&running.name);
                        info!(service = %running.name, "service stopped");
                    }
                    Ok(Err(join_error)) => {
                        warn!(service = %running.name, %join_error, "service panicked during shutdown");
                        self.health.retire(&running.name);
                    }
                    Err(_elapsed) => {
                        error!(service = %running.name, "service missed the shutdown deadline");
                        self.health
                            .report(&running.name, HealthState::Unhealthy, "missed shutdown deadline");
                        laggards.push(running.name);
                    }
                }
            }
            info!(?tier, "tier stopped");
        }
        laggards
    }
}

//─────────────────────────────
//  Per-service supervision loop
//─────────────────────────────

struct SuperviseLoop {
    service: Arc<dyn Service>,
    tier: Tier,
    cancel: CancellationToken,
    config: SupervisorConfig,
    health: Arc<HealthRegistry>,
    metrics: Arc<PipelineMetrics>,
    escalation_tx: mpsc::UnboundedSender<Escalation>,
}

impl SuperviseLoop {
    async fn run(self) {
        let name = self.service.name().to_string();
        let mut crashes: VecDeque<Instant> = VecDeque::new();

        loop {
            self.health.report(&name, HealthState::Healthy, "running");
            let result = self.service.run(self.cancel.clone()).await;

            if self.cancel.is_cancelled() {
                if let Err(error) = result {
                    warn!(service = %name, %error, "service errored while stopping");
                }
                return;
            }

            let detail = match result {
                Ok(()) => "exited early".to_string(),
                Err(error) => error.to_string(),
            };
            warn!(service = %name, detail, "service crashed");

            let now = Instant::now();
            crashes.push_back(now);
            while crashes
                .front()
                .is_some_and(|at| now.duration_since(*at) > self.config.failure_backoff)
            {
                crashes.pop_front();
            }

            if crashes.len() as u32 > self.config.failure_threshold {
                error!(
                    service = %name,
                    crashes = crashes.len(),
                    "restart budget exhausted, escalating to root"
                );
                self.health
                    .report(&name, HealthState::Unhealthy, "restart budget exhausted");
                let _ = self.escalation_tx.send(Escalation {
                    service: name,
                    tier: self.tier,
                });
                return;
            }

            self.health
                .report(&name, HealthState::Degraded, format!("restarting: {detail}"));
            self.metrics
                .service_restarts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.restart_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Appends start/stop markers to a shared journal and idles until
    /// cancelled.
    struct JournalingService {
        name: String,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Service for JournalingService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("start:{}", self.name));
            cancel.cancelled().await;
            self.journal
                .lock()
                .unwrap()
                .push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    /// Crashes `crashes` times, then idles until cancelled.
    struct FlakyService {
        runs: AtomicU32,
        crashes: u32,
    }

    #[async_trait]
    impl Service for FlakyService {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::Relaxed);
            if run < self.crashes {
                anyhow::bail!("induced crash {run}");
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Ignores cancellation entirely.
    struct StubbornService;

    #[async_trait]
    impl Service for StubbornService {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            // Holds forever; shutdown must not hang on it.
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn supervisor(config: SupervisorConfig) -> Supervisor {
        Supervisor::new(
            config,
            Arc::new(HealthRegistry::new()),
            Arc::new(PipelineMetrics::new()),
        )
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_is_tiered_and_shutdown_reverses_it() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = supervisor(SupervisorConfig::default());
        for (tier, name) in [
            (Tier::Api, "adapter"),
            (Tier::Data, "wal_store"),
            (Tier::Messaging, "router"),
        ] {
            supervisor.add_service(
                tier,
                Arc::new(JournalingService {
                    name: name.to_string(),
                    journal: Arc::clone(&journal),
                }),
            );
        }

        supervisor.start().await;
        wait_until(|| journal.lock().unwrap().len() == 3).await;
        {
            let entries = journal.lock().unwrap();
            assert_eq!(
                *entries,
                vec!["start:wal_store", "start:router", "start:adapter"]
            );
        }

        let laggards = supervisor.shutdown().await;
        assert!(laggards.is_empty());
        let entries = journal.lock().unwrap();
        assert_eq!(
            entries[3..],
            ["stop:adapter", "stop:router", "stop:wal_store"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_service_is_restarted() {
        let mut supervisor = supervisor(SupervisorConfig {
            restart_delay: Duration::from_millis(5),
            ..SupervisorConfig::default()
        });
        let service = Arc::new(FlakyService {
            runs: AtomicU32::new(0),
            crashes: 2,
        });
        supervisor.add_service(Tier::Messaging, Arc::clone(&service) as Arc<dyn Service>);
        supervisor.start().await;

        wait_until(|| service.runs.load(Ordering::Relaxed) == 3).await;
        assert!(supervisor.snapshot().metrics.service_restarts >= 2);
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_budget_exhaustion_escalates_to_root() {
        let mut supervisor = supervisor(SupervisorConfig {
            failure_threshold: 2,
            failure_backoff: Duration::from_secs(60),
            restart_delay: Duration::from_millis(1),
            ..SupervisorConfig::default()
        });
        let mut escalations = supervisor.escalations();
        supervisor.add_service(
            Tier::Messaging,
            Arc::new(FlakyService {
                runs: AtomicU32::new(0),
                crashes: u32::MAX,
            }),
        );
        supervisor.start().await;

        let escalation = escalations.recv().await.unwrap();
        assert_eq!(escalation.service, "flaky");
        assert_eq!(escalation.tier, Tier::Messaging);
        assert_eq!(supervisor.snapshot().health.state, HealthState::Unhealthy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_deadline_reports_laggards_without_hanging() {
        let mut supervisor = supervisor(SupervisorConfig {
            shutdown_deadline: Duration::from_millis(100),
            ..SupervisorConfig::default()
        });
        supervisor.add_service(Tier::Messaging, Arc::new(StubbornService));
        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let laggards = supervisor.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(laggards, vec!["stubborn".to_string()]);
        assert_eq!(supervisor.snapshot().health.state, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn snapshot_serializes_as_one_object() {
        let supervisor = supervisor(SupervisorConfig::default());
        let json = serde_json::to_string(&supervisor.snapshot()).unwrap();
        assert!(json.contains("health"));
        assert!(json.contains("metrics"));
    }
}
