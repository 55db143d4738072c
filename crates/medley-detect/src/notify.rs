//! Notifier sinks for alerts.
//!
//! Each configured notifier is wrapped in its own token bucket; an alert
//! that exceeds the rate is dropped for that notifier, never queued. The
//! notifiers themselves are thin HTTP posts - delivery guarantees stop at
//! the push hub and the analytics store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use medley_router::Throttle;

use crate::Alert;

/// Tagged-variant notifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierConfig {
    /// Plain JSON webhook: POSTs the alert verbatim.
    Webhook {
        /// Display name, used in logs and rate-limit accounting
        name: String,
        /// Target URL
        url: String,
    },
    /// Chat-service webhook: POSTs a `{"text": ...}` summary.
    ChatWebhook {
        /// Display name
        name: String,
        /// Target URL
        url: String,
    },
}

/// One alert delivery target.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Deliver one alert.
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

//─────────────────────────────
//  HTTP notifiers
//─────────────────────────────

struct WebhookNotifier {
    name: String,
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

struct ChatWebhookNotifier {
    name: String,
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl Notifier for ChatWebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        let text = format!(
            "[{}] {} (user {})",
            alert.kind,
            alert.detail,
            alert.user_id.as_deref().unwrap_or("unknown")
        );
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

//─────────────────────────────
//  Rate limiting
//─────────────────────────────

/// A notifier behind its own token bucket.
pub struct RateLimitedNotifier {
    inner: Arc<dyn Notifier>,
    throttle: Mutex<Throttle>,
}

impl RateLimitedNotifier {
    /// Allow `rate_per_min` notifications per minute with a matching burst.
    pub fn new(inner: Arc<dyn Notifier>, rate_per_min: f64) -> Self {
        Self {
            inner,
            throttle: Mutex::new(Throttle::new(rate_per_min / 60.0)),
        }
    }

    /// Deliver the alert unless the bucket is empty; over-rate alerts are
    /// dropped with a log line, never queued behind the handler.
    pub async fn notify(&self, alert: &Alert) {
        if !self.throttle.lock().await.try_acquire() {
            debug!(notifier = self.inner.name(), kind = %alert.kind, "notification rate-limited");
            return;
        }
        if let Err(error) = self.inner.notify(alert).await {
            warn!(notifier = self.inner.name(), %error, "notification delivery failed");
        }
    }
}

/// Build the notifier set from configuration.
pub fn build_notifiers(
    configs: &[NotifierConfig],
    rate_per_min: f64,
    timeout: Duration,
) -> Vec<Arc<RateLimitedNotifier>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default();

    configs
        .iter()
        .map(|config| {
            let inner: Arc<dyn Notifier> = match config.clone() {
                NotifierConfig::Webhook { name, url } => Arc::new(WebhookNotifier {
                    name,
                    url,
                    client: client.clone(),
                }),
                NotifierConfig::ChatWebhook { name, url } => Arc::new(ChatWebhookNotifier {
                    name,
                    url,
                    client: client.clone(),
                }),
            };
            Arc::new(RateLimitedNotifier::new(inner, rate_per_min))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingNotifier(AtomicU32);

    #[async_trait]
    impl Notifier for CountingNotifier {
        fn name(&self) -> &str {
            "counting"
        }
        async fn notify(&self, _alert: &Alert) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn sample_alert() -> Alert {
        Alert {
            kind: "vpn_usage".to_string(),
            user_id: Some("42".to_string()),
            event_id: "e-1".to_string(),
            source: "plex".to_string(),
            detail: "address belongs to a known VPN range".to_string(),
            raised_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn over_rate_alerts_are_dropped_not_queued() {
        let inner = Arc::new(CountingNotifier(AtomicU32::new(0)));
        // 60/min = burst of 1.
        let limited = RateLimitedNotifier::new(Arc::clone(&inner) as Arc<dyn Notifier>, 60.0);

        let alert = sample_alert();
        limited.notify(&alert).await;
        limited.notify(&alert).await;
        limited.notify(&alert).await;
        assert_eq!(inner.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn notifier_config_round_trips_through_serde() {
        let configs = vec![
            NotifierConfig::Webhook {
                name: "ops".to_string(),
                url: "https://ops.example/hook".to_string(),
            },
            NotifierConfig::ChatWebhook {
                name: "chat".to_string(),
                url: "https://chat.example/hook".to_string(),
            },
        ];
        let json = serde_json::to_string(&configs).unwrap();
        let back: Vec<NotifierConfig> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, configs);
        assert_eq!(build_notifiers(&back, 10.0, Duration::from_secs(5)).len(), 2);
    }
}
