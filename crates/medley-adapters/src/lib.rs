#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-adapters** – Upstream source adapters.
//!
//! Three ingestion shapes funnel into one front door: a REST poller, a
//! webhook receiver, and a server-initiated streaming socket. Adapters
//! normalize source payloads into the canonical event - including
//! correlation-key derivation - so downstream components never see a
//! source-specific shape.
//!
//! Adapters never return synchronous errors upstream for transient
//! failures: once the producer WAL accepts the event the source is done.
//! Only a refused WAL append (or an invariant violation) surfaces.

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medley_types::{EventError, EventSink, PlaybackEvent};

mod normalize;
mod poll;
mod socket;
mod webhook;

pub use normalize::normalize_event;
pub use poll::{PollingAdapter, PollingConfig, SessionPoller};
pub use socket::{SocketAdapter, SocketConfig, StreamConnector};
pub use webhook::{WebhookAdapter, WebhookQueue};

//─────────────────────────────
//  Adapter contract
//─────────────────────────────

/// One upstream source.
///
/// `start` runs the adapter until the token cancels - cancelling the token
/// is the stop signal. The publisher must be set before `start`; events
/// flow only through it.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// Source tag carried on every event this adapter emits.
    fn source(&self) -> &str;

    /// Wire the durable front door.
    fn set_event_publisher(&self, publisher: Arc<dyn EventSink>);

    /// Run until cancelled.
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Shared publisher slot with the accept-and-forget publishing policy.
pub(crate) struct PublisherSlot {
    publisher: RwLock<Option<Arc<dyn EventSink>>>,
}

impl PublisherSlot {
    pub(crate) fn empty() -> Self {
        Self {
            publisher: RwLock::new(None),
        }
    }

    pub(crate) fn set(&self, publisher: Arc<dyn EventSink>) {
        *self.publisher.write().expect("publisher slot poisoned") = Some(publisher);
    }

    /// Push one normalized event through the front door.
    ///
    /// Invariant violations are dropped with a log line (the source cannot
    /// repair them); a WAL refusal is returned so the caller can surface it
    /// to the source for its own retry.
    pub(crate) async fn publish(&self, event: PlaybackEvent) -> Result<(), EventError> {
        let publisher = {
            let slot = self.publisher.read().expect("publisher slot poisoned");
            slot.clone()
        };
        let Some(publisher) = publisher else {
            return Err(EventError::SinkUnavailable(
                "no event publisher wired".to_string(),
            ));
        };
        match publisher.publish(event).await {
            Ok(transaction_id) => {
                debug!(%transaction_id, "event accepted");
                Ok(())
            }
            Err(
                error @ (EventError::MissingEventId
                | EventError::MissingSource
                | EventError::MissingCorrelationKey
                | EventError::Unparseable(_)),
            ) => {
                warn!(%error, "invariant-violating event dropped at the adapter boundary");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}
