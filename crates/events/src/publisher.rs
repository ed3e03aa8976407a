//! Event publisher trait and implementations.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{DomainEvent, EventEnvelope};

/// Publishes domain events without blocking or failing the caller.
///
/// Implementations must swallow and log their own failures.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event.
    fn publish(&self, event: DomainEvent);
}

/// Publisher handle shared between components.
pub type SharedPublisher = Arc<dyn EventPublisher>;

/// Fans events out to in-process subscribers over a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events instead of slowing publishers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastPublisher {
    /// Creates a publisher whose channel buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: DomainEvent) {
        let envelope = EventEnvelope::wrap(event);
        let event_type = envelope.event_type.clone();
        match self.sender.send(envelope) {
            Ok(receivers) => {
                metrics::counter!("events_published_total", "event_type" => event_type.clone())
                    .increment(1);
                tracing::debug!(%event_type, receivers, "event published");
            }
            Err(_) => {
                tracing::debug!(%event_type, "event dropped, no subscribers");
            }
        }
    }
}

/// Writes every event to the log as structured JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: DomainEvent) {
        let envelope = EventEnvelope::wrap(event);
        match serde_json::to_string(&envelope.payload) {
            Ok(payload) => {
                metrics::counter!("events_published_total", "event_type" => envelope.event_type.clone())
                    .increment(1);
                tracing::info!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    %payload,
                    "domain event"
                );
            }
            Err(e) => {
                tracing::warn!(event_type = %envelope.event_type, error = %e, "failed to encode event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{ProductId, VariantId, WarehouseId};

    use super::*;
    use crate::event::StockLowData;

    fn event() -> DomainEvent {
        DomainEvent::StockLow(StockLowData {
            product_id: ProductId::new("SKU-001"),
            variant_id: VariantId::new("default"),
            warehouse_id: WarehouseId::default(),
            available: 1,
            threshold: 2,
            detected_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(event());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "stock.low");
        assert!(matches!(received.payload, DomainEvent::StockLow(_)));
    }

    #[test]
    fn publishing_without_subscribers_does_not_panic() {
        let publisher = BroadcastPublisher::new(1);
        publisher.publish(event());
        publisher.publish(event());
    }

    #[test]
    fn tracing_publisher_is_infallible() {
        TracingPublisher.publish(event());
    }

    #[test]
    fn publishers_are_object_safe() {
        let publishers: Vec<SharedPublisher> =
            vec![Arc::new(BroadcastPublisher::default()), Arc::new(TracingPublisher)];
        for p in publishers {
            p.publish(event());
        }
    }
}
