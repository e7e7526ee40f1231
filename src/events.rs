//! Domain events and the outbox
//!
//! Events are emitted after the ledger transaction commits. A sink failure
//! never touches the committed write: the event is parked in the [`Outbox`]
//! and re-emitted later by the maintenance worker. The outbox is bounded:
//! once full, the oldest parked event is dropped to make room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};
use uuid::Uuid;

use crate::ports::EventSink;

/// Event names
pub mod names {
    pub const TRANSFER_POSTED: &str = "transfer.posted";
    pub const TRANSFER_PENDING_REVIEW: &str = "transfer.pending_review";
    pub const TRANSFER_BLOCKED: &str = "transfer.blocked";
    pub const TRANSFER_APPROVED: &str = "transfer.approved";
    pub const TRANSFER_REJECTED: &str = "transfer.rejected";
    pub const FX_TRANSFER_POSTED: &str = "fx_transfer.posted";
    pub const DEPOSIT_POSTED: &str = "deposit.posted";
    pub const WITHDRAWAL_REQUESTED: &str = "withdrawal.requested";
    pub const WITHDRAWAL_COMPLETED: &str = "withdrawal.completed";
    pub const WITHDRAWAL_EXPIRED: &str = "withdrawal.expired";
    pub const HOLD_AUTHORIZED: &str = "hold.authorized";
    pub const HOLD_DECLINED: &str = "hold.declined";
    pub const HOLD_CAPTURED: &str = "hold.captured";
    pub const HOLD_REVERSED: &str = "hold.reversed";
    pub const TRANSFER_REVERSED: &str = "transfer.reversed";
    pub const DEPOSIT_REVERSED: &str = "deposit.reversed";
    pub const WITHDRAWAL_REVERSED: &str = "withdrawal.reversed";
    pub const LEDGER_ADJUSTED: &str = "ledger.adjusted";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: &str, payload: serde_json::Value, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            name: name.to_string(),
            payload,
            occurred_at,
        }
    }
}

#[derive(Debug, Clone)]
struct ParkedEvent {
    event: DomainEvent,
    attempts: u32,
}

/// Parked events kept when no capacity is configured
pub const DEFAULT_OUTBOX_CAPACITY: usize = 10_000;

/// Events whose emission failed, waiting for a retry
pub struct Outbox {
    parked: Mutex<VecDeque<ParkedEvent>>,
    max_attempts: u32,
    capacity: usize,
    overflowed: AtomicUsize,
}

impl Outbox {
    pub fn new(max_attempts: u32, capacity: usize) -> Self {
        Self {
            parked: Mutex::new(VecDeque::new()),
            max_attempts: max_attempts.max(1),
            capacity: capacity.max(1),
            overflowed: AtomicUsize::new(0),
        }
    }

    /// Events evicted because the outbox was full
    pub fn overflowed(&self) -> usize {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.parked.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn park(&self, event: DomainEvent, attempts: u32) {
        let mut parked = self.parked.lock().unwrap_or_else(|p| p.into_inner());
        while parked.len() >= self.capacity {
            let Some(evicted) = parked.pop_front() else {
                break;
            };
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            error!(
                event_id = %evicted.event.event_id,
                name = %evicted.event.name,
                attempts = evicted.attempts,
                capacity = self.capacity,
                "Outbox full, dropping oldest event"
            );
        }
        parked.push_back(ParkedEvent { event, attempts });
    }

    fn take(&self, batch: usize) -> Vec<ParkedEvent> {
        let mut parked = self.parked.lock().unwrap_or_else(|p| p.into_inner());
        let n = batch.min(parked.len());
        parked.drain(..n).collect()
    }
}

/// Result of one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Best-effort emitter in front of an [`EventSink`]
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    outbox: Arc<Outbox>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, max_attempts: u32) -> Self {
        Self {
            sink,
            outbox: Arc::new(Outbox::new(max_attempts, DEFAULT_OUTBOX_CAPACITY)),
        }
    }

    /// Same sink, fresh outbox with a different retry budget and capacity
    pub fn with_outbox(self, max_attempts: u32, capacity: usize) -> Self {
        Self {
            sink: self.sink,
            outbox: Arc::new(Outbox::new(max_attempts, capacity)),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Emit now; park on failure. Never fails.
    pub async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.sink.emit(&event).await {
            warn!(
                event_id = %event.event_id,
                name = %event.name,
                error = %e,
                "Event emission failed, parked in outbox"
            );
            self.outbox.park(event, 1);
        }
    }

    /// Re-emit up to `batch` parked events
    pub async fn drain(&self, batch: usize) -> DrainStats {
        let mut stats = DrainStats::default();
        for parked in self.outbox.take(batch) {
            match self.sink.emit(&parked.event).await {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    let attempts = parked.attempts + 1;
                    if attempts >= self.outbox.max_attempts {
                        error!(
                            event_id = %parked.event.event_id,
                            name = %parked.event.name,
                            attempts,
                            error = %e,
                            "Dropping event after max attempts"
                        );
                        stats.dropped += 1;
                    } else {
                        self.outbox.park(parked.event, attempts);
                        stats.requeued += 1;
                    }
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MemoryEventSink;
    use serde_json::json;

    fn event(name: &str) -> DomainEvent {
        DomainEvent::new(name, json!({"k": 1}), Utc::now())
    }

    #[tokio::test]
    async fn test_publish_delivers() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone(), 3);
        publisher.publish(event(names::DEPOSIT_POSTED)).await;
        assert_eq!(sink.names(), vec![names::DEPOSIT_POSTED.to_string()]);
        assert!(publisher.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_failure_parks_then_drains() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone(), 3);
        sink.set_failing(true);
        publisher.publish(event(names::TRANSFER_POSTED)).await;
        assert_eq!(publisher.outbox().len(), 1);

        let stats = publisher.drain(10).await;
        assert_eq!(stats.requeued, 1);

        sink.set_failing(false);
        let stats = publisher.drain(10).await;
        assert_eq!(stats.delivered, 1);
        assert!(publisher.outbox().is_empty());
        assert_eq!(sink.names(), vec![names::TRANSFER_POSTED.to_string()]);
    }

    #[tokio::test]
    async fn test_drop_after_max_attempts() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone(), 2);
        sink.set_failing(true);
        publisher.publish(event(names::HOLD_CAPTURED)).await;

        let stats = publisher.drain(10).await;
        assert_eq!(stats.dropped, 1);
        assert!(publisher.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_batch() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone(), 5);
        sink.set_failing(true);
        for _ in 0..3 {
            publisher.publish(event(names::DEPOSIT_POSTED)).await;
        }
        sink.set_failing(false);
        let stats = publisher.drain(2).await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(publisher.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_full_outbox_drops_oldest() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone(), 5).with_outbox(5, 2);
        sink.set_failing(true);
        publisher.publish(event(names::DEPOSIT_POSTED)).await;
        publisher.publish(event(names::TRANSFER_POSTED)).await;
        publisher.publish(event(names::HOLD_CAPTURED)).await;
        assert_eq!(publisher.outbox().len(), 2);
        assert_eq!(publisher.outbox().overflowed(), 1);

        sink.set_failing(false);
        let stats = publisher.drain(10).await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(
            sink.names(),
            vec![
                names::TRANSFER_POSTED.to_string(),
                names::HOLD_CAPTURED.to_string()
            ]
        );
    }
}
