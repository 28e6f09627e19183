//! Sync lifecycle events.
//!
//! The coordinator reports progress through a [`SyncEventSink`]. The app
//! crate renders events on stderr (human or JSON lines); embedders can
//! subscribe to a [`BroadcastSink`] instead.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::SourceId;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        source_id: SourceId,
        root: String,
        total: usize,
    },
    Progress {
        source_id: SourceId,
        processed: usize,
        total: usize,
    },
    Completed {
        report: SyncReport,
    },
    Failed {
        source_id: SourceId,
        error: String,
    },
}

pub trait SyncEventSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl SyncEventSink for NoopSink {
    fn emit(&self, _event: &SyncEvent) {}
}

/// Fans events out to any number of async subscribers. Slow subscribers
/// miss events rather than stalling the sync.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl SyncEventSink for BroadcastSink {
    fn emit(&self, event: &SyncEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(&SyncEvent::Progress {
            source_id: "s".into(),
            processed: 1,
            total: 2,
        });
        match rx.recv().await.unwrap() {
            SyncEvent::Progress { processed, total, .. } => assert_eq!((processed, total), (1, 2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SyncEvent::Failed {
            source_id: "s".into(),
            error: "gone".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["error"], "gone");
    }
}
