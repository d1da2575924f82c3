use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::event::AuditEvent;
use crate::sink::AuditSink;

const AUDIT_EVENTS_TOTAL: &str = "audit_events_total";
const AUDIT_SINK_DROPPED_TOTAL: &str = "audit_sink_dropped_total";

/// Fans audit events out to the append-only sink, a bounded recent-events
/// ring, and a broadcast feed for live subscribers.
///
/// `record` is synchronous and infallible from the caller's point of view:
/// sink writes happen on a background task, subscriber delivery is
/// best-effort, and a full write queue drops the sink write (counted) rather
/// than stalling a rotation step.
#[derive(Clone)]
pub struct AuditRecorder {
    last_ts: Arc<Mutex<OffsetDateTime>>,
    recent: Arc<Mutex<VecDeque<AuditEvent>>>,
    recent_capacity: usize,
    feed: broadcast::Sender<AuditEvent>,
    writer: mpsc::Sender<AuditEvent>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink + Send + Sync>, recent_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(256);
        let (writer, mut rx) = mpsc::channel::<AuditEvent>(1024);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.append(&event).await;
            }
        });

        Self {
            last_ts: Arc::new(Mutex::new(OffsetDateTime::UNIX_EPOCH)),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(recent_capacity))),
            recent_capacity,
            feed,
            writer,
        }
    }

    /// Stamp and record one event. Timestamps are monotonic non-decreasing
    /// within the process even if the wall clock steps backwards.
    pub fn record(&self, mut event: AuditEvent) {
        let now = OffsetDateTime::now_utc();
        {
            let mut last = self.last_ts.lock().expect("poisoned audit clock lock");
            event.ts = if now > *last { now } else { *last };
            *last = event.ts;
        }

        counter!(AUDIT_EVENTS_TOTAL, "action" => format!("{:?}", event.action)).increment(1);

        {
            let mut recent = self.recent.lock().expect("poisoned audit ring lock");
            if recent.len() == self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No receivers is fine; subscribers catch up through recent()
        drop(self.feed.send(event.clone()));

        if self.writer.try_send(event).is_err() {
            counter!(AUDIT_SINK_DROPPED_TOTAL).increment(1);
            warn!("audit sink queue full, dropping event");
        }
    }

    /// Catch-up read of the newest events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent.lock().expect("poisoned audit ring lock");
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Live feed; a lagging subscriber misses events rather than slowing
    /// down recording.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::event::{Actor, AuditAction, AuditEvent, AuditResult};
    use crate::sink::MemorySink;

    use super::AuditRecorder;

    fn draft(target: &str) -> AuditEvent {
        AuditEvent::draft(
            Actor::System,
            AuditAction::ContainerStart,
            target,
            AuditResult::Ok,
        )
    }

    #[tokio::test]
    async fn timestamps_are_monotonic() {
        let recorder = AuditRecorder::new(Arc::new(MemorySink::new()), 16);
        for i in 0..50 {
            recorder.record(draft(&format!("web{i}")));
        }
        let events = recorder.recent(50);
        assert_eq!(events.len(), 16); // ring caps at capacity
        for pair in events.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[tokio::test]
    async fn recent_returns_newest_events() {
        let recorder = AuditRecorder::new(Arc::new(MemorySink::new()), 8);
        for i in 0..10 {
            recorder.record(draft(&format!("web{i}")));
        }
        let last_two = recorder.recent(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].target, "web8");
        assert_eq!(last_two[1].target, "web9");
    }

    #[tokio::test]
    async fn events_reach_the_sink() {
        let sink = MemorySink::new();
        let recorder = AuditRecorder::new(Arc::new(sink.clone()), 16);
        recorder.record(draft("web1"));
        recorder.record(draft("web2"));

        // sink writes happen on a background task
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sink.events().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].target, "web1");
    }

    #[tokio::test]
    async fn subscribers_see_live_events() {
        let recorder = AuditRecorder::new(Arc::new(MemorySink::new()), 16);
        let mut rx = recorder.subscribe();
        recorder.record(draft("web1"));
        let seen = rx.recv().await.expect("feed closed");
        assert_eq!(seen.target, "web1");
    }

    #[tokio::test]
    async fn recording_without_subscribers_succeeds() {
        let recorder = AuditRecorder::new(Arc::new(MemorySink::new()), 16);
        recorder.record(draft("web1"));
        assert_eq!(recorder.recent(10).len(), 1);
    }
}
