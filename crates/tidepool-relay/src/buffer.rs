//! Real-time event buffering and deduplication.
//!
//! Every open subscription feeds raw events into one `EventStreamBuffer`.
//! The buffer drops duplicates arriving from multiple relays, discards
//! events too old to matter for a live feed, and delivers the survivors to
//! registered sinks in batches: a flush fires when the buffer reaches
//! `buffer_size` or when the flush-interval timer elapses, whichever comes
//! first.
//!
//! The seen-ID set is bounded with FIFO eviction. Extremely late duplicates
//! (older than the eviction horizon) can therefore re-appear; the consuming
//! feed deduplicates again by entity key, so this trades a little precision
//! for bounded memory on long-lived streams.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use nostr::{Event, EventId, Timestamp};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
// tokio Instant: follows the runtime clock, like the flush timer itself.
use tokio::time::Instant;

use crate::strategy::QueryPurpose;

/// Configuration for the event stream buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Flush as soon as this many events are pending.
    pub buffer_size: usize,
    /// Flush at least this often while events are pending.
    pub flush_interval: Duration,
    /// Events older than this at ingest time are discarded as stale.
    pub max_event_age: Duration,
    /// Tolerated clock skew for events claiming a future timestamp.
    pub max_future_skew: Duration,
    /// Bound on the seen-ID set; oldest entries are evicted past this.
    pub seen_capacity: usize,
    /// Sort each batch by descending creation time before delivery.
    pub sort_descending: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 30,
            flush_interval: Duration::from_millis(750),
            max_event_age: Duration::from_secs(3600),
            max_future_skew: Duration::from_secs(900),
            seen_capacity: 10_000,
            sort_descending: true,
        }
    }
}

impl BufferConfig {
    /// Tuned defaults per query purpose: realtime feeds flush small and
    /// often, search-style queries batch larger.
    pub fn for_purpose(purpose: QueryPurpose) -> Self {
        let (buffer_size, flush_ms, max_age_secs) = match purpose {
            QueryPurpose::Realtime => (20, 500, 1800),
            QueryPurpose::Profile => (20, 500, 3600),
            QueryPurpose::Events | QueryPurpose::Reactions => (30, 750, 3600),
            QueryPurpose::Search | QueryPurpose::Broadcast => (50, 1000, 3600),
        };
        Self {
            buffer_size,
            flush_interval: Duration::from_millis(flush_ms),
            max_event_age: Duration::from_secs(max_age_secs),
            ..Default::default()
        }
    }
}

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Accepted into the pending batch.
    Buffered,
    /// Already seen within the dedup horizon.
    Duplicate,
    /// Too old (or implausibly timestamped) for a live feed.
    Stale,
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Pending batch reached `buffer_size`.
    Size,
    /// Flush-interval timer elapsed.
    Timer,
    /// Initial backlog completed (all subscriptions reached EOSE).
    EndOfStored,
    /// Explicit caller request.
    Manual,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timer => "timer",
            Self::EndOfStored => "eose",
            Self::Manual => "manual",
        }
    }
}

/// Handle returned by [`EventStreamBuffer::register_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

type EventSink = Arc<dyn Fn(&[Event]) + Send + Sync>;

/// Buffer statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub ingested: u64,
    pub buffered: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub flushes: u64,
    pub delivered: u64,
    pub pending: usize,
}

/// Bounded identity set with FIFO eviction.
struct SeenIds {
    set: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert an id; returns false if it was already present.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct BufferInner {
    pending: Vec<Event>,
    seen: SeenIds,
    sinks: Vec<(u64, EventSink)>,
    next_sink_id: u64,
    last_flush: Instant,
}

/// Deduplicating, batching event buffer. Safe under concurrent producers.
pub struct EventStreamBuffer {
    config: BufferConfig,
    inner: Mutex<BufferInner>,
    ingested: AtomicU64,
    buffered: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    flushes: AtomicU64,
    delivered: AtomicU64,
    flushed_once: AtomicBool,
}

impl EventStreamBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let seen_capacity = config.seen_capacity;
        Self {
            config,
            inner: Mutex::new(BufferInner {
                pending: Vec::new(),
                seen: SeenIds::new(seen_capacity),
                sinks: Vec::new(),
                next_sink_id: 0,
                last_flush: Instant::now(),
            }),
            ingested: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            flushed_once: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Ingest one raw event. Triggers a size flush synchronously when the
    /// pending batch reaches `buffer_size`.
    pub fn ingest(&self, event: Event) -> IngestOutcome {
        self.ingested.fetch_add(1, Ordering::Relaxed);
        let now = Timestamp::now();

        if !tidepool_core::is_plausible_timestamp(&event, now, self.config.max_future_skew)
            || tidepool_core::is_older_than(&event, now, self.config.max_event_age)
        {
            self.stale.fetch_add(1, Ordering::Relaxed);
            counter!("relay_buffer_events_total", "outcome" => "stale").increment(1);
            return IngestOutcome::Stale;
        }

        let should_flush = {
            let mut inner = self.inner.lock();
            if !inner.seen.insert(event.id) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                counter!("relay_buffer_events_total", "outcome" => "duplicate").increment(1);
                return IngestOutcome::Duplicate;
            }
            inner.pending.push(event);
            inner.pending.len() >= self.config.buffer_size
        };

        self.buffered.fetch_add(1, Ordering::Relaxed);
        counter!("relay_buffer_events_total", "outcome" => "buffered").increment(1);

        if should_flush {
            self.flush(FlushReason::Size);
        }
        IngestOutcome::Buffered
    }

    /// Ingest a batch; returns how many were buffered.
    pub fn ingest_batch(&self, events: Vec<Event>) -> usize {
        events
            .into_iter()
            .map(|e| self.ingest(e))
            .filter(|o| *o == IngestOutcome::Buffered)
            .count()
    }

    /// Flush the pending batch to every registered sink.
    ///
    /// Sorting and sink snapshots happen under the lock; delivery happens
    /// outside it, with each sink unwind-guarded so one panicking sink cannot
    /// corrupt the buffer or starve the others. Returns the batch size.
    pub fn flush(&self, reason: FlushReason) -> usize {
        let (batch, sinks) = {
            let mut inner = self.inner.lock();
            inner.last_flush = Instant::now();
            if inner.pending.is_empty() {
                return 0;
            }
            let mut batch = std::mem::take(&mut inner.pending);
            if self.config.sort_descending {
                batch.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            let sinks: Vec<EventSink> = inner.sinks.iter().map(|(_, s)| Arc::clone(s)).collect();
            (batch, sinks)
        };

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.flushed_once.store(true, Ordering::SeqCst);
        counter!("relay_buffer_flushes_total", "reason" => reason.as_str()).increment(1);
        tracing::trace!(count = batch.len(), reason = reason.as_str(), "buffer flush");

        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink(&batch))).is_err() {
                tracing::error!("event sink panicked; continuing with remaining sinks");
            }
        }

        batch.len()
    }

    /// True once at least one flush has delivered events.
    pub fn has_flushed(&self) -> bool {
        self.flushed_once.load(Ordering::SeqCst)
    }

    /// Register a delivery sink.
    pub fn register_sink<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&[Event]) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_sink_id;
        inner.next_sink_id += 1;
        inner.sinks.push((id, Arc::new(sink)));
        SinkId(id)
    }

    /// Remove a sink. Unknown ids are a no-op.
    pub fn unregister_sink(&self, id: SinkId) {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|(sid, _)| *sid != id.0);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            pending: self.inner.lock().pending.len(),
        }
    }

    /// Spawn the flush-interval timer. A size-triggered flush resets the
    /// timer's reference point, so the timer never fires redundantly right
    /// after one.
    pub fn spawn_flush_timer(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.flush_interval;
        let buffer = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(buffer) = buffer.upgrade() else { break };
                let due = {
                    let inner = buffer.inner.lock();
                    !inner.pending.is_empty() && inner.last_flush.elapsed() >= interval
                };
                if due {
                    buffer.flush(FlushReason::Timer);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn event_with(content: &str, created_at: Timestamp) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::TextNote, content)
            .custom_created_at(created_at)
            .sign_with_keys(&keys)
            .unwrap()
    }

    fn fresh_event(content: &str) -> Event {
        event_with(content, Timestamp::now())
    }

    fn collecting_sink(buffer: &EventStreamBuffer) -> Arc<Mutex<Vec<Event>>> {
        let collected: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        buffer.register_sink(move |batch| {
            sink_target.lock().extend_from_slice(batch);
        });
        collected
    }

    #[test]
    fn test_duplicate_ids_delivered_once() {
        let buffer = EventStreamBuffer::new(BufferConfig::default());
        let collected = collecting_sink(&buffer);

        let event = fresh_event("hello");
        assert_eq!(buffer.ingest(event.clone()), IngestOutcome::Buffered);
        assert_eq!(buffer.ingest(event), IngestOutcome::Duplicate);

        buffer.flush(FlushReason::Manual);
        assert_eq!(collected.lock().len(), 1);
        assert_eq!(buffer.stats().duplicates, 1);
    }

    #[test]
    fn test_size_trigger_flushes_exactly_once() {
        let buffer = EventStreamBuffer::new(BufferConfig {
            buffer_size: 5,
            ..Default::default()
        });
        let collected = collecting_sink(&buffer);

        for i in 0..5 {
            buffer.ingest(fresh_event(&format!("event {}", i)));
        }

        let stats = buffer.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(collected.lock().len(), 5);
    }

    #[test]
    fn test_stale_events_never_delivered() {
        let buffer = EventStreamBuffer::new(BufferConfig {
            max_event_age: Duration::from_secs(3600),
            ..Default::default()
        });
        let collected = collecting_sink(&buffer);

        let stale = event_with(
            "old news",
            Timestamp::from(Timestamp::now().as_u64() - 7200),
        );
        assert_eq!(buffer.ingest(stale), IngestOutcome::Stale);

        // Bogus pre-genesis timestamp is also rejected.
        let bogus = event_with("bogus", Timestamp::from(1_000_000));
        assert_eq!(buffer.ingest(bogus), IngestOutcome::Stale);

        buffer.flush(FlushReason::Manual);
        assert!(collected.lock().is_empty());
        assert_eq!(buffer.stats().stale, 2);
    }

    #[test]
    fn test_batch_sorted_descending_by_created_at() {
        let buffer = EventStreamBuffer::new(BufferConfig::default());
        let collected = collecting_sink(&buffer);

        let base = Timestamp::now().as_u64() - 100;
        buffer.ingest(event_with("first", Timestamp::from(base + 1)));
        buffer.ingest(event_with("third", Timestamp::from(base + 3)));
        buffer.ingest(event_with("second", Timestamp::from(base + 2)));

        buffer.flush(FlushReason::Manual);
        let delivered = collected.lock();
        let times: Vec<u64> = delivered.iter().map(|e| e.created_at.as_u64()).collect();
        assert_eq!(times, vec![base + 3, base + 2, base + 1]);
    }

    #[test]
    fn test_panicking_sink_does_not_starve_others() {
        let buffer = EventStreamBuffer::new(BufferConfig::default());
        buffer.register_sink(|_batch| panic!("bad sink"));
        let collected = collecting_sink(&buffer);

        buffer.ingest(fresh_event("one"));
        buffer.flush(FlushReason::Manual);
        assert_eq!(collected.lock().len(), 1);

        // Buffer state survived; a second round still works.
        buffer.ingest(fresh_event("two"));
        buffer.flush(FlushReason::Manual);
        assert_eq!(collected.lock().len(), 2);
    }

    #[test]
    fn test_seen_set_eviction_allows_late_reappearance() {
        let buffer = EventStreamBuffer::new(BufferConfig {
            seen_capacity: 2,
            buffer_size: 100,
            ..Default::default()
        });

        let first = fresh_event("one");
        buffer.ingest(first.clone());
        buffer.ingest(fresh_event("two"));
        buffer.ingest(fresh_event("three")); // evicts "one" from the seen set

        // Past the eviction horizon the duplicate is accepted again; the
        // consuming feed dedups by entity key.
        assert_eq!(buffer.ingest(first), IngestOutcome::Buffered);
    }

    #[test]
    fn test_unregistered_sink_stops_receiving() {
        let buffer = EventStreamBuffer::new(BufferConfig::default());
        let collected: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        let id = buffer.register_sink(move |batch| {
            sink_target.lock().extend_from_slice(batch);
        });

        buffer.ingest(fresh_event("one"));
        buffer.flush(FlushReason::Manual);
        assert_eq!(collected.lock().len(), 1);

        buffer.unregister_sink(id);
        buffer.ingest(fresh_event("two"));
        buffer.flush(FlushReason::Manual);
        assert_eq!(collected.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_partial_batch() {
        let buffer = Arc::new(EventStreamBuffer::new(BufferConfig {
            buffer_size: 100,
            flush_interval: Duration::from_millis(100),
            ..Default::default()
        }));
        let collected = collecting_sink(&buffer);
        let timer = Arc::clone(&buffer).spawn_flush_timer();

        buffer.ingest(fresh_event("only one"));
        assert_eq!(buffer.stats().flushes, 0);

        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(buffer.stats().flushes, 1);
        assert_eq!(collected.lock().len(), 1);
        timer.abort();
    }
}
