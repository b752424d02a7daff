//! Bounded, observable violation event store.
//!
//! Uses a plain `std::sync::Mutex` rather than an async lock: every
//! operation here is O(1) amortized or O(n) in subscriber count and must
//! never become a suspension point.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// Ring capacity; oldest entries are evicted once exceeded.
pub const RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    FsRead,
    FsWrite,
    Network,
    SyscallDenied,
    Other,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FsRead => "fs_read",
            Self::FsWrite => "fs_write",
            Self::Network => "network",
            Self::SyscallDenied => "syscall_denied",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub id: u64,
    pub execution_id: Option<u64>,
    pub kind: ViolationKind,
    pub subject: String,
    pub pid: Option<u32>,
    pub raw: String,
    pub timestamp_ms: i64,
    pub encoded_command: String,
    /// Set when `subject` matched a `Configuration::ignore_violations`
    /// pattern: these are still recorded and counted, just suppressed
    /// from user-facing reports. Subscribers that
    /// render a report to an operator should filter on this; `total_count`
    /// and `current_count` never exclude suppressed events.
    pub suppressed: bool,
}

/// Parameters for recording a new violation; `id`/`timestamp_ms` are
/// assigned by the store.
pub struct NewViolation {
    pub execution_id: Option<u64>,
    pub kind: ViolationKind,
    pub subject: String,
    pub pid: Option<u32>,
    pub raw: String,
    pub encoded_command: String,
    pub suppressed: bool,
}

type Callback = Arc<dyn Fn(&[ViolationEvent]) + Send + Sync>;

struct Inner {
    ring: VecDeque<ViolationEvent>,
    total_count: u64,
    next_id: u64,
    next_sub_id: u64,
    broadcast: HashMap<u64, Callback>,
    per_execution: HashMap<u64, HashMap<u64, Callback>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            total_count: 0,
            next_id: 1,
            next_sub_id: 1,
            broadcast: HashMap::new(),
            per_execution: HashMap::new(),
        }
    }

    fn snapshot(&self) -> Vec<ViolationEvent> {
        self.ring.iter().cloned().collect()
    }

    fn snapshot_for_execution(&self, execution_id: u64) -> Vec<ViolationEvent> {
        self.ring
            .iter()
            .filter(|event| event.execution_id == Some(execution_id))
            .cloned()
            .collect()
    }
}

/// Clock abstraction so tests can supply deterministic timestamps without
/// this crate reaching for a wall-clock dependency of its own.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Handle returned by `subscribe`/`subscribe_to_execution`; dropping it does
/// not unsubscribe, unsubscription is always explicit. Calling `unsubscribe`
/// after the store has been torn down is a no-op.
pub struct Subscription {
    store: Weak<Mutex<Inner>>,
    id: u64,
    execution_id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut inner = match inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        match self.execution_id {
            Some(execution_id) => {
                if let Some(subs) = inner.per_execution.get_mut(&execution_id) {
                    subs.remove(&self.id);
                    if subs.is_empty() {
                        inner.per_execution.remove(&execution_id);
                    }
                }
            }
            None => {
                inner.broadcast.remove(&self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct ViolationStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for ViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ViolationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a violation, evicting the oldest entry if the ring is full,
    /// then notifies every subscriber with a fresh snapshot.
    pub fn add(&self, violation: NewViolation) -> ViolationEvent {
        let mut inner = self.lock();
        let event = ViolationEvent {
            id: inner.next_id,
            execution_id: violation.execution_id,
            kind: violation.kind,
            subject: violation.subject,
            pid: violation.pid,
            raw: violation.raw,
            timestamp_ms: self.clock.now_ms(),
            encoded_command: violation.encoded_command,
            suppressed: violation.suppressed,
        };
        inner.next_id += 1;
        inner.total_count += 1;
        if inner.ring.len() == RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        let broadcast_snapshot = inner.snapshot();
        for callback in inner.broadcast.values() {
            callback(&broadcast_snapshot);
        }
        if let Some(execution_id) = event.execution_id
            && let Some(subs) = inner.per_execution.get(&execution_id)
        {
            let execution_snapshot = inner.snapshot_for_execution(execution_id);
            for callback in subs.values() {
                callback(&execution_snapshot);
            }
        }
        event
    }

    /// Registers a broadcast subscriber; it receives the current snapshot
    /// immediately and again on every subsequent `add`.
    pub fn subscribe(
        &self,
        callback: impl Fn(&[ViolationEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        let callback: Callback = Arc::new(callback);
        callback(&inner.snapshot());
        inner.broadcast.insert(id, callback);
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
            execution_id: None,
        }
    }

    /// Registers a per-execution subscriber. Auto-removed once its
    /// execution id has no remaining subscribers.
    pub fn subscribe_to_execution(
        &self,
        execution_id: u64,
        callback: impl Fn(&[ViolationEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        let callback: Callback = Arc::new(callback);
        callback(&inner.snapshot_for_execution(execution_id));
        inner
            .per_execution
            .entry(execution_id)
            .or_default()
            .insert(id, callback);
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
            execution_id: Some(execution_id),
        }
    }

    /// Empties the ring without touching `total_count`.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
    }

    pub fn total_count(&self) -> u64 {
        self.lock().total_count
    }

    pub fn current_count(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn snapshot(&self) -> Vec<ViolationEvent> {
        self.lock().snapshot()
    }

    /// Convenience for callers building an operator-facing report: the
    /// current snapshot with `ignore_violations`-suppressed events
    /// filtered out.
    pub fn visible_snapshot(&self) -> Vec<ViolationEvent> {
        self.lock().snapshot().into_iter().filter(|event| !event.suppressed).collect()
    }

    /// Drops every subscriber without affecting the ring or counts; used by
    /// the Orchestrator's `reset()`.
    pub fn clear_subscribers(&self) {
        let mut inner = self.lock();
        inner.broadcast.clear();
        inner.per_execution.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    struct FakeClock(AtomicI64);

    impl Clock for FakeClock {
        fn now_ms(&self) -> i64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn violation(subject: &str) -> NewViolation {
        NewViolation {
            execution_id: None,
            kind: ViolationKind::Network,
            subject: subject.to_string(),
            pid: None,
            raw: subject.to_string(),
            encoded_command: "cmd-hash".to_string(),
            suppressed: false,
        }
    }

    #[test]
    fn visible_snapshot_excludes_suppressed_events() {
        let store = ViolationStore::new();
        store.add(violation("a.example.com"));
        store.add(NewViolation {
            suppressed: true,
            ..violation("ignored.example.com")
        });
        assert_eq!(store.snapshot().len(), 2);
        assert_eq!(store.visible_snapshot().len(), 1);
        assert_eq!(store.visible_snapshot()[0].subject, "a.example.com");
    }

    #[test]
    fn ring_evicts_oldest_but_total_count_keeps_growing() {
        let store = ViolationStore::with_clock(Arc::new(FakeClock(AtomicI64::new(0))));
        for i in 0..(RING_CAPACITY + 10) {
            store.add(violation(&format!("host{i}.example.com")));
        }
        assert_eq!(store.current_count(), RING_CAPACITY);
        assert_eq!(store.total_count(), (RING_CAPACITY + 10) as u64);
    }

    #[test]
    fn clear_empties_ring_without_touching_total_count() {
        let store = ViolationStore::new();
        store.add(violation("a.example.com"));
        store.add(violation("b.example.com"));
        store.clear();
        assert_eq!(store.current_count(), 0);
        assert_eq!(store.total_count(), 2);
    }

    #[test]
    fn broadcast_subscriber_receives_snapshot_on_registration_and_on_add() {
        let store = ViolationStore::new();
        store.add(violation("a.example.com"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |events| {
            seen_clone.lock().unwrap_or_else(|e| e.into_inner()).push(events.len());
        });
        store.add(violation("b.example.com"));

        let seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(*seen, vec![1, 2]);
    }

    #[test]
    fn per_execution_subscriber_only_sees_matching_events() {
        let store = ViolationStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe_to_execution(42, move |events| {
            seen_clone
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(events.to_vec());
        });

        store.add(NewViolation {
            execution_id: Some(7),
            ..violation("other-execution.example.com")
        });
        store.add(NewViolation {
            execution_id: Some(42),
            ..violation("matching.example.com")
        });

        let seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        let last = seen.last().expect("at least one callback");
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].subject, "matching.example.com");
    }

    #[test]
    fn unsubscribe_stops_further_callbacks() {
        let store = ViolationStore::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let sub = store.subscribe(move |_events| {
            *count_clone.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        });
        sub.unsubscribe();
        store.add(violation("a.example.com"));
        assert_eq!(*count.lock().unwrap_or_else(|e| e.into_inner()), 1);
    }

    #[test]
    fn unsubscribe_after_store_dropped_is_a_no_op() {
        let store = ViolationStore::new();
        let sub = store.subscribe(|_events| {});
        drop(store);
        sub.unsubscribe();
    }
}
