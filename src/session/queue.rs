use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::session::SessionId;

/// Default bounded-retention age: a tracked id is evicted once an id more than this much larger
///  is pushed.
pub const DEFAULT_MAX_AGE: u32 = 100;

/// Sleep interval between polls while waiting for an entry. The internal lock is not held while
///  sleeping.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    message: String,
    value: String,
}

#[derive(Default)]
struct MessageQueueInner {
    queues: FxHashMap<SessionId, VecDeque<Entry>>,
    id_counter: u32,
}

/// A concurrent map from session id to a FIFO of `(message, value)` pairs, plus the single
///  authority for generating session ids.
///
/// All operations are serialized by one queue-wide lock. That is intentionally coarse: every
///  operation is O(1) amortized, and contention is limited to control traffic. The lock is never
///  held across an `.await`.
///
/// Retention is bounded, not an LRU: `push(id, ..)` first evicts every tracked id `i` with
///  `i + max_age < id`, which assumes ids roughly track arrival order. Callers that push with
///  wildly out-of-order ids can see premature eviction; that is accepted behavior.
pub struct MessageQueue {
    max_age: u32,
    inner: Mutex<MessageQueueInner>,
}

impl MessageQueue {
    pub fn new(max_age: u32) -> MessageQueue {
        MessageQueue {
            max_age,
            inner: Mutex::new(MessageQueueInner::default()),
        }
    }

    /// Appends `(message, value)` to the FIFO for `id`, creating the FIFO if absent, evicting
    ///  aged-out ids first. Returns false (and stores nothing) for the invalid session id.
    pub fn push(&self, id: SessionId, message: impl Into<String>, value: impl Into<String>) -> bool {
        if !id.is_valid() {
            warn!("attempt to push a message for the invalid session id");
            return false;
        }

        let mut inner = self.inner.lock().unwrap();

        let max_age = self.max_age as u64;
        inner.queues.retain(|&i, _| i.0 as u64 + max_age >= id.0 as u64);

        inner.queues.entry(id)
            .or_default()
            .push_back(Entry {
                message: message.into(),
                value: value.into(),
            });
        true
    }

    /// Non-blocking peek at the head entry for `id` without removing it.
    pub fn front(&self, id: SessionId) -> Option<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(&id)
            .and_then(|q| q.front())
            .map(|e| (e.message.clone(), e.value.clone()))
    }

    /// Waits until an entry for `id` is available or `timeout` elapses, polling with a short
    ///  cooperative sleep between attempts. The lock is released during each sleep so other
    ///  callers are never starved.
    pub async fn front_within(&self, id: SessionId, timeout: Duration) -> Option<(String, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.front(id) {
                return Some(entry);
            }
            if Instant::now() >= deadline {
                warn!("timeout waiting for a message for session {:?}", id);
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Removes the head entry for `id`; no-op if the FIFO is empty or absent.
    pub fn pop(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get_mut(&id) {
            q.pop_front();
            if q.is_empty() {
                inner.queues.remove(&id);
            }
        }
    }

    /// Front-then-pop as one logical operation with a timeout.
    ///
    /// NB: front and pop are two steps internally, so a concurrent [MessageQueue::clear] can
    ///  empty the FIFO in between. In that case the pop is a silent no-op and the caller still
    ///  gets the value it peeked.
    pub async fn pop_within(&self, id: SessionId, timeout: Duration) -> Option<(String, String)> {
        let entry = self.front_within(id, timeout).await?;
        self.pop(id);
        Some(entry)
    }

    /// Convenience form of [MessageQueue::pop_within] that returns just the message, or an empty
    ///  string on timeout.
    pub async fn pop_message_within(&self, id: SessionId, timeout: Duration) -> String {
        self.pop_within(id, timeout).await
            .map(|(message, _)| message)
            .unwrap_or_default()
    }

    /// Drops all entries for all ids.
    pub fn clear(&self) {
        self.inner.lock().unwrap()
            .queues.clear();
    }

    /// Drops all entries for one id.
    pub fn clear_id(&self, id: SessionId) {
        self.inner.lock().unwrap()
            .queues.remove(&id);
    }

    /// Atomically increments and returns the shared session-id counter. The first call returns
    ///  `1`; the invalid sentinel `0` is never produced. Ids are never reused.
    pub fn unique_id(&self) -> SessionId {
        let mut inner = self.inner.lock().unwrap();
        inner.id_counter += 1;
        let id = SessionId(inner.id_counter);
        trace!("allocated session id {:?}", id);
        id
    }

    /// The counter's current value without incrementing - for diagnostics only. The returned id
    ///  may already be in use, so it must not be used for correlation.
    pub fn last_unique_id(&self) -> SessionId {
        SessionId(self.inner.lock().unwrap().id_counter)
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        MessageQueue::new(DEFAULT_MAX_AGE)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::rstest;
    use tokio::runtime::Builder;

    use super::*;

    #[rstest]
    fn test_fifo_order() {
        let queue = MessageQueue::default();
        let id = SessionId(1);

        for i in 0..5 {
            assert!(queue.push(id, format!("m{}", i), format!("v{}", i)));
        }

        for i in 0..5 {
            let expected = (format!("m{}", i), format!("v{}", i));
            assert_eq!(queue.front(id), Some(expected.clone()));
            // front is non-destructive
            assert_eq!(queue.front(id), Some(expected));
            queue.pop(id);
        }
        assert_eq!(queue.front(id), None);
    }

    #[rstest]
    fn test_push_invalid_id() {
        let queue = MessageQueue::default();
        assert!(!queue.push(SessionId::INVALID, "m", "v"));
        assert_eq!(queue.front(SessionId::INVALID), None);
    }

    #[rstest]
    #[case::far_apart(1, 102, true)]
    #[case::boundary_evicted(1, 102, true)]
    #[case::boundary_kept(1, 101, false)]
    #[case::close(5, 7, false)]
    fn test_eviction(#[case] old_id: u32, #[case] new_id: u32, #[case] expect_evicted: bool) {
        let queue = MessageQueue::new(DEFAULT_MAX_AGE);
        queue.push(SessionId(old_id), "old", "");
        queue.push(SessionId(new_id), "new", "");

        assert_eq!(queue.front(SessionId(old_id)).is_none(), expect_evicted);
        assert_eq!(queue.front(SessionId(new_id)), Some(("new".to_string(), "".to_string())));
    }

    #[rstest]
    fn test_eviction_of_never_popped_ids() {
        let queue = MessageQueue::new(10);
        for i in 1..=5 {
            queue.push(SessionId(i), "m", "v");
        }
        queue.push(SessionId(16), "m", "v");

        for i in 1..=5 {
            assert_eq!(queue.front(SessionId(i)), None);
        }
        assert!(queue.front(SessionId(16)).is_some());
    }

    #[rstest]
    fn test_unique_id_monotonicity() {
        let queue = MessageQueue::default();
        assert_eq!(queue.last_unique_id(), SessionId::INVALID);

        let mut previous = 0u32;
        for _ in 0..1000 {
            let id = queue.unique_id();
            assert!(id.is_valid());
            assert!(id.0 > previous);
            previous = id.0;
        }
        assert_eq!(queue.last_unique_id(), SessionId(previous));
        // last_unique_id does not increment
        assert_eq!(queue.last_unique_id(), SessionId(previous));
    }

    #[rstest]
    fn test_clear() {
        let queue = MessageQueue::default();
        queue.push(SessionId(1), "a", "");
        queue.push(SessionId(2), "b", "");

        queue.clear_id(SessionId(1));
        assert_eq!(queue.front(SessionId(1)), None);
        assert!(queue.front(SessionId(2)).is_some());

        queue.clear();
        assert_eq!(queue.front(SessionId(2)), None);
    }

    #[rstest]
    fn test_pop_on_empty_is_noop() {
        let queue = MessageQueue::default();
        queue.pop(SessionId(1));
        queue.push(SessionId(1), "m", "v");
        queue.pop(SessionId(1));
        queue.pop(SessionId(1));
        assert_eq!(queue.front(SessionId(1)), None);
    }

    #[rstest]
    #[case::one_second(1000)]
    #[case::short(50)]
    fn test_front_within_timeout_bound(#[case] timeout_millis: u64) {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let queue = MessageQueue::default();
            let timeout = Duration::from_millis(timeout_millis);

            let before = Instant::now();
            let result = queue.front_within(SessionId(7), timeout).await;
            let elapsed = before.elapsed();

            assert_eq!(result, None);
            assert!(elapsed >= timeout);
            assert!(elapsed <= timeout + Duration::from_millis(20));
        });
    }

    #[rstest]
    fn test_front_within_unblocked_by_push() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(MessageQueue::default());

            let pusher = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                pusher.push(SessionId(3), "connected", "");
            });

            let result = queue.front_within(SessionId(3), Duration::from_secs(2)).await;
            assert_eq!(result, Some(("connected".to_string(), "".to_string())));
        });
    }

    #[rstest]
    fn test_pop_within() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let queue = MessageQueue::default();
            queue.push(SessionId(1), "selected", "cameraFeed");

            let entry = queue.pop_within(SessionId(1), Duration::from_millis(100)).await;
            assert_eq!(entry, Some(("selected".to_string(), "cameraFeed".to_string())));
            assert_eq!(queue.front(SessionId(1)), None);

            assert_eq!(queue.pop_message_within(SessionId(1), Duration::from_millis(30)).await, "");
        });
    }
}
