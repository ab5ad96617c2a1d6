//! TTL Eviction Queue
//!
//! A hybrid ordered-list + hash-index structure tracking the expiration
//! instant of every cached key. Entries are linked in non-decreasing
//! expiration order (every insertion and touch lands at the tail with
//! `now + ttl`, and the clock is monotonic), so eviction only ever looks at
//! the head, and a single timer, re-armed whenever the head changes, is
//! enough for the whole queue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::queue::entry::{Node, NodeArena, NodeId};

/// Callback invoked once per evicted key, outside the queue lock.
pub type EvictFn = Arc<dyn Fn(&str) + Send + Sync>;

// == Queue Entry ==
/// One live entry, as yielded by [`ExpiryQueue::entries`].
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: String,
    pub expires_at: Instant,
}

// == Queue ==
/// TTL-ordered eviction queue with a single live timer.
///
/// Cheap to clone; clones share the same queue. The eviction callback given
/// at construction is invoked once per expired or explicitly evicted key.
/// All operations are O(1) except [`entries`](Self::entries) and
/// [`clear`](Self::clear).
///
/// # Panics
/// `new` must be called within a tokio runtime; the eviction timer and any
/// callback work are spawned onto it.
#[derive(Clone)]
pub struct ExpiryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

struct QueueInner {
    arena: NodeArena,
    index: HashMap<String, NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    ttl: Duration,
    on_evict: EvictFn,
    runtime: Handle,
    weak_self: Weak<Mutex<QueueInner>>,
    /// The one outstanding timer, always armed for the current head
    timer: Option<JoinHandle<()>>,
    /// Bumped on every cancel so a woken stale timer falls through
    timer_epoch: u64,
    paused: bool,
    destroyed: bool,
}

impl ExpiryQueue {
    // == Constructor ==
    /// Creates an empty queue with a fixed TTL and an eviction callback.
    pub fn new<F>(ttl: Duration, on_evict: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let runtime = Handle::current();
        let inner = Arc::new_cyclic(|weak| {
            Mutex::new(QueueInner {
                arena: NodeArena::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
                ttl,
                on_evict: Arc::new(on_evict),
                runtime,
                weak_self: weak.clone(),
                timer: None,
                timer_epoch: 0,
                paused: false,
                destroyed: false,
            })
        });
        Self { inner }
    }

    // == Append / Touch ==
    /// Inserts `key` at the tail with a fresh `now + ttl` expiration, or
    /// refreshes it in place when it is already the most recent entry.
    ///
    /// An existing key is quiet-deleted first (no eviction callback) and
    /// re-inserted at the tail. The pending timer is cancelled and re-armed
    /// whenever the head, or the head's deadline, changes.
    pub fn append(&self, key: &str) {
        let mut queue = self.inner.lock();
        let deadline = Instant::now() + queue.ttl;
        queue.append_at(key, deadline);
    }

    /// Like [`append`](Self::append) with an explicit expiration instant.
    ///
    /// Used by the disk layer to reconstruct entries from file access times
    /// at startup. Callers must keep supplied deadlines non-decreasing
    /// across calls, the same way `now + ttl` is.
    pub fn append_at(&self, key: &str, deadline: Instant) {
        self.inner.lock().append_at(key, deadline);
    }

    // == Delete ==
    /// Removes `key`, invoking the eviction callback if it was present.
    /// Returns whether the key existed.
    pub fn remove(&self, key: &str) -> bool {
        let (existed, emit, on_evict) = {
            let mut queue = self.inner.lock();
            let (existed, emit) = queue.delete_key(key, true);
            (existed, emit, queue.on_evict.clone())
        };
        if let Some(key) = emit {
            on_evict(&key);
        }
        existed
    }

    /// Removes `key` without invoking the eviction callback. Returns
    /// whether the key existed.
    ///
    /// On the tail this degenerates to the touch optimization: the entry
    /// would re-enter at the slot it already occupies, so only its
    /// expiration is bumped to `now + ttl` and no pointers move.
    pub fn remove_quiet(&self, key: &str) -> bool {
        self.inner.lock().delete_key(key, false).0
    }

    // == Clear ==
    /// Removes every entry, cancels the timer, and invokes the eviction
    /// callback once per key in queue order. Returns the keys in that order.
    pub fn clear(&self) -> Vec<String> {
        let (keys, on_evict) = {
            let mut queue = self.inner.lock();
            (queue.clear_all(), queue.on_evict.clone())
        };
        for key in &keys {
            on_evict(key);
        }
        keys
    }

    // == Entries ==
    /// Lazy head-to-tail iterator over live entries in expiration order.
    ///
    /// Holds the queue lock for its lifetime, so it observes a consistent
    /// snapshot; drop it before mutating the queue from the same thread.
    pub fn entries(&self) -> Entries<'_> {
        let guard = self.inner.lock();
        let cursor = guard.head;
        Entries { guard, cursor }
    }

    // == Timer Control ==
    /// Cancels the pending timer without dropping any entries. Eviction
    /// stays suspended until [`start`](Self::start).
    pub fn stop(&self) {
        let mut queue = self.inner.lock();
        queue.cancel_timer();
        queue.paused = true;
    }

    /// Resumes eviction, re-arming a timer for the current head if one is
    /// missing.
    pub fn start(&self) {
        let mut queue = self.inner.lock();
        queue.paused = false;
        if queue.timer.is_none() {
            queue.arm_timer();
        }
    }

    /// Terminal teardown: cancels the timer and drops all entries and the
    /// index. The queue is not reusable afterwards; operations on a
    /// destroyed queue are warn-logged no-ops.
    pub fn destroy(&self) {
        let mut queue = self.inner.lock();
        queue.cancel_timer();
        queue.arena.clear();
        queue.index.clear();
        queue.head = None;
        queue.tail = None;
        queue.destroyed = true;
    }

    // == Introspection ==
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// The fixed TTL added to "now" on every insertion and touch.
    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    #[cfg(test)]
    pub(crate) fn has_pending_timer(&self) -> bool {
        self.inner.lock().timer.is_some()
    }
}

impl std::fmt::Debug for ExpiryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.inner.lock();
        f.debug_struct("ExpiryQueue")
            .field("len", &queue.index.len())
            .field("ttl", &queue.ttl)
            .field("paused", &queue.paused)
            .field("destroyed", &queue.destroyed)
            .finish()
    }
}

impl QueueInner {
    fn node(&self, id: NodeId) -> &Node {
        self.arena
            .get(id)
            .expect("queue invariant: linked id refers to a live node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena
            .get_mut(id)
            .expect("queue invariant: linked id refers to a live node")
    }

    fn append_at(&mut self, key: &str, deadline: Instant) {
        if self.destroyed {
            warn!(key = %key, "append on a destroyed queue ignored");
            return;
        }
        if let Some(&id) = self.index.get(key) {
            if Some(id) == self.tail {
                // touch: the entry already occupies the slot it would
                // re-enter at, only the deadline moves
                self.node_mut(id).expires_at = deadline;
                if self.head == self.tail {
                    self.arm_timer();
                }
                return;
            }
            let old_head = self.head;
            self.unlink(id);
            if self.head != old_head {
                self.arm_timer();
            }
        }
        let id = self.arena.insert(Node {
            key: key.to_string(),
            expires_at: deadline,
            prev: self.tail,
            next: None,
        });
        self.index.insert(key.to_string(), id);
        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(id);
                self.tail = Some(id);
            }
            None => {
                self.head = Some(id);
                self.tail = Some(id);
                self.arm_timer();
            }
        }
    }

    /// Removes `key` if present. Returns whether it existed and, when
    /// `emit` is set, the key to hand to the eviction callback (which the
    /// caller invokes after releasing the lock).
    fn delete_key(&mut self, key: &str, emit: bool) -> (bool, Option<String>) {
        if self.destroyed {
            return (false, None);
        }
        let Some(&id) = self.index.get(key) else {
            return (false, None);
        };
        if !emit && Some(id) == self.tail {
            // quiet delete of the tail is the touch optimization
            let deadline = Instant::now() + self.ttl;
            self.node_mut(id).expires_at = deadline;
            if self.head == self.tail {
                self.arm_timer();
            }
            return (true, None);
        }
        let old_head = self.head;
        let node = self.unlink(id);
        if self.head != old_head {
            self.arm_timer();
        }
        (true, emit.then_some(node.key))
    }

    /// Head-eviction primitive: unlinks the head, promotes its successor,
    /// and returns the evicted key. `head.is_some()` afterwards tells the
    /// caller whether re-arming is worthwhile.
    fn delete_head(&mut self) -> Option<String> {
        let id = self.head?;
        Some(self.unlink(id).key)
    }

    /// Unlinks a node from between its neighbors, retargeting `head` and
    /// `tail` as needed, and removes it from the index.
    fn unlink(&mut self, id: NodeId) -> Node {
        let node = self
            .arena
            .remove(id)
            .expect("queue invariant: index refers to a live node");
        self.index.remove(&node.key);
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        node
    }

    fn clear_all(&mut self) -> Vec<String> {
        self.cancel_timer();
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = self.node(id);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        self.arena.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        keys
    }

    // == Timer ==
    /// Cancels and replaces the pending timer so it is always armed for the
    /// current head's deadline. Every head-mutating path funnels through
    /// here; no other code arms a timer.
    fn arm_timer(&mut self) {
        self.cancel_timer();
        if self.paused || self.destroyed {
            return;
        }
        let Some(id) = self.head else {
            return;
        };
        let deadline = self.node(id).expires_at;
        let epoch = self.timer_epoch;
        let weak = self.weak_self.clone();
        self.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                fire_timer(&inner, epoch);
            }
        }));
    }

    fn cancel_timer(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // a scheduled wakeup must not outlive the queue
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Timer expiry: evicts the head the timer was armed for (even on a late
/// wakeup), drains every successor already past due, re-arms once for the
/// first live entry, and only then runs the callbacks.
fn fire_timer(inner: &Arc<Mutex<QueueInner>>, epoch: u64) {
    let (evicted, on_evict) = {
        let mut queue = inner.lock();
        if queue.timer_epoch != epoch {
            return;
        }
        queue.timer = None;
        let mut evicted = Vec::new();
        if let Some(key) = queue.delete_head() {
            evicted.push(key);
        }
        let now = Instant::now();
        while let Some(id) = queue.head {
            if queue.node(id).expires_at > now {
                break;
            }
            if let Some(key) = queue.delete_head() {
                evicted.push(key);
            }
        }
        queue.arm_timer();
        (evicted, queue.on_evict.clone())
    };
    for key in &evicted {
        debug!(key = %key, "entry expired");
        on_evict(key);
    }
}

// == Entries Iterator ==
/// Lazy iterator over live entries; see [`ExpiryQueue::entries`].
pub struct Entries<'a> {
    guard: MutexGuard<'a, QueueInner>,
    cursor: Option<NodeId>,
}

impl Iterator for Entries<'_> {
    type Item = QueueEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.guard.node(id);
        self.cursor = node.next;
        Some(QueueEntry {
            key: node.key.clone(),
            expires_at: node.expires_at,
        })
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_queue(ttl: Duration) -> (ExpiryQueue, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let queue = ExpiryQueue::new(ttl, move |key: &str| sink.lock().push(key.to_string()));
        (queue, log)
    }

    fn keys(queue: &ExpiryQueue) -> Vec<String> {
        queue.entries().map(|e| e.key).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_orders_fifo() {
        let (queue, _log) = logging_queue(Duration::from_secs(60));

        queue.append("a");
        queue.append("b");
        queue.append("c");

        assert_eq!(keys(&queue), vec!["a", "b", "c"]);
        let deadlines: Vec<Instant> = queue.entries().map(|e| e.expires_at).collect();
        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_existing_moves_to_tail() {
        let (queue, log) = logging_queue(Duration::from_secs(60));

        queue.append("a");
        queue.append("b");
        queue.append("c");
        queue.append("a");

        assert_eq!(keys(&queue), vec!["b", "c", "a"]);
        // re-insertion is a quiet delete, never an eviction
        assert!(log.lock().is_empty());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_tail_refreshes_in_place() {
        let (queue, log) = logging_queue(Duration::from_secs(10));

        queue.append("a");
        queue.append("b");
        let before = queue.entries().last().unwrap().expires_at;

        tokio::time::sleep(Duration::from_secs(3)).await;
        queue.append("b");

        assert_eq!(keys(&queue), vec!["a", "b"]);
        let after = queue.entries().last().unwrap().expires_at;
        assert!(after > before);
        assert!(log.lock().is_empty());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_emits_callback() {
        let (queue, log) = logging_queue(Duration::from_secs(60));

        queue.append("a");
        queue.append("b");

        assert!(queue.remove("a"));
        assert!(!queue.remove("missing"));
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(keys(&queue), vec!["b"]);
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_quiet_is_silent() {
        let (queue, log) = logging_queue(Duration::from_secs(60));

        queue.append("a");
        queue.append("b");
        queue.append("c");

        assert!(queue.remove_quiet("b"));
        assert_eq!(keys(&queue), vec!["a", "c"]);
        assert!(log.lock().is_empty());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_quiet_tail_is_a_touch() {
        let (queue, log) = logging_queue(Duration::from_secs(10));

        queue.append("a");
        queue.append("b");
        let before = queue.entries().last().unwrap().expires_at;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.remove_quiet("b"));

        // still present, still the tail, deadline bumped
        assert_eq!(keys(&queue), vec!["a", "b"]);
        let after = queue.entries().last().unwrap().expires_at;
        assert!(after > before);
        assert!(log.lock().is_empty());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_head_rearms_for_successor() {
        let (queue, log) = logging_queue(Duration::from_secs(5));

        queue.append("a");
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.append("b");

        assert!(queue.remove("a"));
        assert_eq!(*log.lock(), vec!["a"]);
        assert!(queue.has_pending_timer());

        // b expires 5s after its own append, not at a's deadline
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(queue.is_empty());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_evicts_expired_head() {
        let (queue, log) = logging_queue(Duration::from_secs(1));

        queue.append("a");
        assert!(queue.has_pending_timer());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(queue.is_empty());
        assert_eq!(*log.lock(), vec!["a"]);
        assert!(!queue.has_pending_timer());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_storm_drains_in_order() {
        let (queue, log) = logging_queue(Duration::from_secs(1));

        queue.append("a");
        queue.append("b");
        queue.append("c");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(queue.is_empty());
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_defers_eviction() {
        let (queue, log) = logging_queue(Duration::from_secs(2));

        queue.append("a");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        queue.append("a");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // 3s since the first append, but only 1.5s since the touch
        assert!(log.lock().is_empty());
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*log.lock(), vec!["a"]);
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_returns_keys_in_order() {
        let (queue, log) = logging_queue(Duration::from_secs(60));

        queue.append("a");
        queue.append("b");
        queue.append("c");

        let cleared = queue.clear();

        assert_eq!(cleared, vec!["a", "b", "c"]);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(!queue.has_pending_timer());
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_suspends_eviction_start_resumes() {
        let (queue, log) = logging_queue(Duration::from_secs(1));

        queue.append("a");
        queue.stop();
        assert!(!queue.has_pending_timer());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.len(), 1, "no eviction while stopped");
        assert!(log.lock().is_empty());

        queue.start();
        // the deadline is long past; the re-armed timer fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());
        assert_eq!(*log.lock(), vec!["a"]);
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_terminal() {
        let (queue, log) = logging_queue(Duration::from_secs(1));

        queue.append("a");
        queue.destroy();

        assert!(queue.is_empty());
        assert!(!queue.has_pending_timer());

        queue.append("b");
        assert!(queue.is_empty(), "append after destroy is a no-op");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(log.lock().is_empty(), "destroy emits no callbacks");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_tracks_head() {
        let (queue, _log) = logging_queue(Duration::from_secs(60));

        assert!(!queue.has_pending_timer());
        queue.append("a");
        assert!(queue.has_pending_timer());
        queue.append("b");
        assert!(queue.has_pending_timer());

        queue.remove("a");
        assert!(queue.has_pending_timer());
        queue.remove("b");
        assert!(!queue.has_pending_timer(), "empty queue holds no timer");
        queue.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_reenter_queue() {
        static QUEUE: OnceLock<ExpiryQueue> = OnceLock::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let sink = log.clone();
        let queue = ExpiryQueue::new(Duration::from_secs(1), move |key: &str| {
            sink.lock().push(key.to_string());
            if key == "a" {
                // callbacks run outside the lock, so this must not deadlock
                QUEUE.get().unwrap().append("b");
            }
        });
        QUEUE.set(queue.clone()).ok().unwrap();

        queue.append("a");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(keys(&queue), vec!["b"]);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(*log.lock(), vec!["a", "b"]);
        queue.destroy();
    }
}
