//! Notification Batching
//!
//! Coalesces state-change callbacks so that many synchronous mutations to
//! the cache produce a single delivery pass to subscribers. Callers wrap a
//! unit of work in [`NotifyScheduler::batch`]; callbacks scheduled inside
//! the batch are queued and flushed once when the outermost batch scope
//! closes, in enqueue order, with repeated notifications for the same
//! observer collapsed to the last one scheduled.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A queued delivery callback.
type NotifyFn = Box<dyn FnOnce() + Send>;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique id for a notification subscriber. Query and
/// mutation observers share the id space so within-batch dedup never
/// conflates two subscribers.
pub(crate) fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

// == Notify Scheduler ==
/// Batching queue for observer notifications.
///
/// Outside of any batch, scheduled callbacks run immediately. The lock is
/// never held while user callbacks execute, so callbacks may freely
/// schedule further notifications or open nested batches.
#[derive(Default)]
pub struct NotifyScheduler {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Nesting depth of open batch scopes
    depth: u32,
    /// Queued callbacks, keyed by observer id for within-batch dedup
    queue: Vec<(u64, NotifyFn)>,
}

impl NotifyScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    // == Batch ==
    /// Runs `f` inside a batch scope; all notifications scheduled during the
    /// scope (including from nested batches) are flushed together when the
    /// outermost scope closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.lock().depth += 1;
        let result = f();
        let flushable = {
            let mut inner = self.inner.lock();
            inner.depth -= 1;
            if inner.depth == 0 {
                std::mem::take(&mut inner.queue)
            } else {
                Vec::new()
            }
        };
        for (_, callback) in flushable {
            callback();
        }
        result
    }

    // == Schedule ==
    /// Schedules a delivery callback for the observer identified by `id`.
    ///
    /// Inside a batch the callback is queued; a later schedule for the same
    /// id replaces the queued callback in place, so the observer is
    /// delivered once, at its original position, with the final state.
    pub fn schedule(&self, id: u64, callback: NotifyFn) {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            drop(inner);
            callback();
            return;
        }
        if let Some(slot) = inner.queue.iter_mut().find(|(qid, _)| *qid == id) {
            slot.1 = callback;
        } else {
            inner.queue.push((id, callback));
        }
    }
}

impl NotifyScheduler {
    /// Number of callbacks currently queued (test introspection).
    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_schedule_outside_batch_runs_immediately() {
        let scheduler = NotifyScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.schedule(1, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_defers_until_scope_closes() {
        let scheduler = NotifyScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        scheduler.batch(|| {
            let c = count.clone();
            scheduler.schedule(1, Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            assert_eq!(count.load(Ordering::SeqCst), 0);
            assert_eq!(scheduler.queued(), 1);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn test_batch_dedups_same_observer_to_final_state() {
        let scheduler = NotifyScheduler::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        scheduler.batch(|| {
            for value in [1, 2, 3] {
                let d = delivered.clone();
                scheduler.schedule(7, Box::new(move || {
                    d.lock().push(value);
                }));
            }
        });

        // One delivery carrying the last scheduled callback
        assert_eq!(*delivered.lock(), vec![3]);
    }

    #[test]
    fn test_batch_preserves_enqueue_order_across_observers() {
        let scheduler = NotifyScheduler::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        scheduler.batch(|| {
            for id in [3u64, 1, 2] {
                let d = delivered.clone();
                scheduler.schedule(id, Box::new(move || {
                    d.lock().push(id);
                }));
            }
            // Re-scheduling id 3 keeps its original position
            let d = delivered.clone();
            scheduler.schedule(3, Box::new(move || {
                d.lock().push(30);
            }));
        });

        assert_eq!(*delivered.lock(), vec![30, 1, 2]);
    }

    #[test]
    fn test_nested_batches_flush_once() {
        let scheduler = NotifyScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        scheduler.batch(|| {
            scheduler.batch(|| {
                let c = count.clone();
                scheduler.schedule(1, Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            });
            // Inner scope closed but outer still open: not yet flushed
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callbacks_may_schedule_more_callbacks() {
        let scheduler = Arc::new(NotifyScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));

        let s = scheduler.clone();
        let c = count.clone();
        scheduler.batch(move || {
            s.schedule(1, {
                let s2 = s.clone();
                let c2 = c.clone();
                Box::new(move || {
                    // Runs post-flush at depth zero, so this fires immediately
                    s2.schedule(2, Box::new(move || {
                        c2.fetch_add(1, Ordering::SeqCst);
                    }));
                })
            });
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_returns_value() {
        let scheduler = NotifyScheduler::new();
        let value = scheduler.batch(|| 42);
        assert_eq!(value, 42);
    }
}
