//! Readiness notification queue.
//!
//! Endpoints own a [`Queue`]; consumers register an [`Entry`] with an
//! interest mask and get their callback invoked when a matching event is
//! signalled. The queue has no notion of time; consumers that need a
//! deadline combine it with a timer (see [`Entry::with_notify`]).

use crate::ilist::{Handle, IndexList};
use bitflags::bitflags;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

bitflags! {
    /// Readiness events, numerically compatible with poll(2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u64 {
        const IN = 0x01;
        const PRI = 0x02;
        const OUT = 0x04;
        const ERR = 0x08;
        const HUP = 0x10;
        const RD_NORM = 0x40;
        const WR_NORM = 0x100;

        const READABLE = Self::IN.bits() | Self::RD_NORM.bits();
        const WRITABLE = Self::OUT.bits() | Self::WR_NORM.bits();
    }
}

/// Invoked with the subset of notified events the entry asked for.
pub trait EntryCallback: Send + Sync {
    fn callback(&self, mask: EventMask);
}

impl<F> EntryCallback for F
where
    F: Fn(EventMask) + Send + Sync,
{
    fn callback(&self, mask: EventMask) {
        self(mask)
    }
}

struct Waiter {
    callback: Arc<dyn EntryCallback>,
    mask: EventMask,
}

/// A consumer's registration. Linked into at most one queue at a time.
pub struct Entry {
    callback: Arc<dyn EntryCallback>,
    link: Option<(u64, Handle)>,
}

impl Entry {
    pub fn new(callback: impl EntryCallback + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
            link: None,
        }
    }

    /// An entry that wakes a tokio [`Notify`]. Awaiting the notify under
    /// `tokio::time::timeout` gives a bounded wait.
    pub fn with_notify() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let entry = Self::new(move |_: EventMask| waker.notify_one());
        (entry, notify)
    }

    pub fn is_registered(&self) -> bool {
        self.link.is_some()
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").field("link", &self.link).finish()
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// List of registered entries.
///
/// Registration takes the write lock; notification walks the list under
/// the read lock. A callback must not register or unregister on the queue
/// that is notifying it.
pub struct Queue {
    id: u64,
    waiters: RwLock<IndexList<Waiter>>,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            waiters: RwLock::new(IndexList::new()),
        }
    }

    /// Link `entry` with interest `mask`. Re-registering on the same queue
    /// replaces the mask.
    pub fn event_register(&self, entry: &mut Entry, mask: EventMask) {
        let mut waiters = self.waiters.write();
        if let Some((queue, handle)) = entry.link {
            debug_assert_eq!(queue, self.id, "entry is registered on another queue");
            if queue == self.id {
                if let Some(w) = waiters.get_mut(handle) {
                    w.mask = mask;
                    return;
                }
            }
        }
        let handle = waiters.push_back(Waiter {
            callback: Arc::clone(&entry.callback),
            mask,
        });
        entry.link = Some((self.id, handle));
    }

    /// Unlink `entry`. Entries registered elsewhere are left alone.
    pub fn event_unregister(&self, entry: &mut Entry) {
        let Some((queue, handle)) = entry.link else {
            return;
        };
        if queue != self.id {
            return;
        }
        self.waiters.write().remove(handle);
        entry.link = None;
    }

    /// Invoke every entry whose interest intersects `mask`.
    pub fn notify(&self, mask: EventMask) {
        let waiters = self.waiters.read();
        for (_, w) in waiters.iter() {
            let hit = w.mask & mask;
            if !hit.is_empty() {
                w.callback.callback(hit);
            }
        }
    }

    /// Union of every registered interest mask.
    pub fn events(&self) -> EventMask {
        self.waiters
            .read()
            .iter()
            .fold(EventMask::empty(), |acc, (_, w)| acc | w.mask)
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.read().is_empty()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("waiters", &self.waiters.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recording_entry() -> (Entry, Arc<Mutex<Vec<EventMask>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let entry = Entry::new(move |m: EventMask| sink.lock().push(m));
        (entry, seen)
    }

    #[test]
    fn test_notify_intersection() {
        let q = Queue::new();
        let (mut e, seen) = recording_entry();
        q.event_register(&mut e, EventMask::READABLE);

        q.notify(EventMask::IN | EventMask::OUT);
        q.notify(EventMask::OUT);

        assert_eq!(*seen.lock(), vec![EventMask::IN]);
    }

    #[test]
    fn test_unregister_stops_callbacks() {
        let q = Queue::new();
        let (mut e, seen) = recording_entry();
        q.event_register(&mut e, EventMask::IN);
        q.event_unregister(&mut e);
        assert!(!e.is_registered());
        assert!(q.is_empty());

        q.notify(EventMask::IN);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_reregister_replaces_mask() {
        let q = Queue::new();
        let (mut e, seen) = recording_entry();
        q.event_register(&mut e, EventMask::IN);
        q.event_register(&mut e, EventMask::OUT);
        assert_eq!(q.events(), EventMask::OUT);

        q.notify(EventMask::IN | EventMask::OUT);
        assert_eq!(*seen.lock(), vec![EventMask::OUT]);
    }

    #[test]
    fn test_events_union() {
        let q = Queue::new();
        let (mut a, _) = recording_entry();
        let (mut b, _) = recording_entry();
        q.event_register(&mut a, EventMask::IN);
        q.event_register(&mut b, EventMask::HUP);
        assert_eq!(q.events(), EventMask::IN | EventMask::HUP);
    }

    #[test]
    fn test_unregister_from_other_queue_is_noop() {
        let q1 = Queue::new();
        let q2 = Queue::new();
        let (mut e, _) = recording_entry();
        q1.event_register(&mut e, EventMask::IN);
        q2.event_unregister(&mut e);
        assert!(e.is_registered());
        assert!(!q1.is_empty());
    }

    #[tokio::test]
    async fn test_notify_entry_wakes_waiter() {
        let q = Arc::new(Queue::new());
        let (mut e, notify) = Entry::with_notify();
        q.event_register(&mut e, EventMask::READABLE);

        let notifier = Arc::clone(&q);
        tokio::spawn(async move {
            notifier.notify(EventMask::IN);
        });

        let woke = tokio::time::timeout(Duration::from_secs(1), notify.notified()).await;
        assert!(woke.is_ok());
    }
}
