//! Bounded queues between a producer and a consumer on different handlers
//!
//! Consumers never poll. They register a dequeue callback, and the queue
//! posts a single "ready" notification onto the consumer's handler while
//! items are pending. If items remain after the callback runs, the next
//! notification is posted.

use super::handler::Handler;
use log::warn;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Invoked on the consumer's handler when items are ready
pub type DequeueCallback = Rc<dyn Fn()>;

struct QueueInner<T> {
    name: String,
    items: VecDeque<T>,
    capacity: usize,
    listener: Option<(Handler, DequeueCallback)>,
    notify_pending: bool,
    dropped: usize,
}

/// Single-direction bounded FIFO.
///
/// Past capacity the oldest item is dropped and the drop is logged as
/// congestion.
pub struct Queue<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Queue<T> {
    pub fn new(name: &str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                name: name.to_string(),
                items: VecDeque::new(),
                capacity,
                listener: None,
                notify_pending: false,
                dropped: 0,
            })),
        }
    }

    /// Append an item. Returns false when an older item had to be dropped.
    pub fn enqueue(&self, item: T) -> bool {
        let kept_all = {
            let mut inner = self.inner.borrow_mut();
            inner.items.push_back(item);
            if inner.items.len() > inner.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                warn!(
                    "{}: congestion, dropped oldest item (capacity {}, {} dropped so far)",
                    inner.name, inner.capacity, inner.dropped
                );
                false
            } else {
                true
            }
        };
        self.schedule_notify();
        kept_all
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.borrow_mut().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Drop every queued item matching `predicate`, returning how many went
    pub fn purge<P: FnMut(&T) -> bool>(&self, mut predicate: P) -> usize {
        let mut inner = self.inner.borrow_mut();
        let before = inner.items.len();
        inner.items.retain(|item| !predicate(item));
        before - inner.items.len()
    }

    /// Items discarded because of congestion
    pub fn dropped_count(&self) -> usize {
        self.inner.borrow().dropped
    }

    /// Start receiving ready notifications on `handler`.
    ///
    /// Panics if a callback is already registered.
    pub fn register_dequeue(&self, handler: &Handler, callback: DequeueCallback) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.listener.is_none(),
                "{}: dequeue registered twice",
                inner.name
            );
            inner.listener = Some((handler.clone(), callback));
        }
        self.schedule_notify();
    }

    pub fn unregister_dequeue(&self) {
        self.inner.borrow_mut().listener = None;
    }

    pub fn is_dequeue_registered(&self) -> bool {
        self.inner.borrow().listener.is_some()
    }

    fn schedule_notify(&self) {
        let handler = {
            let mut inner = self.inner.borrow_mut();
            if inner.notify_pending || inner.items.is_empty() {
                return;
            }
            let handler = match &inner.listener {
                Some((handler, _)) => handler.clone(),
                None => return,
            };
            inner.notify_pending = true;
            handler
        };
        let weak = Rc::downgrade(&self.inner);
        handler.post(move || Self::deliver(weak));
    }

    fn deliver(weak: Weak<RefCell<QueueInner<T>>>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let callback = {
            let mut state = inner.borrow_mut();
            state.notify_pending = false;
            if state.items.is_empty() {
                return;
            }
            match &state.listener {
                Some((_, callback)) => callback.clone(),
                None => return,
            }
        };
        callback();
        Queue { inner }.schedule_notify();
    }
}

/// A pair of queues, one per direction
pub struct BidiQueue<T> {
    up: Queue<T>,
    down: Queue<T>,
}

impl<T: 'static> BidiQueue<T> {
    /// `up_capacity` bounds items travelling towards the upper end,
    /// `down_capacity` the ones travelling down.
    pub fn new(name: &str, up_capacity: usize, down_capacity: usize) -> Self {
        Self {
            up: Queue::new(&format!("{name}/up"), up_capacity),
            down: Queue::new(&format!("{name}/down"), down_capacity),
        }
    }

    /// End used by the upper layer: sends down, receives up
    pub fn up_end(&self) -> BidiQueueEnd<T> {
        BidiQueueEnd {
            tx: self.down.clone(),
            rx: self.up.clone(),
        }
    }

    /// End used by the lower layer: sends up, receives down
    pub fn down_end(&self) -> BidiQueueEnd<T> {
        BidiQueueEnd {
            tx: self.up.clone(),
            rx: self.down.clone(),
        }
    }
}

/// One side of a [`BidiQueue`]
pub struct BidiQueueEnd<T> {
    tx: Queue<T>,
    rx: Queue<T>,
}

impl<T> Clone for BidiQueueEnd<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: 'static> BidiQueueEnd<T> {
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.enqueue(item)
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.rx.try_dequeue()
    }

    pub fn register_dequeue(&self, handler: &Handler, callback: DequeueCallback) {
        self.rx.register_dequeue(handler, callback);
    }

    pub fn unregister_dequeue(&self) {
        self.rx.unregister_dequeue();
    }

    pub fn is_dequeue_registered(&self) -> bool {
        self.rx.is_dequeue_registered()
    }

    /// Items waiting to be dequeued on this end
    pub fn pending_inbound(&self) -> usize {
        self.rx.len()
    }

    /// Items sent from this end that the other side has not taken yet
    pub fn pending_outbound(&self) -> usize {
        self.tx.len()
    }

    pub fn outbound(&self) -> &Queue<T> {
        &self.tx
    }

    pub fn inbound(&self) -> &Queue<T> {
        &self.rx
    }
}
