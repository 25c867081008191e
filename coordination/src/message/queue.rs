//! Priority-ordered delivery.
//!
//! [`MessageQueue`] orders by priority, then by arrival. A [`Mailbox`] wraps
//! one queue per session with async receive; [`MessageRouter`] maps session
//! ids to mailboxes.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::warn;

use super::{Message, Priority};

#[derive(Debug)]
struct Entry {
    seq: u64,
    message: Message,
}

impl Entry {
    fn priority(&self) -> Priority {
        self.message.priority()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue with FIFO order inside each priority tier.
#[derive(Debug, Default)]
pub struct MessageQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { seq, message });
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|e| e.message)
    }

    pub fn peek(&self) -> Option<&Message> {
        self.heap.peek().map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove and return every queued message in delivery order.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(m) = self.pop() {
            out.push(m);
        }
        out
    }

    /// Evict the entry that would be delivered last, if `incoming` outranks
    /// it. Returns whether room was made.
    fn evict_below(&mut self, incoming: Priority) -> bool {
        let Some(lowest) = self.heap.iter().min().map(|e| e.seq) else {
            return false;
        };
        let lowest_priority = self
            .heap
            .iter()
            .find(|e| e.seq == lowest)
            .map(Entry::priority);
        if lowest_priority.is_some_and(|p| p < incoming) {
            self.heap.retain(|e| e.seq != lowest);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct MailboxInner {
    queue: Mutex<MessageQueue>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Bounded per-session inbox with async receive.
///
/// When full, an incoming message displaces the last-to-be-delivered entry
/// only if it has strictly higher priority; otherwise it is dropped.
#[derive(Debug, Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                queue: Mutex::new(MessageQueue::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a message. Returns false if it was dropped.
    pub fn push(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        let (accepted, displaced) = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() < self.inner.capacity {
                queue.push(message);
                (true, false)
            } else if queue.evict_below(message.priority()) {
                queue.push(message);
                (true, true)
            } else {
                (false, false)
            }
        };
        if !accepted || displaced {
            self.inner.dropped.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if accepted {
            self.inner.notify.notify_one();
        }
        accepted
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
    }

    /// Wait for the next message. Returns `None` once the mailbox is closed
    /// and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Every pending message in delivery order.
    pub fn drain(&self) -> Vec<Message> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
    }

    pub fn len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages rejected or displaced because the mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(AtomicOrdering::Relaxed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, AtomicOrdering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::Acquire)
    }
}

/// Session id → mailbox routing table.
#[derive(Debug)]
pub struct MessageRouter {
    mailboxes: RwLock<HashMap<String, Mailbox>>,
    capacity: usize,
}

impl MessageRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Mailbox for a session, created on first subscription.
    pub fn subscribe(&self, session_id: &str) -> Mailbox {
        let mut mailboxes = self.mailboxes.write().unwrap_or_else(|e| e.into_inner());
        mailboxes
            .entry(session_id.to_string())
            .or_insert_with(|| Mailbox::new(self.capacity))
            .clone()
    }

    /// Deliver to the message's session mailbox. Returns false when nobody
    /// is subscribed or the mailbox dropped it.
    pub fn publish(&self, message: &Message) -> bool {
        let mailbox = self
            .mailboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message.session_id())
            .cloned();
        match mailbox {
            Some(mailbox) => {
                let delivered = mailbox.push(message.clone());
                if !delivered {
                    warn!(
                        session_id = %message.session_id(),
                        kind = %message.kind(),
                        "Mailbox full, message dropped"
                    );
                }
                delivered
            }
            None => false,
        }
    }

    /// Close and forget a session's mailbox.
    pub fn remove(&self, session_id: &str) {
        let removed = self
            .mailboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if let Some(mailbox) = removed {
            mailbox.close();
        }
    }

    pub fn len(&self) -> usize {
        self.mailboxes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use serde_json::json;

    fn msg(priority: Priority, n: u32) -> Message {
        Message::new(MessageKind::Coordination, "s1", json!(n)).with_priority(priority)
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = MessageQueue::new();
        q.push(msg(Priority::Low, 1));
        q.push(msg(Priority::Normal, 2));
        q.push(msg(Priority::Urgent, 3));
        q.push(msg(Priority::Normal, 4));
        q.push(msg(Priority::High, 5));
        q.push(msg(Priority::Urgent, 6));

        let order: Vec<u64> = q
            .drain()
            .iter()
            .map(|m| m.payload().as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![3, 6, 5, 2, 4, 1]);
    }

    #[test]
    fn test_full_mailbox_displaces_lower_priority_only() {
        let mailbox = Mailbox::new(2);
        assert!(mailbox.push(msg(Priority::Low, 1)));
        assert!(mailbox.push(msg(Priority::Normal, 2)));
        assert!(!mailbox.push(msg(Priority::Low, 3)));
        assert!(mailbox.push(msg(Priority::Urgent, 4)));
        assert_eq!(mailbox.dropped(), 2);

        let order: Vec<u64> = mailbox
            .drain()
            .iter()
            .map(|m| m.payload().as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![4, 2]);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_ends_on_close() {
        let mailbox = Mailbox::new(8);
        let rx = mailbox.clone();
        let handle = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(m) = rx.recv().await {
                got.push(m.payload().as_u64().unwrap());
            }
            got
        });

        tokio::task::yield_now().await;
        mailbox.push(msg(Priority::Normal, 7));
        mailbox.push(msg(Priority::High, 8));
        tokio::task::yield_now().await;
        mailbox.close();

        let got = handle.await.unwrap();
        assert!(got.contains(&7) && got.contains(&8));
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_router_publish_and_remove() {
        let router = MessageRouter::new(4);
        let unsubscribed = Message::new(MessageKind::Query, "s1", json!("q"));
        assert!(!router.publish(&unsubscribed));

        let mailbox = router.subscribe("s1");
        assert!(router.publish(&unsubscribed));
        assert_eq!(mailbox.len(), 1);

        router.remove("s1");
        assert!(mailbox.is_closed());
        assert!(router.is_empty());
    }
}
