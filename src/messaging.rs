//! In-process message bus
//!
//! Delivery is unordered across senders; consumers correlate replies through
//! `in_response_to` rather than arrival order.

use crate::config::MessagingConfig;
use crate::protocol::{Message, MessageType};
use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub delivered: u64,
    pub expired: u64,
    pub overflowed: u64,
}

/// Bounded mailboxes keyed by recipient id
pub struct MessageBus {
    mailboxes: DashMap<String, Mutex<VecDeque<Message>>>,
    responses: Mutex<LruCache<String, Message>>,
    capacity: usize,
    default_ttl_secs: u64,
    delivered: AtomicU64,
    expired: AtomicU64,
    overflowed: AtomicU64,
}

impl MessageBus {
    pub fn new(config: &MessagingConfig) -> Self {
        Self {
            mailboxes: DashMap::new(),
            responses: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.response_capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            capacity: config.mailbox_capacity.max(1),
            default_ttl_secs: config.default_ttl_secs,
            delivered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    /// Creates an empty mailbox so `id` receives broadcasts
    pub fn register(&self, id: &str) {
        self.mailboxes
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
    }

    /// Drops a mailbox and everything queued in it
    pub fn unregister(&self, id: &str) {
        self.mailboxes.remove(id);
    }

    /// Builds a direct message using the bus default TTL
    pub fn compose(
        &self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        content: Value,
    ) -> Message {
        Message::new(sender, recipient, message_type, content).with_ttl(self.default_ttl_secs)
    }

    /// Queues `message` for its recipient, or fans it out when broadcast
    ///
    /// Returns the message id for correlation.
    pub fn send(&self, message: Message) -> String {
        let id = message.id.clone();
        if let Some(original) = message.in_response_to.clone() {
            self.responses.lock().put(original, message.clone());
        }
        if message.is_broadcast() {
            self.fan_out(message);
        } else {
            let recipient = message.recipient.clone();
            self.enqueue(&recipient, message);
        }
        id
    }

    /// Sends `content` to every registered mailbox except the sender's
    pub fn broadcast(&self, sender: &str, content: Value) -> String {
        self.send(Message::broadcast(sender, content).with_ttl(self.default_ttl_secs))
    }

    /// Answers `original`, correlating through `in_response_to`
    pub fn reply(&self, original: &Message, sender: &str, content: Value) -> String {
        let message_type = match original.message_type {
            MessageType::TaskAssignment => MessageType::TaskResult,
            MessageType::Query => MessageType::Response,
            _ => MessageType::Acknowledgment,
        };
        self.send(original.reply(sender, message_type, content))
    }

    /// Latest live reply sent for `message_id`
    pub fn find_response(&self, message_id: &str) -> Option<Message> {
        let mut responses = self.responses.lock();
        let response = responses.get(message_id)?.clone();
        if response.is_expired(Utc::now()) {
            responses.pop(message_id);
            self.expired.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(response)
    }

    /// Replies currently retained for correlation
    pub fn retained_responses(&self) -> usize {
        self.responses.lock().len()
    }

    /// Drains a mailbox, most urgent first, dropping expired messages
    pub fn receive(&self, recipient: &str) -> Vec<Message> {
        let Some(mailbox) = self.mailboxes.get(recipient) else {
            return Vec::new();
        };
        let drained: Vec<Message> = mailbox.lock().drain(..).collect();
        drop(mailbox);

        let now = Utc::now();
        let (mut live, stale): (Vec<Message>, Vec<Message>) =
            drained.into_iter().partition(|m| !m.is_expired(now));
        if !stale.is_empty() {
            debug!(recipient, dropped = stale.len(), "dropped expired messages");
            self.expired.fetch_add(stale.len() as u64, Ordering::Relaxed);
        }
        // stable sort keeps FIFO among equal priorities
        live.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.delivered.fetch_add(live.len() as u64, Ordering::Relaxed);
        live
    }

    /// Messages currently queued for `recipient`
    pub fn pending(&self, recipient: &str) -> usize {
        self.mailboxes
            .get(recipient)
            .map_or(0, |mailbox| mailbox.lock().len())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }

    fn fan_out(&self, message: Message) {
        let recipients: Vec<String> = self
            .mailboxes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| *id != message.sender)
            .collect();
        for recipient in recipients {
            self.enqueue(&recipient, message.clone());
        }
    }

    fn enqueue(&self, recipient: &str, message: Message) {
        let mailbox = self
            .mailboxes
            .entry(recipient.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut queue = mailbox.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            warn!(recipient, "mailbox full, dropped oldest message");
        }
        queue.push_back(message);
    }
}
