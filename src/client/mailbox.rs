use std::collections::VecDeque;

use crate::comms::message::Message;
use crate::error::MoosError;

/// A bounded message queue. When full, room is made by dropping the oldest message, and the
///  push reports the overflow for the caller to log.
#[derive(Debug)]
pub struct Mailbox {
    name: &'static str,
    messages: VecDeque<Message>,
    limit: usize,
}

impl Mailbox {
    pub fn new(name: &'static str, limit: usize) -> Mailbox {
        Mailbox {
            name,
            messages: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
    }

    pub fn push_back(&mut self, msg: Message) -> Option<MoosError> {
        let mut dropped = 0;
        while self.messages.len() >= self.limit {
            self.messages.pop_front();
            dropped += 1;
        }
        self.messages.push_back(msg);
        self.overflow(dropped)
    }

    /// newest first, so the oldest message is at the back
    pub fn push_front(&mut self, msg: Message) -> Option<MoosError> {
        let mut dropped = 0;
        while self.messages.len() >= self.limit {
            self.messages.pop_back();
            dropped += 1;
        }
        self.messages.push_front(msg);
        self.overflow(dropped)
    }

    fn overflow(&self, dropped: usize) -> Option<MoosError> {
        if dropped == 0 {
            return None;
        }
        Some(MoosError::MailboxOverflow { mailbox: self.name, dropped })
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.messages.drain(..).collect()
    }

    /// Removes and returns the messages matching `predicate`, keeping the order of both the
    ///  extracted and the remaining messages
    pub fn extract(&mut self, predicate: impl Fn(&Message) -> bool) -> Vec<Message> {
        let (extracted, remaining): (Vec<Message>, Vec<Message>) = self.messages.drain(..)
            .partition(|m| predicate(m));
        self.messages = remaining.into();
        extracted
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}
