use crate::models::Message;
use std::collections::HashSet;

/// Messages of one conversation, unique by id and non-decreasing by
/// `created_at`. Messages sharing a timestamp keep their arrival order.
#[derive(Clone, Debug, Default)]
pub struct MessageSequence {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a message with the same id was already merged.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        // Usually lands at the tail, but delivery order is not trusted.
        let at = self.messages.partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Returns how many of `messages` were new.
    pub fn merge_all<I>(&mut self, messages: I) -> usize where I: IntoIterator<Item = Message> {
        let mut added = 0;
        for message in messages {
            if self.merge(message) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}
