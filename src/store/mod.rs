pub mod memory;
pub mod rest;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use crate::error::Result;
use crate::models::{ Followup, Message, Sender };

pub use memory::InMemoryStore;
pub use rest::RestMessageStore;

/// Direct access to the durable message table.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages of a conversation, ascending by `created_at`. A
    /// conversation without messages yields an empty vector, not an error.
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// The store assigns `id` and `created_at`.
    async fn insert(&self, conversation_id: &str, sender: Sender, content: &str) -> Result<Message>;

    async fn insert_followup(&self, conversation_id: &str, followup: &Followup) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Rest,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreTypeError {
    message: String,
}

impl fmt::Display for ParseStoreTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseStoreTypeError {}

impl FromStr for StoreType {
    type Err = ParseStoreTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rest" => Ok(StoreType::Rest),
            "memory" => Ok(StoreType::Memory),
            _ =>
                Err(ParseStoreTypeError {
                    message: format!("Unsupported store type: '{}'", s),
                }),
        }
    }
}
