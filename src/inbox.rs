use log::info;
use std::fmt;
use std::str::FromStr;

use crate::backend::Backend;
use crate::error::Result;
use crate::models::{ ChatStatus, Conversation };
use crate::synchronizer::ConversationSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatFilter {
    /// Waiting on staff, or already taken over by staff.
    #[default]
    Pending,
    /// Everything not closed.
    All,
    /// Has at least one call booking.
    CallScheduled,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseChatFilterError {
    message: String,
}

impl fmt::Display for ParseChatFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseChatFilterError {}

impl FromStr for ChatFilter {
    type Err = ParseChatFilterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(ChatFilter::Pending),
            "all" => Ok(ChatFilter::All),
            "call-scheduled" | "calls" => Ok(ChatFilter::CallScheduled),
            _ =>
                Err(ParseChatFilterError {
                    message: format!("Unsupported chat filter: '{}'", s),
                }),
        }
    }
}

impl ChatFilter {
    pub fn matches(&self, chat: &Conversation) -> bool {
        match self {
            ChatFilter::Pending =>
                matches!(chat.status, ChatStatus::AwaitingHuman | ChatStatus::Human),
            ChatFilter::All => chat.status != ChatStatus::Closed,
            ChatFilter::CallScheduled => !chat.followups.is_empty(),
        }
    }

    /// Keeps matching chats, most urgent status first. Equal statuses keep
    /// their incoming order.
    pub fn apply(&self, chats: Vec<Conversation>) -> Vec<Conversation> {
        let mut kept: Vec<Conversation> = chats
            .into_iter()
            .filter(|chat| self.matches(chat))
            .collect();
        kept.sort_by_key(|chat| chat.status.priority());
        kept
    }
}

/// `#` followed by the last five characters of the id.
pub fn short_label(conversation_id: &str) -> String {
    let chars: Vec<char> = conversation_id.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(5)..].iter().collect();
    format!("#{}", tail)
}

pub struct InboxCard {
    pub conversation: Conversation,
    pub sync: ConversationSynchronizer,
}

impl InboxCard {
    pub fn label(&self) -> String {
        short_label(&self.conversation.id)
    }
}

/// Staff view over many chats. Every card owns its own synchronizer; cards
/// share nothing mutable.
pub struct InboxPanel {
    cards: Vec<InboxCard>,
}

impl InboxPanel {
    pub async fn open(backend: &Backend, chats: Vec<Conversation>) -> Result<Self> {
        let mut cards = Vec::with_capacity(chats.len());
        for conversation in chats {
            let sync = ConversationSynchronizer::open(&conversation.id, backend).await?;
            cards.push(InboxCard { conversation, sync });
        }
        info!("Inbox opened with {} card(s)", cards.len());
        Ok(Self { cards })
    }

    /// Lists chats through the gateway, filters them and opens a card for each.
    pub async fn load(backend: &Backend, filter: ChatFilter) -> Result<Self> {
        let chats = backend.gateway.list_conversations().await?;
        Self::open(backend, filter.apply(chats)).await
    }

    pub fn cards(&self) -> &[InboxCard] {
        &self.cards
    }

    pub fn card(&self, conversation_id: &str) -> Option<&InboxCard> {
        self.cards.iter().find(|card| card.conversation.id == conversation_id)
    }

    pub async fn close_all(&self) {
        for card in &self.cards {
            card.sync.close().await;
        }
    }
}
