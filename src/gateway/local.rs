use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::error::{ ChatError, Result };
use crate::models::{ ChatStatus, Conversation, Sender, StartChatResponse };
use crate::store::{ InMemoryStore, MessageStore };
use super::DispatchGateway;

pub const DEFAULT_GREETING: &str = "Hi! I'm the admissions assistant. How can I help you today?";

/// Quick reply a student uses to hand the chat over to staff.
pub const STAFF_REQUEST: &str = "I want to chat with an admissions staff";

/// Gateway that applies the backend's submission rules to an in-process store.
pub struct LocalGateway {
    store: Arc<InMemoryStore>,
    greeting: Option<String>,
    admin_authenticated: bool,
}

impl LocalGateway {
    pub fn new(store: Arc<InMemoryStore>, admin_authenticated: bool) -> Self {
        Self {
            store,
            greeting: Some(DEFAULT_GREETING.to_string()),
            admin_authenticated,
        }
    }

    pub fn with_greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting;
        self
    }

    fn require_admin(&self) -> Result<()> {
        if self.admin_authenticated {
            Ok(())
        } else {
            Err(ChatError::Auth("admin session credential is not configured".to_string()))
        }
    }

    fn require_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.store
            .conversation(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }
}

#[async_trait]
impl DispatchGateway for LocalGateway {
    async fn start_conversation(&self) -> Result<StartChatResponse> {
        let conversation = self.store.create_conversation();
        if let Some(greeting) = &self.greeting {
            self.store.insert(&conversation.id, Sender::Bot, greeting).await?;
        }
        info!("Started conversation {}", conversation.id);
        Ok(StartChatResponse {
            chat_id: conversation.id,
            greeting: self.greeting.clone(),
        })
    }

    async fn send_student_message(&self, conversation_id: &str, content: &str) -> Result<()> {
        let conversation = self.require_conversation(conversation_id)?;
        self.store.insert(conversation_id, Sender::Student, content).await?;
        if conversation.status == ChatStatus::Bot && content.trim().eq_ignore_ascii_case(STAFF_REQUEST) {
            info!("Conversation {} handed over to staff", conversation_id);
            self.store.set_status(conversation_id, ChatStatus::AwaitingHuman)?;
        }
        Ok(())
    }

    async fn send_admin_reply(&self, conversation_id: &str, content: &str) -> Result<()> {
        self.require_admin()?;
        self.require_conversation(conversation_id)?;
        self.store.insert(conversation_id, Sender::Admin, content).await?;
        self.store.set_status(conversation_id, ChatStatus::Human)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.require_admin()?;
        Ok(self.store.conversations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_seeds_greeting_unless_disabled() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = LocalGateway::new(store.clone(), false);
        let started = gateway.start_conversation().await.unwrap();
        assert_eq!(started.greeting.as_deref(), Some(DEFAULT_GREETING));
        assert_eq!(store.fetch_history(&started.chat_id).await.unwrap().len(), 1);

        let silent = LocalGateway::new(store.clone(), false).with_greeting(None);
        let started = silent.start_conversation().await.unwrap();
        assert!(started.greeting.is_none());
        assert!(store.fetch_history(&started.chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn staff_request_escalates_and_reply_marks_human() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = LocalGateway::new(store.clone(), true);
        let chat = store.create_conversation();

        gateway.send_student_message(&chat.id, "What are the fees?").await.unwrap();
        assert_eq!(store.conversation(&chat.id).unwrap().status, ChatStatus::Bot);

        gateway.send_student_message(&chat.id, STAFF_REQUEST).await.unwrap();
        assert_eq!(store.conversation(&chat.id).unwrap().status, ChatStatus::AwaitingHuman);

        gateway.send_admin_reply(&chat.id, "Hello, this is Maria").await.unwrap();
        assert_eq!(store.conversation(&chat.id).unwrap().status, ChatStatus::Human);

        gateway.send_student_message(&chat.id, STAFF_REQUEST).await.unwrap();
        assert_eq!(store.conversation(&chat.id).unwrap().status, ChatStatus::Human);
    }

    #[tokio::test]
    async fn admin_routes_need_credential() {
        let store = Arc::new(InMemoryStore::new());
        let chat = store.create_conversation();
        let gateway = LocalGateway::new(store, false);
        assert!(gateway.send_admin_reply(&chat.id, "hi").await.unwrap_err().is_auth());
        assert!(gateway.list_conversations().await.unwrap_err().is_auth());
        let err = gateway.send_student_message("missing", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
