pub mod http;
pub mod local;

use async_trait::async_trait;
use crate::error::Result;
use crate::models::{ Conversation, StartChatResponse };

pub use http::HttpGateway;
pub use local::LocalGateway;

/// Backend routes for conversation bootstrap and message submission.
///
/// Submissions go through here (not straight to the store) so server-side
/// rules such as escalation run on every message.
#[async_trait]
pub trait DispatchGateway: Send + Sync {
    /// `POST /chat/start`. Failure is fatal to the caller and always surfaced.
    async fn start_conversation(&self) -> Result<StartChatResponse>;

    /// `POST /chat/{id}/message`, as the student.
    async fn send_student_message(&self, conversation_id: &str, content: &str) -> Result<()>;

    /// `POST /admin/chat/{id}/reply`. Fails with `ChatError::Auth` when the
    /// admin credential is missing or rejected.
    async fn send_admin_reply(&self, conversation_id: &str, content: &str) -> Result<()>;

    /// `GET /admin/chats`.
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
}
