pub mod chat;
pub mod realtime;

pub use chat::{
    ChatStatus,
    Conversation,
    ConversationList,
    Followup,
    Message,
    Sender,
    StartChatResponse,
};
