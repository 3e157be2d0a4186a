use async_trait::async_trait;
use chrono::{ DateTime, Duration as ChronoDuration, Utc };
use log::{ debug, warn };
use std::collections::HashMap;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use tokio::sync::broadcast::{ self, error::RecvError };
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ ChatError, Result };
use crate::feed::{ ChangeFeed, FeedCallback, FeedEvent, FeedSubscription };
use crate::models::{ ChatStatus, Conversation, Followup, Message, Sender };
use super::MessageStore;

const EVENT_CAPACITY: usize = 1024;

struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, ConversationRecord>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Store clock: wall time, bumped so no two rows share a timestamp.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Process-local store that also acts as the change feed for its own inserts.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<Message>,
    fail_history: AtomicBool,
    feed_muted: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            fail_history: AtomicBool::new(false),
            feed_muted: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_conversation(&self) -> Conversation {
        let mut state = self.lock();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            created_at: state.next_timestamp(),
            status: ChatStatus::Bot,
            followups: Vec::new(),
        };
        state.conversations.insert(conversation.id.clone(), ConversationRecord {
            conversation: conversation.clone(),
            messages: Vec::new(),
        });
        conversation
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock()
            .conversations.get(conversation_id)
            .map(|record| record.conversation.clone())
    }

    /// Every conversation, oldest first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self
            .lock()
            .conversations.values()
            .map(|record| record.conversation.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn set_status(&self, conversation_id: &str, status: ChatStatus) -> Result<()> {
        let mut state = self.lock();
        let record = state.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        record.conversation.status = status;
        Ok(())
    }

    /// Makes every following history read fail with a transport error.
    pub fn set_history_failure(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// While muted, inserts still commit but no feed event is published.
    pub fn set_feed_muted(&self, muted: bool) {
        self.feed_muted.store(muted, Ordering::SeqCst);
    }

    /// Pushes `message` to subscribers as if the store had emitted it again.
    pub fn publish(&self, message: Message) {
        if self.events.send(message).is_err() {
            debug!("No feed subscribers for published message");
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("history read failed".to_string()));
        }
        Ok(
            self
                .lock()
                .conversations.get(conversation_id)
                .map(|record| record.messages.clone())
                .unwrap_or_default()
        )
    }

    async fn insert(&self, conversation_id: &str, sender: Sender, content: &str) -> Result<Message> {
        let message = {
            let mut state = self.lock();
            let created_at = state.next_timestamp();
            let record = state.conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender,
                content: content.to_string(),
                created_at,
            };
            record.messages.push(message.clone());
            message
        };
        if !self.feed_muted.load(Ordering::SeqCst) {
            self.publish(message.clone());
        }
        Ok(message)
    }

    async fn insert_followup(&self, conversation_id: &str, followup: &Followup) -> Result<()> {
        let mut state = self.lock();
        let record = state.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        record.conversation.followups.push(followup.clone());
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryStore {
    async fn subscribe(
        &self,
        conversation_id: &str,
        on_event: FeedCallback
    ) -> Result<Box<dyn FeedSubscription>> {
        // Registered before returning so no insert after subscribe is missed.
        let mut receiver = self.events.subscribe();
        let closed = Arc::new(AtomicBool::new(false));
        let task_closed = closed.clone();
        let conversation_id = conversation_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(message) if message.conversation_id == conversation_id => {
                        FeedEvent::Inserted(message)
                    }
                    Ok(_) => {
                        continue;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Feed for {} lagged, {} events skipped", conversation_id, skipped);
                        FeedEvent::Resumed
                    }
                    Err(RecvError::Closed) => {
                        if !task_closed.load(Ordering::SeqCst) {
                            on_event(FeedEvent::Lost("store dropped".to_string()));
                        }
                        break;
                    }
                };
                if task_closed.load(Ordering::SeqCst) {
                    break;
                }
                on_event(event);
            }
        });

        Ok(Box::new(MemorySubscription {
            closed,
            task: Mutex::new(Some(task)),
        }))
    }
}

struct MemorySubscription {
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySubscription {
    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl FeedSubscription for MemorySubscription {
    async fn close(&self) {
        self.stop();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
