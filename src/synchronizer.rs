use log::{ debug, error, info, warn };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use tokio::sync::{ watch, Mutex as AsyncMutex };
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::backend::Backend;
use crate::error::{ ChatError, Result };
use crate::feed::{ FeedCallback, FeedEvent, FeedSubscription };
use crate::gateway::DispatchGateway;
use crate::models::{ Message, Sender };
use crate::sequence::MessageSequence;
use crate::store::MessageStore;

/// What observers see: the merged sequence and whether the first history read
/// is still outstanding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    pub messages: Vec<Message>,
    pub loading: bool,
}

struct Inner {
    sequence: MessageSequence,
    loading: bool,
    closed: bool,
}

struct Shared {
    conversation_id: String,
    store: Arc<dyn MessageStore>,
    state: Mutex<Inner>,
    publisher: watch::Sender<SyncState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.publisher.send_replace(SyncState {
            messages: inner.sequence.to_vec(),
            loading: inner.loading,
        });
    }

    /// Folds `messages` into the sequence. Returns how many were new.
    fn merge_batch(&self, messages: Vec<Message>) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            debug!("Discarding {} message(s) for closed {}", messages.len(), self.conversation_id);
            return 0;
        }

        let mut added = 0;
        for message in messages {
            if message.conversation_id != self.conversation_id {
                warn!(
                    "Ignoring message {} addressed to {} in {}",
                    message.id,
                    message.conversation_id,
                    self.conversation_id
                );
                continue;
            }
            if inner.sequence.merge(message) {
                added += 1;
            }
        }
        if added > 0 {
            self.publish(&inner);
        }
        added
    }

    fn finish_loading(&self) {
        let mut inner = self.lock();
        if inner.closed || !inner.loading {
            return;
        }
        inner.loading = false;
        self.publish(&inner);
    }

    fn mark_closed(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        if inner.loading {
            inner.loading = false;
            self.publish(&inner);
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    async fn load_history(self: Arc<Self>, initial: bool) {
        match self.store.fetch_history(&self.conversation_id).await {
            Ok(history) => {
                let count = history.len();
                let added = self.merge_batch(history);
                debug!(
                    "History for {}: {} row(s), {} new",
                    self.conversation_id,
                    count,
                    added
                );
            }
            Err(e) => {
                error!("History read for {} failed: {}", self.conversation_id, e);
            }
        }
        if initial {
            self.finish_loading();
        }
    }
}

fn feed_callback(shared: Weak<Shared>) -> FeedCallback {
    Arc::new(move |event| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            FeedEvent::Inserted(message) => {
                shared.merge_batch(vec![message]);
            }
            FeedEvent::Resumed => {
                if shared.is_closed() {
                    return;
                }
                info!("Feed for {} resumed, re-reading history", shared.conversation_id);
                tokio::spawn(shared.load_history(false));
            }
            FeedEvent::Lost(reason) => {
                warn!(
                    "Feed for {} lost ({}); conversation stays at its last state",
                    shared.conversation_id,
                    reason
                );
            }
        }
    })
}

/// Locally consistent, time-ordered view of one conversation.
///
/// History and feed events are merged through the same dedup path. Sends go
/// through the dispatch gateway and become visible only when their row comes
/// back through the feed or a later history read.
pub struct ConversationSynchronizer {
    shared: Arc<Shared>,
    gateway: Arc<dyn DispatchGateway>,
    subscription: AsyncMutex<Option<Box<dyn FeedSubscription>>>,
    history_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationSynchronizer {
    /// Starts the history read and the feed subscription for `conversation_id`.
    ///
    /// A failed subscription is logged and leaves the view fed by history only.
    pub async fn open(conversation_id: &str, backend: &Backend) -> Result<Self> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(ChatError::Validation("conversation id must not be empty".to_string()));
        }

        let (publisher, _) = watch::channel(SyncState { messages: Vec::new(), loading: true });
        let shared = Arc::new(Shared {
            conversation_id: conversation_id.to_string(),
            store: backend.store.clone(),
            state: Mutex::new(Inner {
                sequence: MessageSequence::new(),
                loading: true,
                closed: false,
            }),
            publisher,
        });

        let mut history_tasks = vec![tokio::spawn(shared.clone().load_history(true))];

        let subscription = match
            backend.feed.subscribe(conversation_id, feed_callback(Arc::downgrade(&shared))).await
        {
            Ok(subscription) => {
                // Rows committed between the first read and the join ack reach
                // neither path; read once more now that the feed is live.
                history_tasks.push(tokio::spawn(shared.clone().load_history(false)));
                Some(subscription)
            }
            Err(e) => {
                error!("Change feed for {} unavailable: {}", conversation_id, e);
                None
            }
        };

        info!("Opened conversation {}", conversation_id);
        Ok(Self {
            shared,
            gateway: backend.gateway.clone(),
            subscription: AsyncMutex::new(subscription),
            history_tasks: Mutex::new(history_tasks),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    pub async fn send_as_student(&self, content: &str) -> Result<()> {
        self.send(Sender::Student, content).await
    }

    pub async fn send_as_admin(&self, content: &str) -> Result<()> {
        self.send(Sender::Admin, content).await
    }

    async fn send(&self, sender: Sender, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("message content must not be empty".to_string()));
        }
        if self.shared.is_closed() {
            warn!("Dropping {} send on closed conversation {}", sender, self.conversation_id());
            return Ok(());
        }

        let id = self.conversation_id();
        let result = match sender {
            Sender::Admin => self.gateway.send_admin_reply(id, content).await,
            _ => self.gateway.send_student_message(id, content).await,
        };
        if let Err(e) = &result {
            error!("Sending {} message to {} failed: {}", sender, id, e);
        }
        result
    }

    /// Stops merging and releases the feed. Safe to call any number of times.
    pub async fn close(&self) {
        if self.shared.mark_closed() {
            info!("Closing conversation {}", self.conversation_id());
        }
        self.abort_history_reads();
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
    }

    fn abort_history_reads(&self) {
        let tasks = std::mem::take(
            &mut *self.history_tasks.lock().unwrap_or_else(PoisonError::into_inner)
        );
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().loading
    }

    pub fn snapshot(&self) -> SyncState {
        self.shared.publisher.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().sequence.to_vec()
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.shared.publisher.subscribe()
    }

    pub fn updates(&self) -> WatchStream<SyncState> {
        WatchStream::new(self.watch())
    }

    /// Resolves once the first history read has finished (or the view closed).
    pub async fn wait_loaded(&self) -> SyncState {
        let mut receiver = self.watch();
        let loaded = receiver.wait_for(|state| !state.loading).await.map(|state| state.clone());
        loaded.unwrap_or_else(|_| self.snapshot())
    }
}

impl Drop for ConversationSynchronizer {
    fn drop(&mut self) {
        self.shared.mark_closed();
        self.abort_history_reads();
    }
}
