pub mod websocket;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use crate::error::Result;
use crate::models::Message;

pub use websocket::{ RealtimeConfig, RealtimeFeed };

#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// A committed insert addressed to the subscribed conversation.
    Inserted(Message),
    /// The channel was re-established after a drop; inserts committed in
    /// between may not have been delivered.
    Resumed,
    /// The channel dropped for good. Nothing more will be delivered.
    Lost(String),
}

pub type FeedCallback = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// Push channel of "row inserted" events, one subscription per conversation.
///
/// Delivery is at-least-once with no ordering relative to other paths.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        conversation_id: &str,
        on_event: FeedCallback
    ) -> Result<Box<dyn FeedSubscription>>;
}

#[async_trait]
pub trait FeedSubscription: Send + Sync {
    /// Stops callbacks and releases the transport. Idempotent, never fails.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn disabled_policy_keeps_defaults() {
        let policy = ReconnectPolicy::disabled();
        assert!(!policy.enabled);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
    }
}
