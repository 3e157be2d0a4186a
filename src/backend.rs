use log::info;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::{ ChatError, Result };
use crate::feed::{ ChangeFeed, RealtimeConfig, RealtimeFeed };
use crate::gateway::{ DispatchGateway, HttpGateway, LocalGateway };
use crate::store::{ InMemoryStore, MessageStore, RestMessageStore, StoreType };

/// The backend clients one process talks to. Built once and handed to every
/// synchronizer; nothing here is global.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn MessageStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub gateway: Arc<dyn DispatchGateway>,
}

impl Backend {
    pub fn new(
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
        gateway: Arc<dyn DispatchGateway>
    ) -> Self {
        Self { store, feed, gateway }
    }

    /// Store, feed and gateway all backed by the same in-process store.
    pub fn in_memory(store: Arc<InMemoryStore>, admin_authenticated: bool) -> Self {
        let gateway = LocalGateway::new(store.clone(), admin_authenticated);
        Self {
            store: store.clone(),
            feed: store,
            gateway: Arc::new(gateway),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let store_type = args.store_type
            .parse::<StoreType>()
            .map_err(|e| ChatError::Validation(e.to_string()))?;

        match store_type {
            StoreType::Rest => {
                let realtime = RealtimeConfig::from_args(args)?;
                info!("Change feed endpoint: {}", realtime.url);
                Ok(Self {
                    store: Arc::new(RestMessageStore::from_args(args)?),
                    feed: Arc::new(RealtimeFeed::new(realtime)),
                    gateway: Arc::new(HttpGateway::from_args(args)?),
                })
            }
            StoreType::Memory => {
                info!("Using in-process store; nothing outlives this process");
                let admin = args.admin_session
                    .as_deref()
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                Ok(Self::in_memory(Arc::new(InMemoryStore::new()), admin))
            }
        }
    }
}
