//! Supabase adapter for the chat room message backend.
//!
//! Bulk loads and inserts go through PostgREST; live inserts arrive over the Realtime
//! websocket.

mod config;
pub mod realtime;
mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use backend_core::{BackendError, Message, MessageBackend, NewMessage, Subscription};
use tracing::debug;

pub use config::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MESSAGES_TABLE, DEFAULT_REQUEST_TIMEOUT, SupabaseConfig,
    normalize_project_url,
};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Message backend backed by one Supabase project table.
#[derive(Clone)]
pub struct SupabaseBackend {
    config: Arc<SupabaseConfig>,
    rest: rest::PostgrestClient,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Result<Self, BackendError> {
        let rest = rest::PostgrestClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            rest,
        })
    }

    pub fn config(&self) -> &SupabaseConfig {
        &self.config
    }
}

#[async_trait]
impl MessageBackend for SupabaseBackend {
    async fn list_messages(&self) -> Result<Vec<Message>, BackendError> {
        self.rest.list_messages().await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<(), BackendError> {
        self.rest.insert_message(message).await
    }

    async fn subscribe_inserts(&self) -> Result<Subscription, BackendError> {
        let (feed, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(realtime::run_subscription(Arc::clone(&self.config), feed));
        debug!(table = self.config.table(), "opened realtime subscription");
        Ok(subscription.with_task(task))
    }
}
