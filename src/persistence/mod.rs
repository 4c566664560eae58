//! The `persistence` module provides mechanisms for storing and querying
//! message records.
//!
//! Two backends sit behind the async `MessageStore` trait:
//! - `MemoryStore`: process-local, lost when the process exits
//! - `SledStore`: durable, backed by an embedded `sled` database
//!
//! Both share `MessageFilter` semantics: predicate filtering, newest-first
//! ordering by `created_at`, then offset/limit pagination.
//!
//! `open_store` picks a backend once, from configuration and a probe of the
//! local filesystem, so call sites never branch on the backend.

pub mod memory_store;
pub mod sled_store;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::broker::message::{DeliveryOptions, Message, MessageStatus};
use crate::config::{StoreBackend, StoreSettings};
use crate::utils::error::{MessagingError, Result};

pub use memory_store::MemoryStore;
pub use sled_store::{SledStore, SledStoreConfig};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or overwrite the record with `message.id`.
    async fn save(&self, message: &Message) -> Result<()>;

    /// Absence is `Ok(None)`, not an error.
    async fn get(&self, id: &str) -> Result<Option<Message>>;

    /// Apply a partial update; fails with `NotFound` for unknown ids.
    async fn update(&self, id: &str, update: MessageUpdate) -> Result<Message>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// Number of matches, ignoring `offset` and `limit`.
    async fn count(&self, filter: &MessageFilter) -> Result<usize>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}

/// Partial update applied by `MessageStore::update`. `id` and `created_at`
/// are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub content: Option<Value>,
    pub recipient_ids: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub delivery_options: Option<DeliveryOptions>,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply_to(self, message: &mut Message) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(recipients) = self.recipient_ids {
            message.recipient_ids = recipients;
        }
        if let Some(metadata) = self.metadata {
            message.metadata = Some(metadata);
        }
        if let Some(options) = self.delivery_options {
            message.delivery_options = options;
        }
    }
}

/// Query predicate plus pagination window. Unset fields match everything;
/// date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub topic: Option<String>,
    pub message_type: Option<String>,
    pub status: Option<MessageStatus>,
    pub conversation_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn for_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn of_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        fn eq(want: &Option<String>, have: Option<&String>) -> bool {
            want.as_ref().is_none_or(|w| have == Some(w))
        }

        eq(&self.sender_id, Some(&message.sender_id))
            && self
                .recipient_id
                .as_deref()
                .is_none_or(|r| message.is_recipient(r))
            && eq(&self.topic, message.topic.as_ref())
            && eq(&self.message_type, message.message_type.as_ref())
            && self.status.is_none_or(|s| s == message.status)
            && eq(&self.conversation_id, message.conversation_id.as_ref())
            && self.created_after.is_none_or(|at| message.created_at >= at)
            && self.created_before.is_none_or(|at| message.created_at <= at)
    }

    /// How many predicates are set, counting the date range as one.
    pub(crate) fn predicate_count(&self) -> usize {
        [
            self.sender_id.is_some(),
            self.recipient_id.is_some(),
            self.topic.is_some(),
            self.message_type.is_some(),
            self.status.is_some(),
            self.conversation_id.is_some(),
            self.created_after.is_some() || self.created_before.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Filter, order newest-first and paginate `candidates`.
    pub(crate) fn apply<I>(&self, candidates: I) -> Vec<Message>
    where
        I: IntoIterator<Item = Message>,
    {
        let mut matched: Vec<Message> = candidates.into_iter().filter(|m| self.matches(m)).collect();
        sort_newest_first(&mut matched);

        let window = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => window.take(limit).collect(),
            None => window.collect(),
        }
    }
}

pub(crate) fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Build the store described by `settings`.
///
/// `Auto` probes the data directory and falls back to the transient store
/// when it cannot be written.
pub fn open_store(settings: &StoreSettings) -> Result<Arc<dyn MessageStore>> {
    let data_dir = Path::new(&settings.data_dir);
    let config = SledStoreConfig::new(data_dir, &settings.db_name, &settings.collection);

    match settings.backend {
        StoreBackend::Transient => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Durable => {
            probe_durable_support(data_dir)?;
            info!(path = %config.path.display(), "using durable message store");
            Ok(Arc::new(SledStore::new(config)))
        }
        StoreBackend::Auto => match probe_durable_support(data_dir) {
            Ok(()) => {
                info!(path = %config.path.display(), "using durable message store");
                Ok(Arc::new(SledStore::new(config)))
            }
            Err(e) => {
                warn!("durable store unavailable, falling back to memory: {e}");
                Ok(Arc::new(MemoryStore::new()))
            }
        },
    }
}

/// Check that `data_dir` exists (or can be created) and accepts writes.
pub fn probe_durable_support(data_dir: &Path) -> Result<()> {
    let unsupported = |e: std::io::Error| {
        MessagingError::EnvironmentUnsupported(format!("{}: {e}", data_dir.display()))
    };

    fs::create_dir_all(data_dir).map_err(unsupported)?;
    let probe = data_dir.join(".echoforge-probe");
    fs::write(&probe, b"ok").map_err(unsupported)?;
    fs::remove_file(&probe).map_err(unsupported)?;
    Ok(())
}
