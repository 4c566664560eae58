//! Transient message store
//!
//! Records live in a `HashMap` behind an `RwLock` and vanish with the
//! process. Every operation completes without suspending, but is exposed
//! through the same async contract as the durable store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::persistence::{MessageFilter, MessageStore, MessageUpdate};
use crate::utils::error::{MessagingError, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<String, Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Message>> {
        self.messages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Message>> {
        self.messages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<()> {
        self.write().insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.read().get(id).cloned())
    }

    async fn update(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let mut messages = self.write();
        let message = messages
            .get_mut(id)
            .ok_or_else(|| MessagingError::NotFound(id.to_string()))?;
        update.apply_to(message);
        Ok(message.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MessagingError::NotFound(id.to_string()))
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let messages = self.read();
        Ok(filter.apply(messages.values().cloned()))
    }

    async fn count(&self, filter: &MessageFilter) -> Result<usize> {
        Ok(self.read().values().filter(|m| filter.matches(m)).count())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
