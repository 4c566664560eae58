//! Message definitions for the broker
//!
//! `Message` is the canonical record routed by the broker and persisted by
//! the stores. `content` is an opaque JSON value; the broker never looks
//! inside it.
//!
//! Notes on fields:
//! - `id`: opaque unique id; the broker generates a UUID when it is empty
//! - `recipient_ids`: explicit for direct sends, resolved from the live
//!   subscriber set for broadcasts
//! - `created_at`: set once by `Message::new` and never changed afterwards
//! - `status`: advanced by the broker only along `MessageStatus` transitions
//! - `delivery_options`: ttl, priority and the per-message persistence flag

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type AgentId = String;

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Processed,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Expired)
    }

    /// Statuses a lazily evaluated TTL may still move to `Expired`.
    pub fn can_expire(&self) -> bool {
        matches!(self, Self::Pending | Self::Sent | Self::Delivered)
    }

    /// Whether `next` is a legal successor. Re-applying the current status
    /// is always allowed.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (Pending, Sent | Failed | Expired) => true,
            (Sent, Delivered | Read | Processed | Failed | Expired) => true,
            (Delivered, Read | Processed | Expired) => true,
            (Read, Processed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Per-message delivery hints. None of them are enforced by a background
/// process; `ttl_secs` is only evaluated by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// `None` defers to whatever the message already carries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default = "default_persist")]
    pub persist: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_persist() -> bool {
    true
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            priority: None,
            persist: true,
            metadata: Map::new(),
        }
    }
}

impl DeliveryOptions {
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Effective priority; unset means `Normal`.
    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// Skip the attached store for this message; it is still routed.
    pub fn transient(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Overlay `other` onto `self`. Explicit values in `other` win and
    /// metadata maps are merged key by key.
    pub fn merge(&mut self, other: DeliveryOptions) {
        if other.ttl_secs.is_some() {
            self.ttl_secs = other.ttl_secs;
        }
        if other.priority.is_some() {
            self.priority = other.priority;
        }
        if !other.persist {
            self.persist = false;
        }
        self.metadata.extend(other.metadata);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: AgentId,
    #[serde(default)]
    pub recipient_ids: Vec<AgentId>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub delivery_options: DeliveryOptions,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl Message {
    /// A pending message with no id yet; the broker assigns one on accept.
    pub fn new(sender_id: impl Into<AgentId>, content: Value) -> Self {
        Self {
            id: String::new(),
            sender_id: sender_id.into(),
            recipient_ids: Vec::new(),
            topic: None,
            message_type: None,
            content,
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            parent_id: None,
            conversation_id: None,
            delivery_options: DeliveryOptions::default(),
            metadata: None,
        }
    }

    pub fn to<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.recipient_ids = recipients.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.delivery_options = options;
        self
    }

    /// Only meaningful for records loaded from a store or built in tests;
    /// `Message::new` stamps the current time.
    pub fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build a threaded reply addressed to this message's sender.
    ///
    /// The reply joins this message's conversation, or starts one keyed by
    /// this message's id, and inherits its type and topic.
    pub fn reply(&self, sender_id: impl Into<AgentId>, content: Value) -> Message {
        let conversation = self
            .conversation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());

        let mut reply = Message::new(sender_id, content)
            .to([self.sender_id.clone()])
            .reply_to(self.id.clone())
            .in_conversation(conversation);
        reply.message_type = self.message_type.clone();
        reply.topic = self.topic.clone();
        reply
    }

    pub fn is_recipient(&self, agent_id: &str) -> bool {
        self.recipient_ids.iter().any(|r| r == agent_id)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.delivery_options.ttl_secs?;
        let ttl = i64::try_from(ttl).ok()?;
        self.created_at.checked_add_signed(Duration::try_seconds(ttl)?)
    }

    /// TTL is advisory: this only reports, it never changes `status`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}
