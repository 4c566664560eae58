use serde_json::Value;

use crate::broker::message::{DeliveryOptions, Message, Priority};

/// Per-call options for `Mailbox::send_message` and
/// `Mailbox::broadcast_message`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub message_type: Option<String>,
    pub topic: Option<String>,
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
    pub metadata: Vec<(String, Value)>,
    pub delivery: DeliveryOptions,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Tag a direct message with a topic so subscribed recipients also get
    /// it on their topic channel.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.delivery.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.delivery.priority = Some(priority);
        self
    }

    pub fn transient(mut self) -> Self {
        self.delivery.persist = false;
        self
    }

    /// Copy the message-shaping fields onto `message`, returning the
    /// delivery options for the broker call.
    pub(crate) fn shape(self, mut message: Message) -> (Message, DeliveryOptions) {
        if let Some(message_type) = self.message_type {
            message.message_type = Some(message_type);
        }
        if let Some(topic) = self.topic {
            message.topic = Some(topic);
        }
        if let Some(conversation_id) = self.conversation_id {
            message.conversation_id = Some(conversation_id);
        }
        if let Some(parent_id) = self.parent_id {
            message.parent_id = Some(parent_id);
        }
        for (key, value) in self.metadata {
            message = message.with_metadata(key, value);
        }
        (message, self.delivery)
    }
}
