//! Handler registry
//!
//! A typed publish/subscribe table: each channel key maps to an ordered list
//! of handlers. Registration hands back a `Subscription` which removes
//! exactly that handler when cancelled, independent of closure identity.
//!
//! The same registry backs the broker (keyed by `Channel`) and each mailbox
//! (keyed by its local filters).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::broker::message::{AgentId, Message};
use crate::utils::error::MessagingError;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// A delivery callback. Errors and panics are contained at the dispatch
/// site and logged.
pub type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a `Handler`.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Broker routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every message addressed to an agent.
    Identity(AgentId),
    /// Every broadcast on a topic, independent of recipient.
    Topic(String),
    /// Messages on a topic for one subscribed agent.
    TopicRecipient { topic: String, agent_id: AgentId },
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity(agent) => write!(f, "agent:{agent}"),
            Self::Topic(topic) => write!(f, "topic:{topic}"),
            Self::TopicRecipient { topic, agent_id } => write!(f, "topic:{topic}:{agent_id}"),
        }
    }
}

pub struct HandlerRegistry<K> {
    next_id: u64,
    channels: HashMap<K, Vec<(u64, Handler)>>,
}

impl<K> fmt::Debug for HandlerRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("next_id", &self.next_id)
            .field("channels", &self.channels.len())
            .field("handlers", &self.channels.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl<K> Default for HandlerRegistry<K> {
    fn default() -> Self {
        Self {
            next_id: 0,
            channels: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> HandlerRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to `key`, returning its registration id.
    pub fn insert(&mut self, key: K, handler: Handler) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.channels.entry(key).or_default().push((id, handler));
        id
    }

    /// Remove one registration. Empty channels are dropped.
    pub fn remove(&mut self, key: &K, id: u64) -> bool {
        let Some(entries) = self.channels.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.channels.remove(key);
        }
        removed
    }

    /// Snapshot of the handlers on `key`, in registration order.
    pub fn handlers(&self, key: &K) -> Vec<Handler> {
        self.channels
            .get(key)
            .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

/// Reversal capability returned by every handler registration.
///
/// Cancelling is idempotent; only the first call has an effect. Dropping a
/// `Subscription` does not cancel it.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Returns true if this call performed the removal.
    pub fn unsubscribe(&self) -> bool {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match cancel {
            Some(cancel) => {
                cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Run `handlers` against `message` in order. A failing or panicking handler
/// is logged and skipped; the rest still run.
pub(crate) fn dispatch(channel: &dyn fmt::Display, handlers: &[Handler], message: &Message) {
    for handler in handlers {
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_reason(payload.as_ref()),
        };
        let err = MessagingError::Handler {
            channel: channel.to_string(),
            reason,
        };
        warn!(message_id = %message.id, "{err}");
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
