use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::{debug, info};

use crate::broker::message::{AgentId, Message, MessageStatus};
use crate::broker::registry::{Handler, HandlerRegistry, Subscription, dispatch, handler};
use crate::broker::Broker;
use crate::mailbox::options::SendOptions;
use crate::persistence::MessageFilter;
use crate::utils::error::{MessagingError, Result};

/// Local dispatch filters over messages arriving on the identity channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LocalChannel {
    All,
    Type(String),
    Conversation(String),
}

impl fmt::Display for LocalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Type(t) => write!(f, "type:{t}"),
            Self::Conversation(c) => write!(f, "conversation:{c}"),
        }
    }
}

type LocalRegistry = Mutex<HandlerRegistry<LocalChannel>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broker-side registration for one topic. `callback` is swapped in place
/// when the topic is subscribed again.
struct TopicBinding {
    subscription: Subscription,
    callback: Arc<Mutex<Option<Handler>>>,
}

#[derive(Default)]
struct MailboxState {
    closed: bool,
    identity: Option<Subscription>,
    topics: HashMap<String, TopicBinding>,
}

/// An agent's view of a shared `Broker`.
///
/// Creating a mailbox registers its identity handler with the broker;
/// `close` (or dropping the mailbox) releases it along with every topic
/// subscription and local handler.
pub struct Mailbox {
    agent_id: AgentId,
    broker: Arc<Broker>,
    local: Arc<LocalRegistry>,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub fn new(agent_id: impl Into<AgentId>, broker: Arc<Broker>) -> Self {
        let agent_id = agent_id.into();
        let local: Arc<LocalRegistry> = Arc::new(Mutex::new(HandlerRegistry::new()));

        let identity = broker.register_message_handler(&agent_id, {
            let local = local.clone();
            let agent_id = agent_id.clone();
            handler(move |message| {
                route_locally(&agent_id, &local, message);
                Ok(())
            })
        });

        info!(agent = %agent_id, "mailbox opened");
        Self {
            agent_id,
            broker,
            local,
            state: Mutex::new(MailboxState {
                closed: false,
                identity: Some(identity),
                topics: HashMap::new(),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MessagingError::MailboxClosed(self.agent_id.clone()));
        }
        Ok(())
    }

    // ---- sending -------------------------------------------------------

    /// Send `content` to every agent in `recipients`.
    pub async fn send_message<I, S>(&self, recipients: I, content: Value, options: SendOptions) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.ensure_open()?;
        let message = Message::new(self.agent_id.clone(), content).to(recipients);
        let (message, delivery) = options.shape(message);
        self.broker.send_message(message, delivery).await
    }

    /// Publish `content` to the current subscribers of `topic`.
    pub async fn broadcast_message(&self, topic: &str, content: Value, options: SendOptions) -> Result<String> {
        self.ensure_open()?;
        let (mut message, delivery) = options.shape(Message::new(self.agent_id.clone(), content));
        message.topic = Some(topic.to_string());
        // resolved by the broker
        message.recipient_ids.clear();
        self.broker.broadcast_message(message, delivery).await
    }

    /// Send a fully built message from this identity. Messages with a topic
    /// and no recipients are broadcast.
    pub async fn send(&self, mut message: Message) -> Result<String> {
        self.ensure_open()?;
        message.sender_id = self.agent_id.clone();
        let delivery = message.delivery_options.clone();
        if message.recipient_ids.is_empty() && message.topic.is_some() {
            self.broker.broadcast_message(message, delivery).await
        } else {
            self.broker.send_message(message, delivery).await
        }
    }

    /// Answer `original` in its thread.
    pub async fn reply(&self, original: &Message, content: Value, options: SendOptions) -> Result<String> {
        self.ensure_open()?;
        let (message, delivery) = options.shape(original.reply(self.agent_id.clone(), content));
        self.broker.send_message(message, delivery).await
    }

    // ---- topics --------------------------------------------------------

    /// Subscribe to `topic`. Only one broker registration is kept per topic;
    /// calling again just swaps the local callback.
    pub fn subscribe_topic(&self, topic: &str, callback: Option<Handler>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MessagingError::MailboxClosed(self.agent_id.clone()));
        }

        if let Some(binding) = state.topics.get(topic) {
            *lock(&binding.callback) = callback;
            debug!(agent = %self.agent_id, topic, "topic callback rebound");
            return Ok(());
        }

        self.broker.subscribe_topic(&self.agent_id, topic);
        let slot = Arc::new(Mutex::new(callback));
        let subscription = self.broker.register_topic_handler(&self.agent_id, topic, {
            let slot = slot.clone();
            handler(move |message| {
                let current = lock(&slot).clone();
                match current {
                    Some(callback) => callback(message),
                    None => Ok(()),
                }
            })
        });

        state.topics.insert(
            topic.to_string(),
            TopicBinding {
                subscription,
                callback: slot,
            },
        );
        Ok(())
    }

    /// Leave `topic`. Returns false when this mailbox was not subscribed.
    pub fn unsubscribe_topic(&self, topic: &str) -> Result<bool> {
        let binding = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(MessagingError::MailboxClosed(self.agent_id.clone()));
            }
            state.topics.remove(topic)
        };

        match binding {
            Some(binding) => {
                binding.subscription.unsubscribe();
                self.broker.unsubscribe_topic(&self.agent_id, topic);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.state).topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    // ---- local handlers ------------------------------------------------

    /// Every message delivered to this agent.
    pub fn on_message(&self, callback: Handler) -> Result<Subscription> {
        self.register_local(LocalChannel::All, callback)
    }

    /// Messages whose `message_type` equals `message_type`.
    pub fn on_message_type(&self, message_type: &str, callback: Handler) -> Result<Subscription> {
        self.register_local(LocalChannel::Type(message_type.to_string()), callback)
    }

    /// Messages belonging to `conversation_id`.
    pub fn on_conversation(&self, conversation_id: &str, callback: Handler) -> Result<Subscription> {
        self.register_local(LocalChannel::Conversation(conversation_id.to_string()), callback)
    }

    fn register_local(&self, channel: LocalChannel, callback: Handler) -> Result<Subscription> {
        self.ensure_open()?;
        let id = lock(&self.local).insert(channel.clone(), callback);
        let local: Weak<LocalRegistry> = Arc::downgrade(&self.local);

        Ok(Subscription::new(move || {
            if let Some(local) = local.upgrade() {
                lock(&local).remove(&channel, id);
            }
        }))
    }

    // ---- store access --------------------------------------------------

    /// Query the store. Without an explicit sender or recipient the query
    /// is scoped to messages addressed to this agent.
    pub async fn query_messages(&self, mut filter: MessageFilter) -> Result<Vec<Message>> {
        self.ensure_open()?;
        if filter.sender_id.is_none() && filter.recipient_id.is_none() {
            filter.recipient_id = Some(self.agent_id.clone());
        }
        self.broker.query_messages(&filter).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.ensure_open()?;
        self.broker.get_message(id).await
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<Message> {
        self.ensure_open()?;
        self.broker
            .update_message_status(id, MessageStatus::Read)
            .await
    }

    pub async fn mark_as_processed(&self, id: &str) -> Result<Message> {
        self.ensure_open()?;
        self.broker
            .update_message_status(id, MessageStatus::Processed)
            .await
    }

    // ---- lifecycle -----------------------------------------------------

    /// Release the identity registration, every topic subscription and all
    /// local handlers. Further calls do nothing.
    pub fn close(&self) {
        let (identity, topics) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            (state.identity.take(), std::mem::take(&mut state.topics))
        };

        if let Some(identity) = identity {
            identity.unsubscribe();
        }
        for (topic, binding) in topics {
            binding.subscription.unsubscribe();
            self.broker.unsubscribe_topic(&self.agent_id, &topic);
        }
        lock(&self.local).clear();

        info!(agent = %self.agent_id, "mailbox closed");
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("agent_id", &self.agent_id)
            .field("closed", &self.is_closed())
            .field("topics", &self.subscribed_topics())
            .finish()
    }
}

/// Re-dispatch an identity-channel message to the matching local handlers:
/// catch-all first, then type, then conversation.
fn route_locally(agent_id: &str, local: &LocalRegistry, message: &Message) {
    let mut groups = Vec::with_capacity(3);
    {
        let registry = lock(local);
        groups.push((LocalChannel::All, registry.handlers(&LocalChannel::All)));
        if let Some(t) = &message.message_type {
            let channel = LocalChannel::Type(t.clone());
            let handlers = registry.handlers(&channel);
            groups.push((channel, handlers));
        }
        if let Some(c) = &message.conversation_id {
            let channel = LocalChannel::Conversation(c.clone());
            let handlers = registry.handlers(&channel);
            groups.push((channel, handlers));
        }
    }

    for (channel, handlers) in groups {
        if !handlers.is_empty() {
            dispatch(&format!("{agent_id}/{channel}"), &handlers, message);
        }
    }
}
