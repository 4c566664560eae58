//! Broker engine
//!
//! This module contains the broker responsible for:
//! - maintaining the topic ↔ agent subscription index
//! - holding the channel handler table (identity, topic, topic+identity)
//! - accepting direct sends and broadcasts, assigning ids and status
//! - persisting messages through an optional `MessageStore`
//! - fanning out to channel handlers
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; its routing state sits behind a
//!   single lock that is never held across an `.await` or while a handler
//!   runs. Handlers may therefore call back into the broker.
//! - For one sender and one recipient, handler invocation order equals call
//!   order. Nothing is promised across senders.
//! - TTL is never enforced by a background task. With
//!   `ExpiryPolicy::MarkOnRead` readers expire elapsed messages lazily, and
//!   `expire_stale` runs the same check on demand.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info};

use crate::broker::message::{AgentId, DeliveryOptions, Message, MessageStatus};
use crate::broker::registry::{Channel, Handler, HandlerRegistry, Subscription, dispatch};
use crate::broker::topic::SubscriptionIndex;
use crate::config::{BrokerSettings, ExpiryPolicy, Settings};
use crate::persistence::{self, MessageFilter, MessageStore, MessageUpdate};
use crate::utils::error::{MessagingError, Result};

#[derive(Debug, Default)]
struct BrokerState {
    subscriptions: SubscriptionIndex,
    handlers: HandlerRegistry<Channel>,
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handlers captured for one emission, resolved under the lock and run
/// after it is released.
struct Emission {
    channel: Channel,
    handlers: Vec<Handler>,
}

pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
    store: Option<Arc<dyn MessageStore>>,
    settings: BrokerSettings,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("store", &self.store.as_ref().map(|s| s.kind()))
            .field("settings", &self.settings)
            .finish()
    }
}

impl Broker {
    /// A broker with no store: routing works, status and query calls fail
    /// with `NoStoreAttached`.
    pub fn new() -> Self {
        Self::with_settings(None, BrokerSettings::default())
    }

    pub fn with_store(store: Arc<dyn MessageStore>) -> Self {
        Self::with_settings(Some(store), BrokerSettings::default())
    }

    pub fn with_settings(store: Option<Arc<dyn MessageStore>>, settings: BrokerSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            store,
            settings,
        }
    }

    /// Build a broker and its store from loaded configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store = persistence::open_store(&settings.store)?;
        info!(store = store.kind(), "broker created");
        Ok(Self::with_settings(Some(store), settings.broker.clone()))
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    fn require_store(&self) -> Result<&Arc<dyn MessageStore>> {
        self.store.as_ref().ok_or(MessagingError::NoStoreAttached)
    }

    // ---- subscriptions -------------------------------------------------

    /// Add `agent_id` to `topic`'s subscribers. Returns false if it was
    /// already subscribed.
    pub fn subscribe_topic(&self, agent_id: &str, topic: &str) -> bool {
        let added = self.lock().subscriptions.subscribe(agent_id, topic);
        if added {
            debug!(agent = agent_id, topic, "subscribed");
        }
        added
    }

    /// Remove `agent_id` from `topic`. A second call is a no-op returning
    /// false.
    pub fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> bool {
        let removed = self.lock().subscriptions.unsubscribe(agent_id, topic);
        if removed {
            debug!(agent = agent_id, topic, "unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, agent_id: &str, topic: &str) -> bool {
        self.lock().subscriptions.is_subscribed(agent_id, topic)
    }

    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.lock().subscriptions.subscribers(topic)
    }

    pub fn topics_for(&self, agent_id: &str) -> Vec<String> {
        self.lock().subscriptions.topics_for(agent_id)
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().subscriptions.topics()
    }

    // ---- handler registration -----------------------------------------

    /// Receive every message addressed to `agent_id`.
    pub fn register_message_handler(&self, agent_id: &str, handler: Handler) -> Subscription {
        self.register(Channel::Identity(agent_id.to_string()), handler)
    }

    /// Receive messages on `topic` addressed to `agent_id`, while it is
    /// subscribed.
    pub fn register_topic_handler(&self, agent_id: &str, topic: &str, handler: Handler) -> Subscription {
        self.register(
            Channel::TopicRecipient {
                topic: topic.to_string(),
                agent_id: agent_id.to_string(),
            },
            handler,
        )
    }

    /// Observe every broadcast on `topic`, whoever the recipients are.
    pub fn register_topic_observer(&self, topic: &str, handler: Handler) -> Subscription {
        self.register(Channel::Topic(topic.to_string()), handler)
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    fn register(&self, channel: Channel, handler: Handler) -> Subscription {
        let id = self.lock().handlers.insert(channel.clone(), handler);
        let state = Arc::downgrade(&self.state);

        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                lock_state(&state).handlers.remove(&channel, id);
            }
        })
    }

    // ---- sending -------------------------------------------------------

    /// Accept and route a direct message. Returns the assigned id.
    pub async fn send_message(&self, message: Message, options: DeliveryOptions) -> Result<String> {
        if message.recipient_ids.is_empty() {
            return Err(MessagingError::NoRecipients);
        }

        let mut message = self.accept(message, options);
        self.persist(&message).await?;

        let reachable = reaches_recipient(&self.resolve_emissions(&message, false));
        self.settle(&mut message, reachable).await?;

        // resolved again: registrations cancelled while the store was busy
        // must not fire
        let emissions = self.resolve_emissions(&message, false);

        debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            recipients = message.recipient_ids.len(),
            "direct message accepted"
        );
        emit(&message, emissions);
        Ok(message.id)
    }

    /// Accept and fan out a message to the current subscribers of its topic.
    ///
    /// The recipient set is fixed here; agents subscribing later never see
    /// this message. The record is persisted even with no subscribers.
    pub async fn broadcast_message(&self, message: Message, options: DeliveryOptions) -> Result<String> {
        let topic = match message.topic.as_deref() {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => return Err(MessagingError::InvalidBroadcast),
        };

        let mut message = self.accept(message, options);
        message.recipient_ids = self.subscribers(&topic);
        self.persist(&message).await?;

        let reachable = reaches_recipient(&self.resolve_emissions(&message, true));
        self.settle(&mut message, reachable).await?;

        // resolved again: registrations cancelled while the store was busy
        // must not fire
        let emissions = self.resolve_emissions(&message, true);

        debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            topic = %topic,
            recipients = message.recipient_ids.len(),
            "broadcast accepted"
        );
        emit(&message, emissions);
        Ok(message.id)
    }

    fn accept(&self, mut message: Message, options: DeliveryOptions) -> Message {
        message.delivery_options.merge(options);
        if message.delivery_options.ttl_secs.is_none() {
            message.delivery_options.ttl_secs = self.settings.default_ttl_secs;
        }
        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        let mut seen = HashSet::new();
        message.recipient_ids.retain(|r| seen.insert(r.clone()));
        message.status = MessageStatus::Sent;
        message
    }

    fn store_for(&self, message: &Message) -> Option<&Arc<dyn MessageStore>> {
        self.store
            .as_ref()
            .filter(|_| message.delivery_options.persist)
    }

    async fn persist(&self, message: &Message) -> Result<()> {
        if let Some(store) = self.store_for(message) {
            store.save(message).await?;
        }
        Ok(())
    }

    /// Record `DELIVERED` when any recipient had a handler, `FAILED`
    /// otherwise. Runs before emission so handlers see the settled status.
    async fn settle(&self, message: &mut Message, reachable: bool) -> Result<()> {
        message.status = if reachable {
            MessageStatus::Delivered
        } else {
            MessageStatus::Failed
        };

        if !reachable {
            debug!(message_id = %message.id, "no reachable recipients");
        }

        if let Some(store) = self.store_for(message) {
            store
                .update(&message.id, MessageUpdate::status(message.status))
                .await?;
        }
        Ok(())
    }

    /// Snapshot the handlers for every channel this message reaches, in
    /// emission order: topic observers first (broadcast only), then per
    /// recipient its identity channel followed by its topic channel.
    fn resolve_emissions(&self, message: &Message, broadcast: bool) -> Vec<Emission> {
        let state = self.lock();
        let mut emissions = Vec::new();

        if broadcast {
            if let Some(topic) = &message.topic {
                let channel = Channel::Topic(topic.clone());
                let handlers = state.handlers.handlers(&channel);
                emissions.push(Emission { channel, handlers });
            }
        }

        for recipient in &message.recipient_ids {
            let channel = Channel::Identity(recipient.clone());
            let handlers = state.handlers.handlers(&channel);
            emissions.push(Emission { channel, handlers });

            if let Some(topic) = &message.topic {
                if state.subscriptions.is_subscribed(recipient, topic) {
                    let channel = Channel::TopicRecipient {
                        topic: topic.clone(),
                        agent_id: recipient.clone(),
                    };
                    let handlers = state.handlers.handlers(&channel);
                    emissions.push(Emission { channel, handlers });
                }
            }
        }

        emissions
    }

    // ---- status and queries ----------------------------------------------

    /// Move a stored message to `status`, enforcing the status transitions.
    pub async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<Message> {
        let store = self.require_store()?;
        let current = store
            .get(id)
            .await?
            .ok_or_else(|| MessagingError::NotFound(id.to_string()))?;

        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(MessagingError::InvalidStatusTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let updated = store.update(id, MessageUpdate::status(status)).await?;
        debug!(message_id = id, from = %current.status, to = %status, "status updated");
        Ok(updated)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let store = self.require_store()?;
        let Some(message) = store.get(id).await? else {
            return Ok(None);
        };

        if self.settings.expiry_policy == ExpiryPolicy::MarkOnRead && expirable(&message) {
            let expired = store
                .update(id, MessageUpdate::status(MessageStatus::Expired))
                .await?;
            return Ok(Some(expired));
        }
        Ok(Some(message))
    }

    pub async fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let store = self.require_store()?;
        if self.settings.expiry_policy == ExpiryPolicy::MarkOnRead {
            self.expire_stale().await?;
        }
        store.query(filter).await
    }

    pub async fn count_messages(&self, filter: &MessageFilter) -> Result<usize> {
        self.require_store()?.count(filter).await
    }

    pub async fn delete_message(&self, id: &str) -> Result<()> {
        self.require_store()?.delete(id).await
    }

    /// Move every stored message whose TTL has elapsed and that nobody has
    /// read yet to `EXPIRED`. Returns how many changed.
    pub async fn expire_stale(&self) -> Result<usize> {
        let store = self.require_store()?;
        let candidates = store.query(&MessageFilter::new()).await?;

        let mut expired = 0;
        for message in candidates.into_iter().filter(expirable) {
            store
                .update(&message.id, MessageUpdate::status(MessageStatus::Expired))
                .await?;
            expired += 1;
        }
        if expired > 0 {
            debug!(count = expired, "expired stale messages");
        }
        Ok(expired)
    }
}

fn expirable(message: &Message) -> bool {
    message.status.can_expire() && message.is_expired(Utc::now())
}

/// Whether any recipient-facing channel has a handler. Topic observers do
/// not count as recipients.
fn reaches_recipient(emissions: &[Emission]) -> bool {
    emissions
        .iter()
        .any(|e| !matches!(e.channel, Channel::Topic(_)) && !e.handlers.is_empty())
}

fn emit(message: &Message, emissions: Vec<Emission>) {
    for emission in emissions {
        if !emission.handlers.is_empty() {
            dispatch(&emission.channel, &emission.handlers, message);
        }
    }
}
