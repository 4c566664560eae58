//! Topic management
//!
//! `SubscriptionIndex` is the bidirectional topic ↔ agent relation owned by
//! the broker. Both directions are updated together so `subscribers(topic)`
//! and `topics_for(agent)` can never disagree. A topic whose last
//! subscriber leaves is removed entirely, as is an agent with no topics.
//!
//! Concurrency note: callers must synchronize access (the broker keeps the
//! index behind its state lock).

use std::collections::{BTreeSet, HashMap};

use crate::broker::message::AgentId;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: BTreeSet<AgentId>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: BTreeSet::new(),
        }
    }

    /// Add a subscriber. Returns false when it was already present.
    pub fn subscribe(&mut self, id: AgentId) -> bool {
        self.subscribers.insert(id)
    }

    /// Remove a subscriber. Returns false when it was not present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: HashMap<String, Topic>,
    agents: HashMap<AgentId, BTreeSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, agent_id: &str, topic: &str) -> bool {
        let added = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(agent_id.to_string());

        self.agents
            .entry(agent_id.to_string())
            .or_default()
            .insert(topic.to_string());

        added
    }

    pub fn unsubscribe(&mut self, agent_id: &str, topic: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(t) => {
                let removed = t.unsubscribe(agent_id);
                if t.subscribers.is_empty() {
                    self.topics.remove(topic);
                }
                removed
            }
            None => false,
        };

        if let Some(topics) = self.agents.get_mut(agent_id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.agents.remove(agent_id);
            }
        }

        removed
    }

    /// Drop every subscription held by `agent_id`, returning the topics it
    /// left.
    pub fn remove_agent(&mut self, agent_id: &str) -> Vec<String> {
        let topics: Vec<String> = self
            .agents
            .remove(agent_id)
            .map(|t| t.into_iter().collect())
            .unwrap_or_default();

        for topic in &topics {
            if let Some(t) = self.topics.get_mut(topic) {
                t.unsubscribe(agent_id);
                if t.subscribers.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }

        topics
    }

    pub fn is_subscribed(&self, agent_id: &str, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.subscribers.contains(agent_id))
    }

    /// Current subscribers of `topic`, in a stable order.
    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics_for(&self, agent_id: &str) -> Vec<String> {
        self.agents
            .get(agent_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }
}
