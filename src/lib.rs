//! # echoforge-messaging
//!
//! In-process messaging between agents: direct sends, topic broadcasts and
//! delivery-status tracking over a shared broker.
//!
//! ## Core Modules
//!
//! - `broker`: the routing authority. Owns the topic subscription index and
//!   the channel handler table, assigns ids and status, persists and fans
//!   out messages.
//! - `mailbox`: a per-agent facade over a shared `Arc<Broker>` with local
//!   catch-all, type and conversation handlers.
//! - `persistence`: the `MessageStore` trait with a transient in-memory
//!   store and a durable `sled` store.
//! - `config`: layered settings from file and environment.
//! - `utils`: the crate error type and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use echoforge_messaging::{Broker, Mailbox, MemoryStore, SendOptions, handler};
//! use serde_json::json;
//!
//! # async fn run() -> echoforge_messaging::Result<()> {
//! let broker = Arc::new(Broker::with_store(Arc::new(MemoryStore::new())));
//! let alice = Mailbox::new("alice", broker.clone());
//! let bob = Mailbox::new("bob", broker.clone());
//!
//! bob.on_message_type("greeting", handler(|msg| {
//!     println!("bob got {}", msg.content);
//!     Ok(())
//! }))?;
//!
//! alice
//!     .send_message(["bob"], json!({"text": "hi"}), SendOptions::new().message_type("greeting"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod mailbox;
pub mod persistence;
pub mod utils;

pub use broker::{
    Broker, Channel, DeliveryOptions, Handler, HandlerResult, Message, MessageStatus, Priority,
    Subscription, handler,
};
pub use mailbox::{Mailbox, SendOptions};
pub use persistence::{
    MemoryStore, MessageFilter, MessageStore, MessageUpdate, SledStore, SledStoreConfig, open_store,
};
pub use utils::error::{MessagingError, Result};

#[cfg(test)]
mod tests;
