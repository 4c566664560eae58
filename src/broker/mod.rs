//! Routing core: the `Broker`, the message contract it routes, the topic
//! subscription index and the channel handler registry.

pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use message::{AgentId, DeliveryOptions, Message, MessageStatus, Priority};
pub use registry::{Channel, Handler, HandlerError, HandlerResult, Subscription, handler};
