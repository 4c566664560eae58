//! The `mailbox` module binds one agent identity to a shared broker.
//!
//! A `Mailbox` owns no persisted state: sends and status changes go through
//! the broker, and the handlers it registers are released on `close`.

pub mod agent_mailbox;
pub mod options;

pub use agent_mailbox::Mailbox;
pub use options::SendOptions;

#[cfg(test)]
mod tests;
