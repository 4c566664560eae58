//! Durable message store backed by `sled`
//!
//! Records are JSON documents in the tree named after the configured
//! collection, keyed by message id. Temporal fields go to disk as RFC 3339
//! text and come back as `DateTime<Utc>`.
//!
//! Secondary indexes live in sibling trees (`<collection>.by_sender`,
//! `.by_recipient`, `.by_type`, `.by_status`, `.by_conversation`,
//! `.by_created`). Each key is `value \0 created_at \0 id` with a
//! fixed-width timestamp, so a prefix scan yields one value's messages in
//! chronological order. A query with exactly one indexed predicate reads
//! through its index; anything else scans the record tree.
//!
//! The database is opened lazily on first use. `initialize` can also be
//! called up front and is idempotent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::broker::message::Message;
use crate::persistence::{MessageFilter, MessageStore, MessageUpdate};
use crate::utils::error::{MessagingError, Result};

pub const DEFAULT_DB_NAME: &str = "echoforge-messages";
pub const DEFAULT_COLLECTION: &str = "messages";

const SEP: char = '\0';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SledStoreConfig {
    /// Directory holding the sled database.
    pub path: PathBuf,
    /// Name of the record tree; index trees are derived from it.
    pub collection: String,
}

impl SledStoreConfig {
    pub fn new(data_dir: impl AsRef<Path>, db_name: &str, collection: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(db_name),
            collection: collection.to_string(),
        }
    }

    /// Database at `path` with the default collection name.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

impl Default for SledStoreConfig {
    fn default() -> Self {
        Self::new("data", DEFAULT_DB_NAME, DEFAULT_COLLECTION)
    }
}

/// Indexed fields, one tree each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    Sender,
    Recipient,
    Type,
    Status,
    Conversation,
    Created,
}

impl Index {
    const ALL: [Index; 6] = [
        Index::Sender,
        Index::Recipient,
        Index::Type,
        Index::Status,
        Index::Conversation,
        Index::Created,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Index::Sender => "by_sender",
            Index::Recipient => "by_recipient",
            Index::Type => "by_type",
            Index::Status => "by_status",
            Index::Conversation => "by_conversation",
            Index::Created => "by_created",
        }
    }

    /// Index values a message contributes to this index.
    fn values(self, message: &Message) -> Vec<String> {
        match self {
            Index::Sender => vec![message.sender_id.clone()],
            Index::Recipient => message.recipient_ids.clone(),
            Index::Type => message.message_type.iter().cloned().collect(),
            Index::Status => vec![message.status.as_str().to_string()],
            Index::Conversation => message.conversation_id.iter().cloned().collect(),
            Index::Created => vec![String::new()],
        }
    }
}

struct Trees {
    db: Db,
    records: Tree,
    indexes: Vec<(Index, Tree)>,
}

impl Trees {
    fn open(config: &SledStoreConfig) -> Result<Self> {
        let db = sled::open(&config.path).map_err(|e| {
            MessagingError::EnvironmentUnsupported(format!(
                "cannot open message database at {}: {e}",
                config.path.display()
            ))
        })?;

        let records = db.open_tree(&config.collection)?;
        let indexes = Index::ALL
            .iter()
            .map(|index| {
                let name = format!("{}.{}", config.collection, index.suffix());
                db.open_tree(name).map(|tree| (*index, tree))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(path = %config.path.display(), collection = %config.collection, "message database opened");
        Ok(Self {
            db,
            records,
            indexes,
        })
    }

    fn index(&self, index: Index) -> &Tree {
        // `indexes` is built from Index::ALL in order
        &self.indexes[index as usize].1
    }

    fn load(&self, id: &str) -> Result<Option<Message>> {
        match self.records.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, message: &Message) -> Result<()> {
        if let Some(previous) = self.load(&message.id)? {
            self.unindex(&previous)?;
        }
        self.records.insert(message.id.as_bytes(), encode(message)?)?;
        for (index, tree) in &self.indexes {
            for value in index.values(message) {
                tree.insert(index_key(&value, message), message.id.as_bytes())?;
            }
        }
        Ok(())
    }

    fn unindex(&self, message: &Message) -> Result<()> {
        for (index, tree) in &self.indexes {
            for value in index.values(message) {
                tree.remove(index_key(&value, message))?;
            }
        }
        Ok(())
    }

    /// Load the records referenced by an index scan, skipping dangling ids.
    fn resolve<I>(&self, entries: I) -> Result<Vec<Message>>
    where
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        let mut messages = Vec::new();
        for entry in entries {
            let (_, id) = entry?;
            let id = String::from_utf8_lossy(&id);
            if let Some(message) = self.load(&id)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn scan_all(&self) -> Result<Vec<Message>> {
        self.records
            .iter()
            .values()
            .map(|value| {
                let bytes = value?;
                decode(&bytes)
            })
            .collect()
    }

    /// Candidate records for `filter`, narrowed by an index when exactly one
    /// indexed predicate is set.
    fn candidates(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        if filter.predicate_count() != 1 {
            return self.scan_all();
        }

        let by_value = |index: Index, value: &str| {
            let prefix = format!("{value}{SEP}");
            self.resolve(self.index(index).scan_prefix(prefix.as_bytes()))
        };

        if let Some(sender) = &filter.sender_id {
            by_value(Index::Sender, sender)
        } else if let Some(recipient) = &filter.recipient_id {
            by_value(Index::Recipient, recipient)
        } else if let Some(message_type) = &filter.message_type {
            by_value(Index::Type, message_type)
        } else if let Some(status) = &filter.status {
            by_value(Index::Status, status.as_str())
        } else if let Some(conversation) = &filter.conversation_id {
            by_value(Index::Conversation, conversation)
        } else if filter.created_after.is_some() || filter.created_before.is_some() {
            self.by_date(filter.created_after, filter.created_before)
        } else {
            // topic has no index
            self.scan_all()
        }
    }

    fn by_date(&self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
        // created keys are `\0 <timestamp> \0 <id>`
        let lower = match after {
            Some(at) => format!("{SEP}{}", timestamp_key(&at)),
            None => SEP.to_string(),
        };
        let tree = self.index(Index::Created);
        match before {
            Some(at) => {
                let upper = format!("{SEP}{}\u{1}", timestamp_key(&at));
                self.resolve(tree.range(lower.into_bytes()..upper.into_bytes()))
            }
            None => self.resolve(tree.range(lower.into_bytes()..)),
        }
    }
}

/// Durable store. Cheap to construct; nothing touches the disk until the
/// first operation (or an explicit `initialize`).
pub struct SledStore {
    config: SledStoreConfig,
    trees: OnceCell<Trees>,
}

impl SledStore {
    pub fn new(config: SledStoreConfig) -> Self {
        Self {
            config,
            trees: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &SledStoreConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.trees.initialized()
    }

    /// Open the database and its trees. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        self.trees().await.map(|_| ())
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        let trees = self.trees().await?;
        trees.db.flush_async().await?;
        Ok(())
    }

    async fn trees(&self) -> Result<&Trees> {
        self.trees
            .get_or_try_init(|| async { Trees::open(&self.config) })
            .await
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("path", &self.config.path)
            .field("collection", &self.config.collection)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Default for SledStore {
    fn default() -> Self {
        Self::new(SledStoreConfig::default())
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn save(&self, message: &Message) -> Result<()> {
        self.trees().await?.write(message)
    }

    async fn get(&self, id: &str) -> Result<Option<Message>> {
        self.trees().await?.load(id)
    }

    async fn update(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let trees = self.trees().await?;
        let mut message = trees
            .load(id)?
            .ok_or_else(|| MessagingError::NotFound(id.to_string()))?;
        update.apply_to(&mut message);
        trees.write(&message)?;
        Ok(message)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let trees = self.trees().await?;
        let message = trees
            .load(id)?
            .ok_or_else(|| MessagingError::NotFound(id.to_string()))?;
        trees.unindex(&message)?;
        trees.records.remove(id.as_bytes())?;
        Ok(())
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let candidates = self.trees().await?.candidates(filter)?;
        Ok(filter.apply(candidates))
    }

    async fn count(&self, filter: &MessageFilter) -> Result<usize> {
        let candidates = self.trees().await?.candidates(filter)?;
        Ok(candidates.iter().filter(|m| filter.matches(m)).count())
    }

    fn kind(&self) -> &'static str {
        "sled"
    }
}

pub(crate) fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Fixed-width UTC timestamp, so lexical order equals chronological order.
fn timestamp_key(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

fn index_key(value: &str, message: &Message) -> Vec<u8> {
    format!(
        "{value}{SEP}{}{SEP}{}",
        timestamp_key(&message.created_at),
        message.id
    )
    .into_bytes()
}
