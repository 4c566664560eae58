use serde::Deserialize;

use crate::persistence::sled_store::{DEFAULT_COLLECTION, DEFAULT_DB_NAME};

/// Top-level configuration settings.
///
/// Covers the message store, broker policy and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub store: StoreSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Which persistence backend to attach.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only.
    Transient,
    /// `sled` database on local disk; fails if the location is unusable.
    Durable,
    /// Durable when the data directory is writable, transient otherwise.
    #[default]
    Auto,
}

/// Configuration settings for the message store.
///
/// The durable database lives at `data_dir/db_name`; records go in the
/// `collection` tree.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub data_dir: String,
    pub db_name: String,
    pub collection: String,
}

/// How the broker treats elapsed TTLs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// TTL is metadata only; status never changes because of it.
    #[default]
    Advisory,
    /// Readers move elapsed, unread messages to `EXPIRED` when they load them.
    MarkOnRead,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub expiry_policy: ExpiryPolicy,
    /// TTL applied to messages that do not carry one.
    pub default_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub store: Option<PartialStoreSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub backend: Option<StoreBackend>,
    pub data_dir: Option<String>,
    pub db_name: Option<String>,
    pub collection: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub expiry_policy: Option<ExpiryPolicy>,
    pub default_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Auto,
            data_dir: "data".to_string(),
            db_name: DEFAULT_DB_NAME.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

impl StoreSettings {
    pub fn transient() -> Self {
        Self {
            backend: StoreBackend::Transient,
            ..Self::default()
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            expiry_policy: ExpiryPolicy::Advisory,
            default_ttl_secs: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            broker: BrokerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PartialSettings {
    /// Fill every unset value from `defaults`.
    pub fn merge_onto(self, defaults: Settings) -> Settings {
        let store = self.store;
        let broker = self.broker;
        let logging = self.logging;

        Settings {
            store: StoreSettings {
                backend: store
                    .as_ref()
                    .and_then(|s| s.backend)
                    .unwrap_or(defaults.store.backend),
                data_dir: store
                    .as_ref()
                    .and_then(|s| s.data_dir.clone())
                    .unwrap_or(defaults.store.data_dir),
                db_name: store
                    .as_ref()
                    .and_then(|s| s.db_name.clone())
                    .unwrap_or(defaults.store.db_name),
                collection: store
                    .as_ref()
                    .and_then(|s| s.collection.clone())
                    .unwrap_or(defaults.store.collection),
            },
            broker: BrokerSettings {
                expiry_policy: broker
                    .as_ref()
                    .and_then(|b| b.expiry_policy)
                    .unwrap_or(defaults.broker.expiry_policy),
                default_ttl_secs: broker
                    .as_ref()
                    .and_then(|b| b.default_ttl_secs)
                    .or(defaults.broker.default_ttl_secs),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.logging.level),
            },
        }
    }
}
