mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ExpiryPolicy, LoggingSettings, Settings, StoreBackend, StoreSettings,
};

/// Prefix for environment overrides, e.g. `ECHOFORGE_STORE__BACKEND=durable`.
pub const ENV_PREFIX: &str = "ECHOFORGE";

/// Loads the configuration from `config/default` and environment variables
/// (after reading a `.env` file if one exists), merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config`, reading the optional file at `path` (extension
/// resolved by the `config` crate).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_onto(Settings::default()))
}
