mod provision;
mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use provision::{ProvisionReport, provision};
pub use settings::{
    BrokerSettings, LoggingSettings, Settings, SubscriptionDefinition, TopicDefinition,
};

/// Prefix of environment overrides, e.g. `PUBSIM_BROKER__MIN_ACK_DEADLINE_SECS`.
pub const ENV_PREFIX: &str = "PUBSIM";

/// Loads the configuration from `config/default.*` (if present) and
/// environment variables, merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Like [`load_config`] but reads an explicit file, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = partial.merge();

    if settings.broker.min_ack_deadline_secs == 0 {
        return Err(ConfigError::Message(
            "broker.min_ack_deadline_secs must be at least 1".to_string(),
        ));
    }
    Ok(settings)
}
