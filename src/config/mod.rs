mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    FunctionSettings, GatewaySettings, ObjectStoreSettings, QueueSettings, ServerSettings,
    Settings, TableSettings, TopicSettings,
};

/// Loads configuration from `config/default` and `EVENTPIPE_*` environment
/// variables, merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem. The file is optional.
///
/// Nested keys use a double underscore in the environment:
/// `EVENTPIPE_QUEUE__VISIBILITY_TIMEOUT_SECS=30`.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("EVENTPIPE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
