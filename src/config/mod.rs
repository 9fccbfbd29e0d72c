//! Layered configuration: an optional `config/default.*` file, then
//! `SONDESTREAM_*` environment variables, merged over built-in defaults.
//!
//! Nested keys use a double underscore, e.g.
//! `SONDESTREAM_STREAM__PREFIX=sondes` or
//! `SONDESTREAM_STREAM__TOPICS=T1234567,T7654321`.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    DiscoverySettings, ReconnectSettings, RelaySettings, Settings, StreamSettings,
};

/// Base name of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Loads `config/default.*` (if present) and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Same as [`load_config`] with an explicit file base name. The file is
/// optional; the extension picks the format.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix("SONDESTREAM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("stream.topics")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}
