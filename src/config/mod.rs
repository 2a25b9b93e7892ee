mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    ClientSettings, LoggingSettings, PartialSettings, PublisherSettings, ReconnectSettings,
    SessionSettings, Settings,
};

/// Prefix of environment variables that override configuration values,
/// e.g. `SHAREDSUB_CLIENT__BROKER_URL`.
pub const ENV_PREFIX: &str = "SHAREDSUB";

/// Loads the configuration from `config/default` and environment variables.
/// A `.env` file in the working directory is honoured.
/// Missing values are merged from `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` with an explicit configuration file stem.
/// The file is optional; any format understood by `config` is accepted.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    dotenvy::dotenv().ok();

    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge_onto(Settings::default());
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.publisher.max_inflight == 0 {
        return Err(ConfigError::Message(
            "publisher.max_inflight must be at least 1".to_string(),
        ));
    }
    if settings.reconnect.min_backoff_ms > settings.reconnect.max_backoff_ms {
        return Err(ConfigError::Message(
            "reconnect.min_backoff_ms exceeds reconnect.max_backoff_ms".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&settings.reconnect.jitter) {
        return Err(ConfigError::Message(
            "reconnect.jitter must be between 0 and 1".to_string(),
        ));
    }
    match settings.session.backend.as_str() {
        "sled" | "memory" => Ok(()),
        other => Err(ConfigError::Message(format!(
            "unknown session backend '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests;
