mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{AmqpSettings, LoggingSettings, ServerSettings, Settings};

/// Prefix for environment overrides, e.g. `PERIL_AMQP__URL`.
pub const ENV_PREFIX: &str = "PERIL";

/// Loads the configuration from the default file, a `.env` file and
/// environment variables, merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    // A missing .env is the normal case outside development.
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        amqp: AmqpSettings {
            url: partial
                .amqp
                .as_ref()
                .and_then(|a| a.url.clone())
                .unwrap_or(default.amqp.url),
            prefetch_count: partial
                .amqp
                .as_ref()
                .and_then(|a| a.prefetch_count)
                .unwrap_or(default.amqp.prefetch_count),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
        server: ServerSettings {
            log_file: partial
                .server
                .as_ref()
                .and_then(|s| s.log_file.clone())
                .unwrap_or(default.server.log_file),
        },
    })
}
