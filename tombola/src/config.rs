use serde_derive::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_STORAGE_FILE: &str = "bets.jsonl";

const LOGGING_LEVELS: [&str; 6] = ["trace", "debug", "info", "warning", "error", "critical"];

/// Runtime configuration. Environment variables take precedence over the
/// config file; a key present in neither fails startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub listen_backlog: u16,
    pub number_of_agencies: u16,
    pub logging_level: String,
    pub storage_file: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    /// A required key is absent from both the environment and the config file.
    Missing(&'static str),
    /// A key is present but does not parse into the expected type.
    Invalid(&'static str),
    /// The config file itself could not be read or parsed.
    Format(String),
}

#[derive(Deserialize, Default)]
struct RawConfig {
    port: Option<u16>,
    listen_backlog: Option<u16>,
    number_of_agencies: Option<u16>,
    logging_level: Option<String>,
    storage_file: Option<String>,
}

impl ServerConfig {
    /// Load the configuration. A missing config file is fine as long as the
    /// environment provides every required key.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
        let raw: RawConfig = match path.as_ref().exists() {
            true => serdeconv::from_toml_file(path.as_ref())
                .map_err(|err| ConfigError::Format(err.to_string()))?,
            false => RawConfig::default(),
        };

        let port = required_u16("SERVER_PORT", raw.port)?;
        let listen_backlog = required_u16("SERVER_LISTEN_BACKLOG", raw.listen_backlog)?;

        // The barrier threshold falls back to the backlog, matching the
        // behavior agencies already rely on.
        let number_of_agencies = match optional_u16("NUM_AGENCIES", raw.number_of_agencies)? {
            Some(count) => count,
            None => listen_backlog,
        };

        let logging_level = match env_value("LOGGING_LEVEL").or(raw.logging_level) {
            Some(level) => level.to_lowercase(),
            None => return Err(ConfigError::Missing("LOGGING_LEVEL")),
        };
        if !LOGGING_LEVELS.contains(&logging_level.as_str()) {
            return Err(ConfigError::Invalid("LOGGING_LEVEL"));
        }

        let storage_file = env_value("STORAGE_FILE")
            .or(raw.storage_file)
            .unwrap_or_else(|| DEFAULT_STORAGE_FILE.to_string());

        Ok(ServerConfig {
            port,
            listen_backlog,
            number_of_agencies,
            logging_level,
            storage_file: PathBuf::from(storage_file),
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn required_u16(key: &'static str, fallback: Option<u16>) -> Result<u16, ConfigError> {
    match optional_u16(key, fallback)? {
        Some(value) => Ok(value),
        None => Err(ConfigError::Missing(key)),
    }
}

fn optional_u16(key: &'static str, fallback: Option<u16>) -> Result<Option<u16>, ConfigError> {
    match env_value(key) {
        Some(value) => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key)),
        None => Ok(fallback),
    }
}
