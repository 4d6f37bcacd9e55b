use tipjar::MasterKey;

use std::{path::PathBuf, str::FromStr, time::Duration};

use bitcoin::Network;

use serde::{de, Deserialize, Deserializer};

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

fn deserialize_loglevel<'de, D>(deserializer: D) -> Result<log::LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_fromstr(deserializer)
}

fn deserialize_masterkey<'de, D>(deserializer: D) -> Result<MasterKey, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(deserializer)?;
    // Don't echo the string back in the error, it's key material.
    MasterKey::from_base58(&string).map_err(|e| de::Error::custom(format!("Master key: {}", e)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

/// Settings for the Bitcoin payment path.
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    /// The network we are operating on, either "bitcoin" or "testnet".
    pub network: Network,
    /// How frequently pending payments are polled against the explorers.
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_poll_interval"
    )]
    pub poll_interval_secs: Duration,
    /// The BIP84 extended private key receive addresses are derived from:
    /// a zprv on mainnet, a vprv on testnet. Provisioned out of band, and
    /// never logged.
    #[serde(deserialize_with = "deserialize_masterkey")]
    pub master_key: MasterKey,
}

/// Static information we require to operate.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_loglevel",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// Settings for the Bitcoin payment path
    pub bitcoin_config: BitcoinConfig,
}

impl Config {
    pub fn new(bitcoin_config: BitcoinConfig, log_level: log::LevelFilter) -> Config {
        Config {
            data_dir: None,
            log_level,
            bitcoin_config,
        }
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(config_folder_path)
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the tipjar configuration folder.
///
/// It's a "Tipjar" directory in the XDG standard configuration directory for
/// all OSes but Linux-based ones, for which it's `~/.tipjar`.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".tipjar");

        #[cfg(not(target_os = "linux"))]
        path.push("Tipjar");

        return Some(path);
    }

    None
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("tipjar.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    ///
    /// We require all settings to be set in the configuration file, and only
    /// in the configuration file. We don't allow to set them via the command
    /// line or environment variables to avoid a futile duplication.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file =
            custom_path.unwrap_or(config_file_path().ok_or(ConfigError::DatadirNotFound)?);

        let config = toml::from_slice::<Config>(&std::fs::read(config_file)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;

        Ok(config)
    }

    /// Make sure the settings are sane.
    pub fn check(&self) -> Result<(), ConfigError> {
        match self.bitcoin_config.network {
            Network::Bitcoin | Network::Testnet => {}
            net => {
                return Err(ConfigError::Unexpected(format!(
                    "Unsupported network '{}'. We only operate on mainnet and testnet.",
                    net
                )));
            }
        }

        // A zprv must come with mainnet, a vprv with testnet.
        if self.bitcoin_config.master_key.network() != self.bitcoin_config.network {
            return Err(ConfigError::Unexpected(format!(
                "Our bitcoin network is {} but the master key is not for this network",
                self.bitcoin_config.network
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The BIP84 reference account key.
    const ZPRV: &str = "zprvAdG4iTXWBoARxkkzNpNh8r6Qag3irQB8PzEMkAFeTRXxHpbF9z4QgEvBRmfvqWvGp42t42nvgGpNgYSJA9iefm1yYNZKEm7z6qUWCroSQnE";

    // Test the format of the configuration file
    #[test]
    fn toml_config() {
        // A valid config
        let toml_str = format!(
            r#"
            data_dir = "/home/tipjar/custom/folder/"
            log_level = "debug"

            [bitcoin_config]
            network = "bitcoin"
            poll_interval_secs = 10
            master_key = "{}"
            "#,
            ZPRV
        );
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        config.check().expect("Valid config");
        assert_eq!(config.bitcoin_config.network, Network::Bitcoin);
        assert_eq!(
            config.bitcoin_config.poll_interval_secs,
            std::time::Duration::from_secs(10)
        );

        // The poll interval and log level have defaults.
        let toml_str = format!(
            r#"
            [bitcoin_config]
            network = "bitcoin"
            master_key = "{}"
            "#,
            ZPRV
        );
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        assert_eq!(config.log_level, log::LevelFilter::Info);
        assert_eq!(
            config.bitcoin_config.poll_interval_secs,
            std::time::Duration::from_secs(10)
        );

        // A mainnet key on testnet must be rejected at the sanity check.
        let toml_str = format!(
            r#"
            [bitcoin_config]
            network = "testnet"
            master_key = "{}"
            "#,
            ZPRV
        );
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        config.check().expect_err("Network mismatch");

        // Exotic networks are refused.
        let toml_str = format!(
            r#"
            [bitcoin_config]
            network = "regtest"
            master_key = "{}"
            "#,
            ZPRV
        );
        let config = toml::from_str::<Config>(&toml_str).expect("Deserializing toml_str");
        config.check().expect_err("Unsupported network");

        // Not enough parameters: missing the master key.
        let toml_str = r#"
            [bitcoin_config]
            network = "bitcoin"
        "#;
        toml::from_str::<Config>(toml_str).expect_err("Deserializing an invalid toml_str");

        // A mangled master key must not deserialize, and the error must not
        // echo the provided string.
        let toml_str = r#"
            [bitcoin_config]
            network = "bitcoin"
            master_key = "zprvDEADBEEF"
        "#;
        let err = toml::from_str::<Config>(toml_str)
            .expect_err("Deserializing an invalid toml_str")
            .to_string();
        assert!(!err.contains("zprvDEADBEEF"));
    }
}
