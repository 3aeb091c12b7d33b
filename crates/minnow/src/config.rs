use serde::{Deserialize, Deserializer};

use std::fs;
use std::path::{Path, PathBuf};

use libminnow_wire as wire;

#[derive(Clone, Deserialize)]
pub(crate) struct Server {
    /// Address of the server
    pub(crate) host: String,

    /// Port of the server
    pub(crate) port: u16,

    /// Use TLS
    #[serde(default)]
    pub(crate) tls: bool,

    /// Nick to register with
    #[serde(deserialize_with = "deser_trimmed_str")]
    pub(crate) nick: String,

    /// User name to be used in connection registration.
    /// If it is not specified, the nick will be used instead.
    #[serde(default)]
    pub(crate) username: Option<String>,

    /// Real name to be used in connection registration
    #[serde(deserialize_with = "deser_trimmed_str")]
    pub(crate) realname: String,

    /// Server password (optional). Its presence makes the client advertise SASL on connect.
    #[serde(default)]
    pub(crate) pass: Option<String>,

    /// Channels to automatically join.
    #[serde(default)]
    pub(crate) join: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) servers: Vec<Server>,
    #[serde(default)]
    pub(crate) log_dir: Option<PathBuf>,
}

impl Config {
    /// Errors that would make a connection attempt pointless, collected so the user can fix them
    /// all at once.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.servers.is_empty() {
            errors.push("at least one server must be configured".to_string());
        }

        for server in &self.servers {
            if server.host.is_empty() {
                errors.push("server host can't be empty".to_string());
            }
            if server.port == 0 {
                errors.push(format!("invalid port for {}", server.host));
            }
            if !wire::is_nick(&server.nick) {
                errors.push(format!(
                    "invalid nick for {}: {:?}",
                    server.host, server.nick
                ));
            }
            for chan in &server.join {
                if !wire::is_chan(chan) {
                    errors.push(format!(
                        "invalid channel name for {}: {:?}",
                        server.host, chan
                    ));
                }
            }
        }

        errors
    }
}

fn deser_trimmed_str<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let str = String::deserialize(d)?;
    Ok(str.trim().to_owned())
}

pub(crate) fn get_config_path() -> PathBuf {
    let mut config_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_path.push("minnow");
    config_path.push("config.yml");
    config_path
}

pub(crate) fn parse_config(config_path: &Path) -> Result<Config, String> {
    let contents = fs::read_to_string(config_path).map_err(|err| err.to_string())?;
    serde_yaml::from_str(&contents).map_err(|err| err.to_string())
}

const DEFAULT_CONFIG: &str = "\
# Servers to connect on startup.
servers:
    - host: irc.libera.chat
      port: 6697
      tls: true
      nick: minnow_user
      realname: minnow user
      join:
          - '#minnow'

# Where to put the debug log file. No log file is written when this is missing.
# log_dir: '/tmp'
";

pub(crate) fn generate_default_config(config_path: &Path) {
    if let Some(parent) = config_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match fs::write(config_path, DEFAULT_CONFIG) {
        Ok(()) => {
            println!(
                "Created a default config file at {}. Edit it and start again.",
                config_path.display()
            );
        }
        Err(err) => {
            println!(
                "Can't write default config to {}: {}",
                config_path.display(),
                err
            );
        }
    }
}
