use std::{collections::HashMap, path::PathBuf};

use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment, Provider,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::level_filters::LevelFilter;

mod validate;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Trace,
}

/// Transforms our custom `LogLevel` enum into a `tracing::level_filters::LevelFilter`
/// enum used by the `tracing` crate.
impl From<&LogLevel> for LevelFilter {
    fn from(val: &LogLevel) -> Self {
        match val {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Engine object families the housekeeper may prune.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PruneKind {
    Network,
    Image,
    Container,
}

/// The main configuration struct.
/// A YAML configuration file, environment variables (prefixed with `PDGATE_`)
/// and command-line flags are merged into this struct, in that order.
///
/// ```yaml
/// # Example configuration file
/// listen: "0.0.0.0:80"
/// refresh_time: 10000
/// docker_addr: "tcp://10.0.0.5:2376"
/// docker_cert: "/etc/pdgate/certs"
/// docker_host: "10.0.0.5"
/// host_suffix: ".example"
/// host_self: "gateway.example"
/// trigger_added: "/etc/pdgate/on-added.sh"
/// docker_clear_delay: 30
/// docker_clear_exc:
///   - "^/keep-"
/// ```
#[derive(Debug, Serialize, Deserialize, Parser)]
#[command(name = "pdgate")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The address the gateway accepts HTTP traffic on.
    #[clap(long, default_value = "0.0.0.0:80")]
    pub listen: String,

    /// Interval between discovery/reconciliation passes, in milliseconds.
    #[clap(long, default_value = "10000")]
    pub refresh_time: u64,

    /// Shell used to run the finder and trigger scripts.
    #[clap(long, default_value = "bash")]
    pub trigger_bash: String,

    /// Script printing `key=value` overrides for the engine connection
    /// (`docker_cert`, `docker_addr`, `docker_host`).
    #[clap(long)]
    pub trigger_finder: Option<PathBuf>,

    /// Script invoked once per added HTTP virtual host.
    #[clap(long)]
    pub trigger_added: Option<PathBuf>,

    /// Script invoked once per removed HTTP virtual host.
    #[clap(long)]
    pub trigger_removed: Option<PathBuf>,

    /// Script invoked once per updated HTTP virtual host.
    #[clap(long)]
    pub trigger_updated: Option<PathBuf>,

    /// Directory holding `ca.pem`, `cert.pem` and `key.pem` for the engine API.
    #[clap(long)]
    pub docker_cert: Option<PathBuf>,

    /// The engine endpoint (a unix socket or a tcp address).
    #[clap(long, default_value = "unix:///var/run/docker.sock")]
    pub docker_addr: String,

    /// Host that published container ports are reachable on.
    #[clap(long, default_value = "127.0.0.1")]
    pub docker_host: String,

    /// Minimum container age, in minutes, before the housekeeper may remove
    /// it. Zero disables the clear pass.
    #[clap(long, default_value = "0")]
    pub docker_clear_delay: u64,

    /// Container-name patterns the clear pass never touches.
    #[clap(long)]
    pub docker_clear_exc: Vec<String>,

    /// Interval between engine prune passes, in minutes. Zero disables.
    #[clap(long, default_value = "0")]
    pub docker_prune_delay: u64,

    /// Object families excluded from the prune pass.
    #[clap(long, value_enum)]
    pub docker_prune_exc: Vec<PruneKind>,

    /// Appended to every forward prefix to form its virtual host.
    #[clap(long, default_value = "")]
    pub host_suffix: String,

    /// Scheme used for links on the index page.
    #[clap(long, default_value = "http")]
    pub host_proto: String,

    /// The gateway's own hostname; index requests for other hosts answer 404.
    #[clap(long, default_value = "")]
    pub host_self: String,

    /// Reserved path prefix of the per-service control surface.
    #[clap(long, default_value = "/_s/")]
    pub srv_prefix: String,

    /// Optional HTML template for the index page (`{{hosts}}`, `{{message}}`).
    #[clap(long)]
    pub preview: Option<PathBuf>,

    /// Log level, optionally followed by `,json` (e.g. `info,json`).
    #[serde(deserialize_with = "log_value_deser")]
    #[clap(long, default_value = "info")]
    pub log: String,

    /// The PATH to the configuration file to be used.
    #[clap(short, long)]
    pub config_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:80".to_string(),
            refresh_time: 10_000,
            trigger_bash: "bash".to_string(),
            trigger_finder: None,
            trigger_added: None,
            trigger_removed: None,
            trigger_updated: None,
            docker_cert: None,
            docker_addr: "unix:///var/run/docker.sock".to_string(),
            docker_host: "127.0.0.1".to_string(),
            docker_clear_delay: 0,
            docker_clear_exc: vec![],
            docker_prune_delay: 0,
            docker_prune_exc: vec![],
            host_suffix: String::new(),
            host_proto: "http".to_string(),
            host_self: String::new(),
            srv_prefix: "/_s/".to_string(),
            preview: None,
            log: "info".to_string(),
            config_path: None,
        }
    }
}

impl Config {
    /// Splits the `log` value into a level and a JSON-format flag.
    pub fn log_settings(&self) -> (LogLevel, bool) {
        let mut level = LogLevel::Info;
        let mut json = false;
        for part in self.log.split(',') {
            match part.trim().to_lowercase().as_str() {
                "debug" => level = LogLevel::Debug,
                "info" => level = LogLevel::Info,
                "warn" => level = LogLevel::Warn,
                "error" => level = LogLevel::Error,
                "trace" => level = LogLevel::Trace,
                "json" => json = true,
                _ => {}
            }
        }
        (level, json)
    }
}

/// Implement the `Provider` trait for the `Config` struct.
/// This allows the `Config` struct to be used as a configuration provider
/// with *defaults*.
impl Provider for Config {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("pdgate")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Config::default()).data()
    }
}

/// Load the configuration from the configuration file as a `Config` struct.
///
/// Keys can also arrive through the environment: `PDGATE_HOST_SUFFIX=.example`
/// sets the `host_suffix` key.
pub fn load(fallback: &str) -> Result<Config, figment::Error> {
    let parsed_commands = Config::parse();

    let path_with_fallback = match &parsed_commands.config_path {
        Some(path) => path.clone(),
        None => format!("{fallback}/pdgate.yaml"),
    };

    load_from_path(&path_with_fallback, &parsed_commands)
}

/// Load configuration from a specific path; shared by `load` and the tests.
pub(crate) fn load_from_path(
    config_path: &str,
    parsed_commands: &Config,
) -> Result<Config, figment::Error> {
    let config: Config = Figment::new()
        .merge(Config::default())
        .merge(Serialized::defaults(parsed_commands))
        .merge(Yaml::file(config_path))
        .merge(Env::prefixed("PDGATE_").split("__"))
        .extract()?;

    // validate configuration and throw error upwards
    validate::check_config(&config).map_err(|err| figment::Error::from(err.to_string()))?;

    Ok(config)
}

/// Accepts any case for the level part and an optional `,json` suffix.
fn log_value_deser<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    for part in s.split(',') {
        match part.trim().to_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" | "trace" | "json" => {}
            _ => {
                return Err(serde::de::Error::custom(
                    "expected one of DEBUG, INFO, WARN, ERROR, TRACE with an optional ,json suffix",
                ))
            }
        }
    }
    Ok(s)
}

/// Parses the stdout of the finder script: one `key=value` per line, `#`
/// comments and blank lines ignored.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    properties
}
