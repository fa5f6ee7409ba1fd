use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = r#"# How often every device is polled.
poll_interval_millis = 1000

[kismet]
url = "http://localhost:2501"
# Can also be provided with the API_KEY environment variable.
api_key = ""
timeout_seconds = 10

[errors]
# Stop a device tracker when Kismet returns a response that cannot be decoded.
malformed_is_fatal = false
# Stop every tracker (and the program) when one tracker hits a fatal error.
fatal_stops_all = false

[notify]
console = true
desktop = false

# [mqtt]
# host = "localhost"
# port = 1883
# topic_path = "presence"

[[devices]]
address = "A4:50:46:3B:4F:4D"
name = "Phone"
enabled = true
silence_seconds = 300
return_seconds = 600
"#;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default)]
    pub kismet: KismetConfig,
    #[serde(default)]
    pub errors: ErrorPolicy,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub devices: Vec<TrackedDevice>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KismetConfig {
    #[serde(default = "default_kismet_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for KismetConfig {
    fn default() -> Self {
        KismetConfig {
            url: default_kismet_url(),
            api_key: String::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Decides which fetch failures end a tracker.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub malformed_is_fatal: bool,
    #[serde(default)]
    pub fatal_stops_all: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default)]
    pub desktop: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            console: true,
            desktop: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TrackedDevice {
    pub address: MacAddress,
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds without new activity before a gone alert; 0 disables it.
    #[serde(default)]
    pub silence_seconds: u64,
    /// Minimum absence, in seconds, that makes new activity a back alert; 0 disables it.
    #[serde(default)]
    pub return_seconds: u64,
}

impl TrackedDevice {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

fn default_poll_interval_millis() -> u64 {
    1000
}

fn default_kismet_url() -> String {
    "http://localhost:2501".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Reads the config file, picking JSON or TOML by extension.
    ///
    /// A missing file is replaced by a default one and reported as an error so
    /// the user can fill in their devices before the next start.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            write_default(path)?;
            bail!(
                "no config found, wrote a default one to {}; edit it and restart",
                path.display()
            );
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&contents, is_json(path))
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(contents: &str, json: bool) -> anyhow::Result<Self> {
        let config = if json {
            serde_json::from_str(contents)?
        } else {
            toml::de::from_str(contents)?
        };
        Ok(config)
    }

    /// Applies environment / command line overrides for the Kismet endpoint.
    pub fn with_overrides(mut self, url: Option<String>, api_key: Option<String>) -> Self {
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            self.kismet.url = url;
        }
        if let Some(api_key) = api_key.filter(|k| !k.is_empty()) {
            self.kismet.api_key = api_key;
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_millis == 0 {
            bail!("poll_interval_millis must be greater than zero");
        }
        if self.kismet.timeout_seconds == 0 {
            bail!("kismet.timeout_seconds must be greater than zero");
        }
        if self.kismet.api_key.is_empty() {
            bail!("a Kismet API key is required (config kismet.api_key or API_KEY)");
        }
        if self.enabled_devices().next().is_none() {
            bail!("no enabled devices to track");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &TrackedDevice> {
        self.devices.iter().filter(|d| d.enabled)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn write_default(path: &Path) -> anyhow::Result<()> {
    let contents = if is_json(path) {
        let config = AppConfig::parse(DEFAULT_CONFIG, false)?;
        serde_json::to_string_pretty(&config)?
    } else {
        DEFAULT_CONFIG.to_string()
    };
    fs::write(path, contents)
        .with_context(|| format!("writing default config to {}", path.display()))
}
