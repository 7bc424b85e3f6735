use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, Environment, File};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use uuid::Uuid;

use crate::Result;

/// Layered server configuration: defaults, then an optional TOML file,
/// then `NOTICEMQ_*` environment variables (highest precedence).
#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Inner {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub storage: Storage,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn load(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/noticemq/noticemq").required(false))
            .add_source(File::with_name("noticemq").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder
            .add_source(Environment::with_prefix("noticemq").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        if inner.auth.token.is_empty() {
            inner.auth.token = generate_token();
            inner.auth.generated = true;
        }

        Ok(Self(Arc::new(inner)))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Settings {{ http: {:?}, mqtt: {:?}, rate_limit: {:?}, storage: {:?} }}",
            self.http, self.mqtt, self.rate_limit, self.storage
        )
    }
}

/// Random 32-character lowercase hex token.
fn generate_token() -> String {
    Uuid::new_v4().as_simple().to_string()
}

fn parse_laddr(port: &str) -> Result<SocketAddr> {
    format!("0.0.0.0:{port}").parse().map_err(|e| anyhow!("invalid listen port {port:?}, {e}"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    #[serde(default = "Http::port_default")]
    pub port: String,
}

impl Default for Http {
    fn default() -> Self {
        Self { port: Self::port_default() }
    }
}

impl Http {
    fn port_default() -> String {
        "9090".into()
    }

    pub fn laddr(&self) -> Result<SocketAddr> {
        parse_laddr(&self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::tcp_port_default")]
    pub tcp_port: String,
    #[serde(default = "Mqtt::ws_port_default")]
    pub ws_port: String,
    #[serde(default = "Mqtt::topic_default")]
    pub topic: String,
    #[serde(default = "Mqtt::session_expiry_default")]
    pub session_expiry: u32,
    #[serde(default = "Mqtt::message_expiry_default")]
    pub message_expiry: u32,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            tcp_port: Self::tcp_port_default(),
            ws_port: Self::ws_port_default(),
            topic: Self::topic_default(),
            session_expiry: Self::session_expiry_default(),
            message_expiry: Self::message_expiry_default(),
        }
    }
}

impl Mqtt {
    fn tcp_port_default() -> String {
        "9091".into()
    }
    fn ws_port_default() -> String {
        "9092".into()
    }
    fn topic_default() -> String {
        "notice".into()
    }
    fn session_expiry_default() -> u32 {
        86400
    }
    fn message_expiry_default() -> u32 {
        86400
    }

    pub fn tcp_laddr(&self) -> Result<SocketAddr> {
        parse_laddr(&self.tcp_port)
    }

    pub fn ws_laddr(&self) -> Result<SocketAddr> {
        parse_laddr(&self.ws_port)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Auth {
    #[serde(default)]
    pub token: String,
    //true when the token was auto-generated at startup
    #[serde(default, skip)]
    pub generated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    #[serde(default = "RateLimit::max_failures_default")]
    pub max_failures: i32,
    //seconds
    #[serde(default = "RateLimit::block_time_default")]
    pub block_time: i64,
    //seconds
    #[serde(default = "RateLimit::window_time_default")]
    pub window_time: i64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_failures: Self::max_failures_default(),
            block_time: Self::block_time_default(),
            window_time: Self::window_time_default(),
        }
    }
}

impl RateLimit {
    fn max_failures_default() -> i32 {
        5
    }
    fn block_time_default() -> i64 {
        900
    }
    fn window_time_default() -> i64 {
        300
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }
    fn level_default() -> Level {
        Level(slog::Level::Info)
    }
    fn dir_default() -> String {
        "logs".into()
    }
    fn file_default() -> String {
        "noticemq.log".into()
    }

    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return "".into();
        }
        if self.dir.is_empty() {
            return self.file.clone();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        format!("{}/{}", dir, self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            _ => To::Both,
        };
        Ok(to)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Level(slog::Level);

impl Level {
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Deref for Level {
    type Target = slog::Level;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let level = slog::Level::from_str(&s)
            .map_err(|_| de::Error::custom(format!("invalid log level: {s}")))?;
        Ok(Level(level))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default = "Storage::enabled_default")]
    pub enabled: bool,
    #[serde(default = "Storage::path_default")]
    pub path: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self { enabled: Self::enabled_default(), path: Self::path_default() }
    }
}

impl Storage {
    fn enabled_default() -> bool {
        true
    }
    fn path_default() -> String {
        "data".into()
    }
}
