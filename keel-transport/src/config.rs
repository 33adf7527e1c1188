//! Transport and pool configuration
//!
//! Plain serde-friendly structs with field-level defaults. Timeout
//! fields accept either milliseconds or a human-readable duration
//! string such as `"30s"`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::{Result, TransportError};

/// Main transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum number of retries per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt deadline in milliseconds
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "de_duration_ms"
    )]
    pub request_timeout_ms: u64,

    /// Deadline for resurrection probes in milliseconds
    #[serde(default = "default_ping_timeout", deserialize_with = "de_duration_ms")]
    pub ping_timeout_ms: u64,

    /// Advertise gzip/deflate acceptance on every request
    #[serde(default)]
    pub suggest_compression: bool,

    /// Outgoing body compression; only `"gzip"` is recognized
    #[serde(default)]
    pub compression: Option<String>,

    /// Default headers applied to every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Background cluster discovery cadence; absent disables it
    #[serde(default, deserialize_with = "de_opt_duration_ms")]
    pub sniff_interval_ms: Option<u64>,

    /// Probe the cluster once at construction
    #[serde(default)]
    pub sniff_on_start: bool,

    /// Probe the cluster after any transport-level failure
    #[serde(default)]
    pub sniff_on_connection_fault: bool,

    /// Path queried for cluster discovery
    #[serde(default = "default_sniff_endpoint")]
    pub sniff_endpoint: String,

    /// Endpoint chooser: `"round-robin"` or `"random"`
    #[serde(default = "default_node_selector")]
    pub node_selector: String,

    /// Name attached to request meta and events
    #[serde(default = "default_name")]
    pub name: String,

    /// Prefix prepended to caller-supplied opaque ids
    #[serde(default)]
    pub opaque_id_prefix: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_ping_timeout() -> u64 {
    3_000
}

fn default_sniff_endpoint() -> String {
    "_nodes/_all/http".to_string()
}

fn default_node_selector() -> String {
    "round-robin".to_string()
}

fn default_name() -> String {
    "keel-transport".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            suggest_compression: false,
            compression: None,
            headers: HashMap::new(),
            sniff_interval_ms: None,
            sniff_on_start: false,
            sniff_on_connection_fault: false,
            sniff_endpoint: default_sniff_endpoint(),
            node_selector: default_node_selector(),
            name: default_name(),
            opaque_id_prefix: None,
        }
    }
}

impl TransportConfig {
    /// Get the per-attempt timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the resurrection probe timeout as a Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Get the sniff cadence as a Duration, if enabled
    pub fn sniff_interval(&self) -> Option<Duration> {
        self.sniff_interval_ms.map(Duration::from_millis)
    }
}

/// Parse a duration given as bare milliseconds or as a string with a
/// unit suffix: `"500ms"`, `"30s"`, `"1m"`, `"2h"`.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let s = input.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }

    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| TransportError::Configuration(format!("invalid duration '{}'", input)))?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| TransportError::Configuration(format!("invalid duration '{}'", input)))?;

    let ms = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => {
            return Err(TransportError::Configuration(format!(
                "unknown duration unit '{}'",
                unit
            )))
        }
    };

    Ok(ms as u64)
}

fn de_duration_ms<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(n) => Ok(n),
        Raw::Text(s) => parse_duration_ms(&s).map_err(D::Error::custom),
    }
}

fn de_opt_duration_ms<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Millis(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => parse_duration_ms(&s).map(Some).map_err(D::Error::custom),
    }
}

/// How dead nodes are brought back into rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectStrategy {
    /// Dead nodes stay dead until a pool update replaces them
    None,
    /// Probe the node with a HEAD request before reviving it
    Ping,
    /// Revive the node without probing
    Optimistic,
}

impl Default for ResurrectStrategy {
    fn default() -> Self {
        ResurrectStrategy::Ping
    }
}

impl ResurrectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectStrategy::None => "none",
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub resurrect_strategy: ResurrectStrategy,

    /// Whether cluster discovery may replace pool membership; a
    /// single-node pool without sniffing never declares its only node
    /// dead
    #[serde(default)]
    pub sniff_enabled: bool,

    /// Credentials applied to nodes that do not carry their own
    #[serde(default)]
    pub auth: Option<Auth>,

    /// TLS options applied to nodes that do not carry their own
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_ping_timeout", deserialize_with = "de_duration_ms")]
    pub ping_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            resurrect_strategy: ResurrectStrategy::default(),
            sniff_enabled: false,
            auth: None,
            tls: None,
            ping_timeout_ms: default_ping_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Credentials for the search service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Auth {
    Basic {
        username: String,
        password: String,
    },
    /// Pre-encoded API key token
    ApiKey(String),
    /// API key id/secret pair, encoded on the wire as base64(id:api_key)
    ApiKeyPair {
        id: String,
        api_key: String,
    },
}

impl Auth {
    /// Render the `Authorization` header value
    pub fn authorization_header(&self) -> String {
        match self {
            Auth::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                format!("Basic {}", credentials)
            }
            Auth::ApiKey(token) => format!("ApiKey {}", token),
            Auth::ApiKeyPair { id, api_key } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", id, api_key));
                format!("ApiKey {}", credentials)
            }
        }
    }
}

/// Minimum accepted TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

/// TLS options passed through to the HTTP layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a CA certificate for verifying server certificates
    pub ca_cert_path: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE - for development only)
    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default)]
    pub min_version: Option<TlsVersion>,
}

/// Cluster roles a node may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    #[serde(default = "default_true")]
    pub master: bool,
    #[serde(default = "default_true")]
    pub data: bool,
    #[serde(default = "default_true")]
    pub ingest: bool,
    #[serde(default)]
    pub ml: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self {
            master: true,
            data: true,
            ingest: true,
            ml: false,
        }
    }
}

impl NodeRoles {
    /// Build a role set from discovery role names; roles not listed are
    /// disabled
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut roles = Self {
            master: false,
            data: false,
            ingest: false,
            ml: false,
        };
        for name in names {
            // unknown role names are ignored
            let _ = roles.set(name.as_ref(), true);
        }
        roles
    }

    /// Enable or disable a role by name
    pub fn set(&mut self, role: &str, enabled: bool) -> Result<()> {
        match role {
            "master" => self.master = enabled,
            "data" => self.data = enabled,
            "ingest" => self.ingest = enabled,
            "ml" => self.ml = enabled,
            other => {
                return Err(TransportError::Configuration(format!(
                    "unknown role '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Nodes carrying only the master role are excluded from selection
    /// by the default node filter
    pub fn master_only(&self) -> bool {
        self.master && !self.data && !self.ingest && !self.ml
    }
}

/// Descriptor for one endpoint, from configuration or from discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub url: Url,

    /// Unique id within a pool; defaults to the URL with userinfo
    /// stripped
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub roles: Option<NodeRoles>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl NodeConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            id: None,
            headers: HashMap::new(),
            roles: None,
            tls: None,
        }
    }

    /// Parse a bare URL string into a descriptor
    pub fn from_url_str(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Configuration(format!("invalid node url: {}", e)))?;
        Ok(Self::new(url))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = Some(roles);
        self
    }
}

impl From<Url> for NodeConfig {
    fn from(url: Url) -> Self {
        Self::new(url)
    }
}
