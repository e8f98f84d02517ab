//! Client configuration
//!
//! Default config location: ~/.lodestar/config.toml

use crate::auth::{CredentialsTokenProvider, StaticTokenProvider, TokenProvider};
use crate::error::{Error, Result};
use crate::executor::RetryPolicy;
use crate::topology::{Datacenter, Deployment, Node};
use crate::transport::{HttpTransport, UserAgentChunk};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub insert_many: InsertManyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Caller chunks prepended to the User-Agent header
    #[serde(default)]
    pub user_agent: Vec<UserAgentChunk>,
    /// Datacenters in failover order
    #[serde(default)]
    pub datacenters: Vec<DatacenterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Idle pooled connections kept per host
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,

    /// Overall bound for one command, retries and failover included
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_max_idle_connections() -> usize {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_idle_connections: default_max_idle_connections(),
            call_timeout_ms: None,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts against one node before moving to the next
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, doubled for each following one
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// Upper bound for the backoff delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Lifetime of a renewed token in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl() -> u64 {
    30 * 60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InsertManyConfig {
    /// Documents per `insertMany` command
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_chunk_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    1
}

impl Default for InsertManyConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_level")]
    pub level: String,

    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// One datacenter of the deployment
#[derive(Clone, Deserialize, Serialize)]
pub struct DatacenterConfig {
    pub id: String,

    /// Static application token; takes precedence over credentials
    #[serde(default)]
    pub token: Option<String>,

    /// Base URL of the auth service (`<auth_url>/v1/auth`)
    #[serde(default)]
    pub auth_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

impl fmt::Debug for DatacenterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatacenterConfig")
            .field("id", &self.id)
            .field("token", &redact(&self.token))
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("nodes", &self.nodes)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub id: String,
    pub endpoint: String,
    /// Defaults to the endpoint when omitted
    #[serde(default)]
    pub health_check_url: Option<String>,
}

impl DatacenterConfig {
    fn token_provider(
        &self,
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Arc<dyn TokenProvider>> {
        if let Some(token) = &self.token {
            return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
        }

        let auth_url = self.auth_url.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "Datacenter {} needs either 'token' or 'auth_url'",
                self.id
            ))
        })?;
        let username = self.username.clone().unwrap_or_default();
        let password = self.password.clone().unwrap_or_default();

        let provider = CredentialsTokenProvider::new(auth_url, username, password, transport)?
            .with_ttl(config.auth.token_ttl())
            .with_retry(config.retry.policy())
            .with_request_timeout(config.http.request_timeout());
        Ok(Arc::new(provider.for_datacenter(&self.id)))
    }

    fn build(&self, config: &ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Datacenter> {
        let mut dc = Datacenter::new(self.id.clone(), self.token_provider(config, transport)?);
        for node in &self.nodes {
            let health = node.health_check_url.as_deref().unwrap_or(&node.endpoint);
            dc.add_node(Node::new(node.id.clone(), &node.endpoint, health)?)?;
        }
        Ok(dc)
    }
}

/// Default config file path (~/.lodestar/config.toml)
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lodestar")
        .join("config.toml")
}

impl ClientConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Build the deployment described by `datacenters`
    pub fn build_deployment(&self, transport: Arc<dyn HttpTransport>) -> Result<Deployment> {
        if self.datacenters.is_empty() {
            return Err(Error::Config("no datacenters configured".to_string()));
        }
        let datacenters = self
            .datacenters
            .iter()
            .map(|dc| dc.build(self, Arc::clone(&transport)))
            .collect::<Result<Vec<_>>>()?;
        Deployment::new(datacenters)
    }
}
