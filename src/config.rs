use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// Global config instance (uses default if load fails at static init)
static GLOBAL_CONFIG: LazyLock<RwLock<Config>> =
    LazyLock::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a snapshot of the global config
pub fn get_config() -> Config {
    GLOBAL_CONFIG.read().clone()
}

/// Initialize global config with overrides
pub fn init_config(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

/// Gateway configuration loaded from `~/.config/cagw/config.toml`.
///
/// All fields have defaults; environment variables and CLI flags override them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cloudcode: CloudCodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Password clients must present; `None` disables inbound authentication
    #[serde(default)]
    pub api_key: Option<String>,
    /// Timeout for non-streaming requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log full request/response bodies for debugging
    #[serde(default)]
    pub log_requests: bool,
}

/// OAuth client and credential storage settings.
///
/// Example in `config.toml`:
/// ```toml
/// [auth]
/// credential_file = "/srv/cagw/oauth_creds.json"
/// callback_port = 8080
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Path of the persisted credential file
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
    /// Fixed local port for the OAuth redirect listener
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    /// Explicit project override, wins over every cached or discovered value
    #[serde(default)]
    pub project_id: Option<String>,
    /// Credential blob supplied through the environment (never written to disk)
    #[serde(skip)]
    pub env_credentials: Option<String>,
}

fn default_credential_file() -> PathBuf {
    Config::dir().join("oauth_creds.json")
}

fn default_callback_port() -> u16 {
    8080
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            credential_file: default_credential_file(),
            callback_port: default_callback_port(),
            project_id: None,
            env_credentials: None,
        }
    }
}

/// Configuration for the Code Assist API client.
///
/// Example in `config.toml`:
/// ```toml
/// [cloudcode]
/// timeout_secs = 180
/// onboard_max_attempts = 24
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCodeConfig {
    /// Base URL of the Code Assist API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// API timeout in seconds; for streams it bounds the wait for response headers (default: 120)
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// Seconds between onboarding status polls (default: 5)
    #[serde(default = "default_onboard_interval")]
    pub onboard_poll_interval_secs: u64,
    /// Polls before onboarding gives up (default: 60)
    #[serde(default = "default_onboard_attempts")]
    pub onboard_max_attempts: u32,
}

fn default_endpoint() -> String {
    "https://cloudcode-pa.googleapis.com".to_string()
}

fn default_api_timeout() -> u64 {
    120
}

fn default_onboard_interval() -> u64 {
    5
}

fn default_onboard_attempts() -> u32 {
    60
}

impl Default for CloudCodeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_api_timeout(),
            onboard_poll_interval_secs: default_onboard_interval(),
            onboard_max_attempts: default_onboard_attempts(),
        }
    }
}

fn default_port() -> u16 {
    8888
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cagw")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                source: e,
            })?;
            Self::parse(&content, path)
        } else {
            Ok(Self::default())
        }
    }

    fn parse(content: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            source: e,
        })?;

        if config.cloudcode.onboard_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                path,
                field: "cloudcode.onboard_max_attempts".to_string(),
                value: "0".to_string(),
                valid_values: vec!["1 or more".to_string()],
            });
        }

        if !config.cloudcode.endpoint.starts_with("http://")
            && !config.cloudcode.endpoint.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                path,
                field: "cloudcode.endpoint".to_string(),
                value: config.cloudcode.endpoint,
                valid_values: vec!["an http:// or https:// URL".to_string()],
            });
        }

        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn host(&self) -> &str {
        &self.server.host
    }

    /// Apply environment variables on top of the file configuration.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    fn with_env_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(password) = non_empty("GEMINI_AUTH_PASSWORD") {
            self.server.api_key = Some(password);
        }
        if let Some(port) = non_empty("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = non_empty("HOST") {
            self.server.host = host;
        }
        if let Some(file) = non_empty("GOOGLE_APPLICATION_CREDENTIALS") {
            self.auth.credential_file = PathBuf::from(file);
        }
        if let Some(project) = non_empty("GOOGLE_CLOUD_PROJECT") {
            self.auth.project_id = Some(project);
        }
        if let Some(id) = non_empty("GOOGLE_CLIENT_ID") {
            self.auth.client_id = id;
        }
        if let Some(secret) = non_empty("GOOGLE_CLIENT_SECRET") {
            self.auth.client_secret = secret;
        }
        self.auth.env_credentials = non_empty("GEMINI_CREDENTIALS");
        self
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>, debug: bool) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        self
    }
}
