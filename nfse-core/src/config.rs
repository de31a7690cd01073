//! Configuration and environment selection.
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use zeroize::Zeroizing;

/// Tax-authority environment selection.
/// This determines which ordered host list the resolver probes.
/// - Homologation: the municipality's test environment ("homologação").
/// - Production: the live environment where issued invoices have fiscal effect.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use nfse_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("homologacao")?;
/// assert_eq!(env, EnvironmentType::Homologation);
/// # Ok::<(), nfse_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Homologation,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "homologation" | "homologacao" | "staging" => Ok(EnvironmentType::Homologation),
            "production" | "producao" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Homologation => "homologation",
            EnvironmentType::Production => "production",
        }
    }

    /// ABRASF `tpAmb` code carried in the message header.
    pub fn ambient_code(&self) -> &'static str {
        match self {
            EnvironmentType::Production => "1",
            EnvironmentType::Homologation => "2",
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while assembling a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid service host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("no service hosts configured for {0}")]
    EmptyHosts(EnvironmentType),
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
}

/// A candidate webservice host, validated as an absolute http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHost(String);

impl ServiceHost {
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into().trim().to_string();
        let url = reqwest::Url::parse(&value).map_err(|e| ConfigError::InvalidHost {
            host: value.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidHost {
                host: value,
                reason: "scheme must be http or https".into(),
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered candidate hosts per environment, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceHosts {
    homologation: Vec<ServiceHost>,
    production: Vec<ServiceHost>,
}

impl ServiceHosts {
    pub fn new(homologation: Vec<ServiceHost>, production: Vec<ServiceHost>) -> Self {
        Self {
            homologation,
            production,
        }
    }

    pub fn for_env(&self, env: EnvironmentType) -> &[ServiceHost] {
        match env {
            EnvironmentType::Homologation => &self.homologation,
            EnvironmentType::Production => &self.production,
        }
    }
}

/// Process-wide symmetric key used to seal certificate material at rest.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Decode a base64 encoded 256-bit key.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let decoded = Zeroizing::new(
            Base64::decode_vec(encoded.trim())
                .map_err(|e| ConfigError::InvalidMasterKey(e.to_string()))?,
        );
        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            ConfigError::InvalidMasterKey(format!("expected 32 bytes, got {}", decoded.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Public fingerprint stored next to sealed data: hex of the first 8 bytes of SHA-256.
    pub fn key_id(&self) -> String {
        hex::encode(&Sha256::digest(self.0.as_slice())[..8])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(***)")
    }
}

/// Pipeline configuration, built once at process start and shared by reference.
///
/// # Examples
/// ```rust
/// use nfse_core::config::{Config, EnvironmentType, MasterKey, ServiceHost, ServiceHosts};
///
/// let hosts = ServiceHosts::new(
///     vec![ServiceHost::parse("https://homologacao.example.gov.br/nfse")?],
///     vec![ServiceHost::parse("https://nfse.example.gov.br/nfse")?],
/// );
/// let config = Config::new(EnvironmentType::Homologation, hosts, MasterKey::from_bytes([7; 32]));
/// assert_eq!(config.retries(), 3);
/// # Ok::<(), nfse_core::config::ConfigError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    hosts: ServiceHosts,
    attempt_timeout: Duration,
    probe_timeout: Duration,
    probe_ceiling: Duration,
    retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    master_key: MasterKey,
}

impl Config {
    pub fn new(env: EnvironmentType, hosts: ServiceHosts, master_key: MasterKey) -> Self {
        Self {
            env,
            hosts,
            attempt_timeout: Duration::from_secs(default_attempt_timeout_secs()),
            probe_timeout: Duration::from_millis(default_probe_timeout_ms()),
            probe_ceiling: Duration::from_millis(default_probe_ceiling_ms()),
            retries: default_retries(),
            backoff_base: Duration::from_millis(default_backoff_base_ms()),
            backoff_max: Duration::from_millis(default_backoff_max_ms()),
            master_key,
        }
    }

    /// Read configuration from `NFSE_*` variables. Call once from the binary entry point.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a value is missing, malformed, or a host list is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("NFSE").try_parsing(true))
            .build()?
            .try_deserialize()?;
        raw.try_into()
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_probe_ceiling(mut self, ceiling: Duration) -> Self {
        self.probe_ceiling = ceiling;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn hosts(&self) -> &ServiceHosts {
        &self.hosts
    }

    /// Hosts for the selected environment.
    pub fn active_hosts(&self) -> &[ServiceHost] {
        self.hosts.for_env(self.env)
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn probe_ceiling(&self) -> Duration {
        self.probe_ceiling
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_environment")]
    environment: String,
    #[serde(default)]
    homologation_hosts: String,
    #[serde(default)]
    production_hosts: String,
    master_key: String,
    #[serde(default = "default_attempt_timeout_secs")]
    attempt_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    probe_timeout_ms: u64,
    #[serde(default = "default_probe_ceiling_ms")]
    probe_ceiling_ms: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
}

fn default_environment() -> String {
    "homologation".to_string()
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_probe_ceiling_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn parse_host_list(list: &str) -> Result<Vec<ServiceHost>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(ServiceHost::parse)
        .collect()
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, ConfigError> {
        let env = EnvironmentType::from_str(&raw.environment)?;
        let hosts = ServiceHosts::new(
            parse_host_list(&raw.homologation_hosts)?,
            parse_host_list(&raw.production_hosts)?,
        );
        if hosts.for_env(env).is_empty() {
            return Err(ConfigError::EmptyHosts(env));
        }
        let master_key = MasterKey::from_base64(&raw.master_key)?;

        Ok(Config::new(env, hosts, master_key)
            .with_attempt_timeout(Duration::from_secs(raw.attempt_timeout_secs))
            .with_probe_timeout(Duration::from_millis(raw.probe_timeout_ms))
            .with_probe_ceiling(Duration::from_millis(raw.probe_ceiling_ms))
            .with_retries(raw.retries)
            .with_backoff(
                Duration::from_millis(raw.backoff_base_ms),
                Duration::from_millis(raw.backoff_max_ms),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(environment: &str, homologation: &str, production: &str) -> RawConfig {
        RawConfig {
            environment: environment.into(),
            homologation_hosts: homologation.into(),
            production_hosts: production.into(),
            master_key: Base64::encode_string(&[1u8; 32]),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_ceiling_ms: default_probe_ceiling_ms(),
            retries: default_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!(
            EnvironmentType::from_str("Homologation").unwrap(),
            EnvironmentType::Homologation
        );
        assert_eq!(
            EnvironmentType::from_str("producao").unwrap(),
            EnvironmentType::Production
        );
        assert!(matches!(
            EnvironmentType::from_str("sandbox"),
            Err(EnvironmentParseError::Invalid { .. })
        ));
    }

    #[test]
    fn host_lists_keep_priority_order() {
        let config: Config = raw(
            "homologation",
            "https://h1.example.gov.br/ws, https://h2.example.gov.br/ws",
            "",
        )
        .try_into()
        .expect("config");

        let hosts: Vec<&str> = config.active_hosts().iter().map(|h| h.as_str()).collect();
        assert_eq!(
            hosts,
            vec!["https://h1.example.gov.br/ws", "https://h2.example.gov.br/ws"]
        );
        assert!(config.hosts().for_env(EnvironmentType::Production).is_empty());
    }

    #[test]
    fn selected_environment_requires_hosts() {
        let result: Result<Config, _> = raw("production", "https://h1.example.gov.br", "").try_into();
        assert!(matches!(
            result,
            Err(ConfigError::EmptyHosts(EnvironmentType::Production))
        ));
    }

    #[test]
    fn rejects_non_http_hosts() {
        assert!(matches!(
            ServiceHost::parse("ftp://files.example.gov.br"),
            Err(ConfigError::InvalidHost { .. })
        ));
        assert!(ServiceHost::parse("not a url").is_err());
    }

    #[test]
    fn master_key_requires_32_bytes() {
        let short = Base64::encode_string(&[0u8; 16]);
        assert!(matches!(
            MasterKey::from_base64(&short),
            Err(ConfigError::InvalidMasterKey(_))
        ));
        let key = MasterKey::from_base64(&Base64::encode_string(&[9u8; 32])).expect("key");
        assert_eq!(key.as_bytes(), &[9u8; 32]);
        assert_eq!(format!("{key:?}"), "MasterKey(***)");
    }

    #[test]
    fn key_id_is_stable_and_distinct() {
        let first = MasterKey::from_bytes([1; 32]);
        let second = MasterKey::from_bytes([2; 32]);
        assert_eq!(first.key_id(), MasterKey::from_bytes([1; 32]).key_id());
        assert_ne!(first.key_id(), second.key_id());
        assert_eq!(first.key_id().len(), 16);
    }
}
