use std::time::Duration;

use crate::{UpyunError, UpyunResult};

/// Version string sent in the `User-Agent` header
pub const USER_AGENT: &str = concat!("upyun-rust-sdk/", env!("CARGO_PKG_VERSION"));

/// Prefix for environment overrides read by [`UpyunConfig::from_env`]
pub const ENV_PREFIX: &str = "UPYUN_";

/// REST entry point. `Auto` lets UPYUN pick the best network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Endpoint {
    #[default]
    Auto,
    Telecom,
    Cnc,
    Ctt,
    /// Any `host` or `host:port`
    Custom(String),
}

impl Endpoint {
    pub fn host(&self) -> &str {
        match self {
            Endpoint::Auto => "v0.api.upyun.com",
            Endpoint::Telecom => "v1.api.upyun.com",
            Endpoint::Cnc => "v2.api.upyun.com",
            Endpoint::Ctt => "v3.api.upyun.com",
            Endpoint::Custom(host) => host,
        }
    }

    /// Parse `auto`, `telecom`, `cnc`, `ctt`; anything else is a custom host
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "v0" => Endpoint::Auto,
            "telecom" | "v1" => Endpoint::Telecom,
            "cnc" | "v2" => Endpoint::Cnc,
            "ctt" | "v3" => Endpoint::Ctt,
            _ => Endpoint::Custom(value.trim().to_string()),
        }
    }
}

/// Hosts for the non-REST APIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHosts {
    /// Form API upload host. `None` follows the REST endpoint.
    pub form: Option<String>,
    pub multipart: String,
    pub pretreatment: String,
    pub purge: String,
}

impl Default for ServiceHosts {
    fn default() -> Self {
        Self {
            form: None,
            multipart: "m0.api.upyun.com".to_string(),
            pretreatment: "p0.api.upyun.com".to_string(),
            purge: "purge.upyun.com".to_string(),
        }
    }
}

/// Which HTTP backend carries requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// One raw TCP connection per request
    Basic,
    /// reqwest client with a connection pool
    #[default]
    Pooled,
}

/// Client-wide configuration
#[derive(Debug, Clone)]
pub struct UpyunConfig {
    pub endpoint: Endpoint,

    pub hosts: ServiceHosts,

    /// Applied to connect and to every read
    pub timeout: Duration,

    /// Piece size for streaming bodies in both directions
    pub chunk_size: usize,

    pub transport: TransportKind,

    /// Connection attempts made by the pooled backend before giving up
    pub connect_retries: u32,

    pub user_agent: String,

    /// Lifetime of a form-upload policy, in seconds
    pub form_expiration_secs: i64,

    pub multipart: MultipartRules,
}

impl Default for UpyunConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Auto,
            hosts: ServiceHosts::default(),
            timeout: Duration::from_secs(60),
            chunk_size: 8192,
            transport: TransportKind::Pooled,
            connect_retries: 5,
            user_agent: USER_AGENT.to_string(),
            form_expiration_secs: 3600,
            multipart: MultipartRules::default(),
        }
    }
}

/// Rules for legacy multipart uploads
#[derive(Debug, Clone)]
pub struct MultipartRules {
    /// Block size used when the caller does not ask for one
    pub default_block_size: u64,

    pub min_block_size: u64,

    pub max_block_size: u64,

    /// Files larger than this are rejected before any request
    pub max_file_size: u64,

    /// Blocks in flight at once
    pub concurrency: usize,

    /// Upload passes before giving up
    pub max_passes: u32,

    /// Lifetime of the upload session policies, in seconds
    pub expiration_secs: i64,
}

impl Default for MultipartRules {
    fn default() -> Self {
        Self {
            default_block_size: 1024 * 1024,      // 1MB
            min_block_size: 1024 * 1024,          // 1MB
            max_block_size: 50 * 1024 * 1024,     // 50MB
            max_file_size: 1024 * 1024 * 1024,    // 1GB
            concurrency: 4,
            max_passes: 5,
            expiration_secs: 2_600_000,
        }
    }
}

impl MultipartRules {
    /// Clamp a requested block size into the allowed range
    pub fn block_size(&self, requested: Option<u64>) -> u64 {
        let size = requested.unwrap_or(self.default_block_size);
        size.clamp(self.min_block_size.max(1), self.max_block_size.max(self.min_block_size.max(1)))
    }

    /// Number of blocks for a file; an empty file still has one
    pub fn block_count(&self, total_size: u64, block_size: u64) -> u64 {
        total_size.div_ceil(block_size.max(1)).max(1)
    }

    pub fn with_block_bounds(mut self, min: u64, max: u64) -> Self {
        self.min_block_size = min;
        self.max_block_size = max;
        self
    }

    pub fn with_default_block_size(mut self, bytes: u64) -> Self {
        self.default_block_size = bytes;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes;
        self
    }
}

impl UpyunConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `UPYUN_*` environment variables
    pub fn from_env() -> UpyunResult<Self> {
        Self::default().with_overrides(std::env::vars(), ENV_PREFIX)
    }

    /// Apply `<prefix>ENDPOINT`, `<prefix>TIMEOUT_SECS`, `<prefix>CHUNK_SIZE`,
    /// `<prefix>TRANSPORT` and `<prefix>CONNECT_RETRIES` from a key/value source.
    pub fn with_overrides<I>(mut self, vars: I, prefix: &str) -> UpyunResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(prefix) else {
                continue;
            };
            match name {
                "ENDPOINT" => self.endpoint = Endpoint::parse(&value),
                "TIMEOUT_SECS" => {
                    self.timeout = Duration::from_secs(parse_number(&key, &value)?);
                }
                "CHUNK_SIZE" => self.chunk_size = parse_number::<usize>(&key, &value)?.max(1),
                "CONNECT_RETRIES" => self.connect_retries = parse_number(&key, &value)?,
                "TRANSPORT" => {
                    self.transport = match value.to_ascii_lowercase().as_str() {
                        "basic" => TransportKind::Basic,
                        "pooled" => TransportKind::Pooled,
                        other => {
                            return Err(UpyunError::client(format!(
                                "{key}: unknown transport '{other}'"
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(self)
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_hosts(mut self, hosts: ServiceHosts) -> Self {
        self.hosts = hosts;
        self
    }

    /// Point every API at one host, e.g. a local test server
    pub fn with_single_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.endpoint = Endpoint::Custom(host.clone());
        self.hosts = ServiceHosts {
            form: Some(host.clone()),
            multipart: host.clone(),
            pretreatment: host.clone(),
            purge: host,
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    pub fn with_multipart_rules(mut self, rules: MultipartRules) -> Self {
        self.multipart = rules;
        self
    }

    pub fn rest_host(&self) -> &str {
        self.endpoint.host()
    }

    pub fn form_host(&self) -> &str {
        self.hosts.form.as_deref().unwrap_or_else(|| self.endpoint.host())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> UpyunResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| UpyunError::client(format!("{key}: '{value}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_clamped() {
        let rules = MultipartRules::default();
        assert_eq!(rules.block_size(None), 1024 * 1024);
        assert_eq!(rules.block_size(Some(10)), 1024 * 1024);
        assert_eq!(rules.block_size(Some(u64::MAX)), 50 * 1024 * 1024);
    }

    #[test]
    fn empty_file_has_one_block() {
        let rules = MultipartRules::default();
        assert_eq!(rules.block_count(0, 1024), 1);
        assert_eq!(rules.block_count(1024, 1024), 1);
        assert_eq!(rules.block_count(1025, 1024), 2);
    }

    #[test]
    fn env_overrides_apply() {
        let vars = vec![
            ("UPYUN_ENDPOINT".to_string(), "telecom".to_string()),
            ("UPYUN_TIMEOUT_SECS".to_string(), "5".to_string()),
            ("UPYUN_TRANSPORT".to_string(), "basic".to_string()),
            ("OTHER_CHUNK_SIZE".to_string(), "1".to_string()),
        ];
        let config = UpyunConfig::default().with_overrides(vars, ENV_PREFIX).unwrap();
        assert_eq!(config.rest_host(), "v1.api.upyun.com");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.transport, TransportKind::Basic);
        assert_eq!(config.chunk_size, 8192);
    }

    #[test]
    fn bad_numbers_are_client_errors() {
        let vars = vec![("UPYUN_CHUNK_SIZE".to_string(), "lots".to_string())];
        let err = UpyunConfig::default().with_overrides(vars, ENV_PREFIX).unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn form_host_follows_endpoint() {
        let config = UpyunConfig::default().with_endpoint(Endpoint::Cnc);
        assert_eq!(config.form_host(), "v2.api.upyun.com");
    }
}
