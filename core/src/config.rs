//! Configuration loading
//!
//! Configurations are resolved from a URI by a [`ConfigLoader`] capability,
//! looked up by scheme in a [`LoaderRegistry`]. The native `file://` loader
//! reads a TOML document of `[[servers]]` blocks:
//!
//! ```toml
//! [[servers]]
//! hosts = ["web[1-5].example.com"]
//! roles = ["web"]
//!
//! [[servers]]
//! hosts = ["db1.example.com"]
//! roles = ["db"]
//! port = 2222
//! ```
//!
//! Host entries support numeric range expansion (`web[1-5].example.com`).

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::{Configuration, Error, Result, Server};

/// Split a URI into `(scheme, rest)`.
///
/// A bare path with no `://` is treated as a `file` URI.
pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("file", uri),
    }
}

/// Configuration source capability, looked up by URI scheme
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Resolve the part of the URI after the scheme into a configuration
    async fn load(&self, location: &str) -> Result<Configuration>;

    /// Loader name, for logs
    fn name(&self) -> &str;
}

/// Registry of configuration loaders, keyed by URI scheme
pub struct LoaderRegistry {
    loaders: HashMap<String, Box<dyn ConfigLoader>>,
}

impl LoaderRegistry {
    /// Create a registry with the native `file://` loader registered
    pub fn new() -> Self {
        let mut registry = Self {
            loaders: HashMap::new(),
        };
        registry.register("file", Box::new(FileLoader));
        registry
    }

    /// Register a loader for a scheme, replacing any existing one
    pub fn register(&mut self, scheme: impl Into<String>, loader: Box<dyn ConfigLoader>) {
        let scheme = scheme.into();
        debug!(scheme = %scheme, "Registering config loader");
        self.loaders.insert(scheme, loader);
    }

    /// Load a configuration from a URI
    pub async fn load(&self, uri: &str) -> Result<Configuration> {
        let (scheme, location) = split_uri(uri);
        let loader = self
            .loaders
            .get(scheme)
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;

        debug!(scheme = %scheme, location = %location, loader = %loader.name(), "Loading configuration");
        loader.load(location).await
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk representation of one `[[servers]]` block
#[derive(Debug, Deserialize)]
struct ServerBlock {
    hosts: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
    port: Option<u16>,
}

/// Top-level config document
#[derive(Debug, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    servers: Vec<ServerBlock>,
}

/// Native loader for `file://` URIs (and bare paths)
pub struct FileLoader;

#[async_trait]
impl ConfigLoader for FileLoader {
    async fn load(&self, location: &str) -> Result<Configuration> {
        let content = tokio::fs::read_to_string(location)
            .await
            .map_err(|e| Error::ConfigError(format!("failed to read {}: {}", location, e)))?;

        parse_config(&content)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Parse a TOML configuration document into a Configuration
pub fn parse_config(content: &str) -> Result<Configuration> {
    let doc: ConfigDoc = toml::from_str(content)
        .map_err(|e| Error::ConfigError(format!("failed to parse config: {}", e)))?;

    let mut servers = Vec::new();
    for block in &doc.servers {
        for pattern in &block.hosts {
            for host in expand_hosts(pattern)? {
                servers.push(Server::new(host, block.roles.clone(), block.port));
            }
        }
    }

    Configuration::from_servers(servers)
}

/// Expand numeric host ranges: `web[1-5].example.com` becomes
/// `web1.example.com` .. `web5.example.com`. Multiple ranges per pattern
/// expand left to right. A name without brackets passes through unchanged.
pub fn expand_hosts(pattern: &str) -> Result<Vec<String>> {
    let Some(open) = pattern.find('[') else {
        return Ok(vec![pattern.to_string()]);
    };
    let close = pattern[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| Error::ConfigError(format!("unclosed range in '{}'", pattern)))?;

    let (prefix, range) = (&pattern[..open], &pattern[open + 1..close]);
    let suffix = &pattern[close + 1..];

    let (lo, hi) = range
        .split_once('-')
        .ok_or_else(|| Error::ConfigError(format!("invalid range '[{}]' in '{}'", range, pattern)))?;
    let lo: u32 = lo
        .parse()
        .map_err(|_| Error::ConfigError(format!("invalid range bound '{}' in '{}'", lo, pattern)))?;
    let hi: u32 = hi
        .parse()
        .map_err(|_| Error::ConfigError(format!("invalid range bound '{}' in '{}'", hi, pattern)))?;
    if lo > hi {
        return Err(Error::ConfigError(format!(
            "reversed range '[{}]' in '{}'",
            range, pattern
        )));
    }

    let mut hosts = Vec::new();
    for n in lo..=hi {
        // Recurse for any range in the suffix
        for rest in expand_hosts(suffix)? {
            hosts.push(format!("{}{}{}", prefix, n, rest));
        }
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_uri() {
        assert_eq!(split_uri("file:///etc/fleet.toml"), ("file", "/etc/fleet.toml"));
        assert_eq!(split_uri("/etc/fleet.toml"), ("file", "/etc/fleet.toml"));
        assert_eq!(split_uri("consul://fleet/prod"), ("consul", "fleet/prod"));
    }

    #[test]
    fn test_expand_hosts_plain() {
        assert_eq!(expand_hosts("db1.example.com").unwrap(), vec!["db1.example.com"]);
    }

    #[test]
    fn test_expand_hosts_range() {
        assert_eq!(
            expand_hosts("web[1-3].example.com").unwrap(),
            vec!["web1.example.com", "web2.example.com", "web3.example.com"]
        );
    }

    #[test]
    fn test_expand_hosts_multiple_ranges() {
        assert_eq!(
            expand_hosts("rack[1-2]n[1-2]").unwrap(),
            vec!["rack1n1", "rack1n2", "rack2n1", "rack2n2"]
        );
    }

    #[test]
    fn test_expand_hosts_errors() {
        assert!(expand_hosts("web[5-1]").is_err());
        assert!(expand_hosts("web[1-").is_err());
        assert!(expand_hosts("web[a-b]").is_err());
    }

    #[test]
    fn test_parse_config() {
        let content = r#"
            [[servers]]
            hosts = ["web[1-2].example.com"]
            roles = ["web"]

            [[servers]]
            hosts = ["db1.example.com"]
            roles = ["db", "backup"]
            port = 2222
        "#;

        let config = parse_config(content).unwrap();
        assert_eq!(config.len(), 3);
        assert_eq!(
            config.servers().iter().map(|s| s.name()).collect::<Vec<_>>(),
            vec!["web1.example.com", "web2.example.com", "db1.example.com"]
        );
        assert_eq!(config.role_positions("web"), &[0, 1]);
        assert_eq!(config.get("db1.example.com").unwrap().port(), Some(2222));
    }

    #[test]
    fn test_parse_config_duplicate_host() {
        let content = r#"
            [[servers]]
            hosts = ["web1", "web1"]
        "#;
        assert!(matches!(parse_config(content), Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_registry_unknown_scheme() {
        let registry = LoaderRegistry::new();
        let err = registry.load("consul://whatever").await.unwrap_err();
        assert!(matches!(err, Error::UnknownScheme(s) if s == "consul"));
    }
}
