use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The minimum port number accepted for `http_proxy_port`/`socks_proxy_port`.
pub const MIN_PORT: u16 = 1;

/// Top-level, immutable configuration record for a single sandboxed run.
///
/// Unknown top-level fields are rejected at deserialize time so a typo in a
/// config file fails loudly instead of being silently ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub env: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub pre_command: Option<String>,
    #[serde(default)]
    pub enable_weaker_nested_sandbox: bool,
    #[serde(default)]
    pub ignore_violations: IgnoreViolations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub denied_domains: Vec<String>,
    #[serde(default)]
    pub allowed_unix_sockets: Vec<String>,
    #[serde(default)]
    pub http_proxy_port: Option<u16>,
    #[serde(default)]
    pub socks_proxy_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    DenyOnly,
    AllowOnly,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self::DenyOnly
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    #[serde(default)]
    pub read_policy: ReadPolicy,
    #[serde(default)]
    pub deny_read: Vec<String>,
    #[serde(default)]
    pub allow_read: Vec<String>,
    #[serde(default)]
    pub deny_within_allow_read: Vec<String>,
    #[serde(default)]
    pub allow_write: Vec<String>,
    #[serde(default)]
    pub deny_write: Vec<String>,
    #[serde(default)]
    pub deny_within_allow_write: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreViolations {
    #[serde(default)]
    pub filesystem: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
}

/// Reason a `Configuration` failed validation, paired with the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid config field `{field}`: {reason}")]
pub struct ConfigValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl Configuration {
    /// Validates structural invariants that do not depend on the detected
    /// host. Host-specific validation (e.g. toolchain presence) happens in
    /// `sandbox-core`.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if let Some(port) = self.network.http_proxy_port {
            validate_port("network.http_proxy_port", port)?;
        }
        if let Some(port) = self.network.socks_proxy_port {
            validate_port("network.socks_proxy_port", port)?;
        }
        if let (Some(http), Some(socks)) =
            (self.network.http_proxy_port, self.network.socks_proxy_port)
            && http == socks
        {
            return Err(ConfigValidationError::new(
                "network.http_proxy_port",
                format!("conflicts with network.socks_proxy_port ({http} == {socks})"),
            ));
        }
        // An empty `allow_read` under AllowOnly is not rejected here: the
        // platform-mandated minimum (loader search paths) keeps the child
        // startable regardless, so this is not a config error.
        Ok(())
    }
}

fn validate_port(field: &'static str, port: u16) -> Result<(), ConfigValidationError> {
    if port < MIN_PORT {
        return Err(ConfigValidationError::new(
            field,
            format!("port {port} is below the minimum of {MIN_PORT}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_configuration_is_deny_only_and_empty() {
        let config = Configuration::default();
        assert_eq!(config.filesystem.read_policy, ReadPolicy::DenyOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn conflicting_ports_are_rejected() {
        let mut config = Configuration {
            network: NetworkConfig {
                http_proxy_port: Some(8080),
                socks_proxy_port: Some(8080),
                ..NetworkConfig::default()
            },
            ..Configuration::default()
        };
        let err = config.validate().expect_err("ports must conflict");
        assert_eq!(err.field, "network.http_proxy_port");

        config.network.socks_proxy_port = Some(8081);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let json = r#"{"network": {}, "filesystem": {}, "bogus": true}"#;
        let result: Result<Configuration, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn env_preserves_insertion_order() {
        let json = r#"{
            "env": {"B": "2", "A": "1", "C": "3"}
        }"#;
        let config: Configuration = serde_json::from_str(json).expect("parses");
        let env = config.env.expect("env present");
        let keys: Vec<&str> = env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["B", "A", "C"]);
    }
}
