//! `SandboxError` taxonomy: one variant per named failure mode,
//! `#[error("...")]` carrying the operator-facing message.
//!
//! `NetworkDenied`/`FsDenied` are deliberately absent here: those never
//! surface through this API, they manifest to the child as connection
//! refusals or `EACCES` instead, observable only through the Violation
//! Store.

use sandbox_policy::ConfigValidationError;
use sandbox_policy::PatternError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks5 => "socks5",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error(
        "sandbox already initialized with a different configuration; call reset() before re-initializing"
    )]
    AlreadyInitializedWithDifferentConfig,

    #[error("failed to bind {which} proxy on port {port:?}: {cause}")]
    ProxyBindFailure {
        which: ProxyKind,
        port: Option<u16>,
        cause: String,
    },

    #[error("neither Host-A nor Host-B was detected on this platform")]
    HostNotSupported,

    #[error("required external tool `{tool}` is not available")]
    ToolchainMissing { tool: String },

    #[error("pre_command failed with exit code {exit_code}")]
    PreCommandFailed { exit_code: i32 },

    #[error("internal error: {context}")]
    InternalError { context: String },
}

impl From<ConfigValidationError> for SandboxError {
    fn from(err: ConfigValidationError) -> Self {
        Self::InvalidConfig {
            field: err.field.to_string(),
            reason: err.reason.clone(),
        }
    }
}

impl From<PatternError> for SandboxError {
    fn from(err: PatternError) -> Self {
        Self::InvalidConfig {
            field: "network.allowed_domains".to_string(),
            reason: err.reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_error_converts_with_field_preserved() {
        let err = ConfigValidationError {
            field: "network.http_proxy_port",
            reason: "out of range".to_string(),
        };
        let sandbox_err: SandboxError = err.into();
        match sandbox_err {
            SandboxError::InvalidConfig { field, .. } => {
                assert_eq!(field, "network.http_proxy_port");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
