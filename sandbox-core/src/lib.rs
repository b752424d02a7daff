//! Sandbox Orchestrator, audit ingest for both hosts, and the
//! `SandboxError` taxonomy.

mod audit_a;
mod audit_b;
mod error;
mod orchestrator;

pub use audit_a::ParsedViolation;
pub use audit_a::parse_audit_a_line;
pub use audit_a::ingest_lines;
pub use audit_b::ExitOutcome;
pub use audit_b::FILTER_INSTALL_FAILED_MARKER;
pub use audit_b::PathSnapshot;
pub use audit_b::detect_filter_install_failure;
pub use audit_b::filter_install_failed_violation;
pub use audit_b::now_ms;
pub use audit_b::snapshot_path;
pub use audit_b::snapshot_paths;
pub use audit_b::synthesize_violations;
pub use error::ProxyKind;
pub use error::Result;
pub use error::SandboxError;
pub use orchestrator::Orchestrator;
pub use orchestrator::WrappedCommand;
pub use sandbox_policy::Configuration;
pub use sandbox_proxy::Subscription;
pub use sandbox_proxy::ViolationEvent;
pub use sandbox_proxy::ViolationKind;
