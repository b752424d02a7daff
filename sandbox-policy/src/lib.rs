//! Configuration data model, Host-Matcher, and Glob→Pattern compiler shared
//! by both Policy Compilers and both proxies.

mod config;
mod glob_pattern;
mod host_matcher;

pub use config::ConfigValidationError;
pub use config::Configuration;
pub use config::FilesystemConfig;
pub use config::IgnoreViolations;
pub use config::NetworkConfig;
pub use config::ReadPolicy;
pub use glob_pattern::CompiledGlob;
pub use glob_pattern::GlobError;
pub use glob_pattern::compile as compile_glob;
pub use glob_pattern::compile_all as compile_glob_all;
pub use glob_pattern::compile_for_host_a;
pub use glob_pattern::compile_for_host_b;
pub use glob_pattern::matches_any as glob_matches_any;
pub use host_matcher::Decision;
pub use host_matcher::HostMatcher;
pub use host_matcher::PatternError;
pub use host_matcher::normalize_host;
