//! Translates a `sandbox_policy::Configuration` into a host-specific launch
//! plan. Pure string/`Vec`-producing functions: nothing here spawns a
//! process or touches the filesystem beyond the read-only glob expansion
//! `sandbox-policy` already performs.

mod host_a;
mod host_b;

pub use host_a::CompileError as HostACompileError;
pub use host_a::HOST_A_LAUNCHER_PATH;
pub use host_a::HostAPlan;
pub use host_a::NetworkParams as HostANetworkParams;
pub use host_a::compile_host_a;
pub use host_b::CompileError as HostBCompileError;
pub use host_b::HOST_B_LAUNCHER_PATH;
pub use host_b::HOST_B_SYSCALL_FILTER_HELPER_PATH;
pub use host_b::HostBPlan;
pub use host_b::NetworkParams as HostBNetworkParams;
pub use host_b::compile_host_b;
