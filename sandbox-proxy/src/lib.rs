//! HTTP CONNECT and SOCKS5 proxy servers enforcing network policy, plus
//! the shared Violation Store.

mod host_eval;
mod http_proxy;
mod reasons;
mod socks5;
mod upstream;
mod violation_store;

pub use host_eval::ExecutionContext;
pub use host_eval::HostEvaluator;
pub use http_proxy::HttpProxyState;
pub use http_proxy::run_http_proxy;
pub use http_proxy::run_http_proxy_with_std_listener;
pub use reasons::REASON_NOT_ALLOWED;
pub use reasons::human_message;
pub use socks5::Socks5State;
pub use socks5::run_socks5;
pub use socks5::run_socks5_with_std_listener;
pub use upstream::DialError;
pub use upstream::UpstreamClient;
pub use upstream::dial;
pub use violation_store::NewViolation;
pub use violation_store::RING_CAPACITY;
pub use violation_store::Subscription;
pub use violation_store::ViolationEvent;
pub use violation_store::ViolationKind;
pub use violation_store::ViolationStore;
