//! SOCKS5 CONNECT-only relay.
//!
//! The connector closure (`handle_socks5_tcp`) is a plain `Service<TcpRequest>`
//! that reads state back out of the request's extensions (populated by
//! `AddInputExtensionLayer`) rather than a separate context parameter, and
//! `Socks5Acceptor` is handed straight to the listener. No `DefaultUdpRelay`
//! is wired up, so `Socks5Acceptor` refuses BIND and UDP ASSOCIATE with the
//! standard "command not supported" reply on its own — no UDP relay
//! machinery needed.

use std::io;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::extensions::ExtensionsRef;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::service::service_fn;
use rama_net::client::EstablishedClientConnection;
use rama_socks5::Socks5Acceptor;
use rama_socks5::server::DefaultConnector;
use rama_tcp::TcpStream;
use rama_tcp::client::Request as TcpRequest;
use rama_tcp::client::service::TcpConnector;
use rama_tcp::server::TcpListener;

use crate::host_eval::HostEvaluator;

#[derive(Clone)]
pub struct Socks5State {
    pub evaluator: HostEvaluator,
}

pub async fn run_socks5(state: Arc<Socks5State>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::build().bind(addr).await?;
    run_socks5_with_listener(state, listener).await
}

/// Runs the SOCKS5 proxy on an already-bound std listener; see
/// `http_proxy::run_http_proxy_with_std_listener` for why the Orchestrator
/// needs this split.
pub async fn run_socks5_with_std_listener(
    state: Arc<Socks5State>,
    listener: StdTcpListener,
) -> std::io::Result<()> {
    let listener =
        TcpListener::try_from(listener).map_err(|err| std::io::Error::other(err.to_string()))?;
    run_socks5_with_listener(state, listener).await
}

async fn run_socks5_with_listener(
    state: Arc<Socks5State>,
    listener: TcpListener,
) -> std::io::Result<()> {
    let tcp_connector = TcpConnector::default();
    let policy_tcp_connector = service_fn(move |req: TcpRequest| {
        let tcp_connector = tcp_connector.clone();
        async move { handle_socks5_tcp(req, tcp_connector).await }
    });

    let socks_connector = DefaultConnector::default().with_connector(policy_tcp_connector);
    let acceptor = Socks5Acceptor::new().with_connector(socks_connector);

    listener
        .serve(AddInputExtensionLayer::new(state).into_layer(acceptor))
        .await;
    Ok(())
}

/// Only `CONNECT` ever reaches this connector: `Socks5Acceptor` refuses
/// `BIND`/`UDP ASSOCIATE` itself with `0x07 (Command not supported)` before
/// ever invoking it. On allow, dials upstream directly with a bounded
/// timeout; on deny, `policy_denied_error` maps to `0x02 (Connection not
/// allowed by ruleset)` through `Socks5Acceptor`'s own `io::ErrorKind`
/// mapping.
async fn handle_socks5_tcp(
    req: TcpRequest,
    tcp_connector: TcpConnector,
) -> Result<EstablishedClientConnection<TcpStream, TcpRequest>, BoxError> {
    let state = req
        .extensions()
        .get::<Arc<Socks5State>>()
        .cloned()
        .ok_or_else(|| io::Error::other("missing state"))?;

    let host = sandbox_policy::normalize_host(&req.authority.host.to_string());
    let port = req.authority.port;

    if !state.evaluator.allow(&host, port) {
        return Err(policy_denied_error(&host, port).into());
    }

    tcp_connector.serve(req).await
}

fn policy_denied_error(host: &str, port: u16) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        format!("{host}:{port} is not permitted by the active network policy"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denied_error_is_permission_denied() {
        let err = policy_denied_error("evil.example.com", 443);
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("evil.example.com:443"));
    }
}
