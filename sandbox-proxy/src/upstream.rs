//! Dials the destination a CONNECT tunnel or SOCKS5 relay was allowed to
//! reach. This proxy never chains through a further corporate proxy — the
//! sandboxed process already talks to us as its only proxy, so dialing is
//! a direct TCP connect with a bounded timeout.

use std::io;
use std::time::Duration;

use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::ErrorContext as _;
use rama_core::error::OpaqueError;
use rama_core::service::BoxService;
use rama_http::Body;
use rama_http::Request;
use rama_http::Response;
use rama_http::layer::version_adapter::RequestVersionAdapter;
use rama_http_backend::client::HttpClientService;
use rama_http_backend::client::HttpConnector;
use rama_net::client::EstablishedClientConnection;
use rama_tcp::client::service::TcpConnector;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials and relays a single plain HTTP request: no `HttpProxyConnectorLayer`
/// (this proxy never chains through a further corporate proxy) and no TLS
/// connector (plain HTTP forwarding never terminates TLS; HTTPS goes through
/// the CONNECT tunnel's raw byte relay instead).
#[derive(Clone)]
pub struct UpstreamClient {
    connector: BoxService<
        Request<Body>,
        EstablishedClientConnection<HttpClientService<Body>, Request<Body>>,
        BoxError,
    >,
}

impl UpstreamClient {
    pub fn direct() -> Self {
        let transport = TcpConnector::default();
        let versioned = RequestVersionAdapter::new(transport);
        let connector = HttpConnector::new(versioned);
        Self {
            connector: connector.boxed(),
        }
    }

    pub async fn forward(&self, req: Request) -> Result<Response, OpaqueError> {
        let uri = req.uri().clone();
        let EstablishedClientConnection {
            input: req,
            conn: http_connection,
        } = self
            .connector
            .serve(req)
            .await
            .map_err(OpaqueError::from_boxed)?;

        http_connection
            .serve(req)
            .await
            .map_err(OpaqueError::from_boxed)
            .with_context(|| format!("http request failure for uri: {uri}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("connection to {host}:{port} failed: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// Maps to the `io::ErrorKind` the proxy frameworks use to choose a
    /// protocol-level failure response (e.g. SOCKS5 reply code).
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Timeout { .. } => io::ErrorKind::TimedOut,
            Self::Io { source, .. } => source.kind(),
        }
    }
}

pub async fn dial(host: &str, port: u16) -> Result<TcpStream, DialError> {
    let address = format!("{host}:{port}");
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Io {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            host: host.to_string(),
            port,
            timeout: CONNECT_TIMEOUT,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_listening_local_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        dial("127.0.0.1", addr.port()).await.expect("dial succeeds");
        accept.await.expect("accept task");
    }

    #[tokio::test]
    async fn dial_failure_reports_connection_refused_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);
        let err = dial("127.0.0.1", port).await.expect_err("connection refused");
        assert_eq!(err.io_kind(), io::ErrorKind::ConnectionRefused);
    }
}
