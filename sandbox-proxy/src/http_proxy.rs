//! HTTP/1.1 forward proxy and CONNECT tunnel.
//!
//! A `MethodMatcher::CONNECT`-gated `UpgradeLayer` splits CONNECT requests
//! (which get a raw byte tunnel after the `200` handshake, relayed once
//! `connect_upgraded`'s `Upgraded` stream is handed off) from everything
//! else (forwarded as an ordinary HTTP request via `http_plain_proxy`).
//! This proxy is always the client's only hop, so the CONNECT tunnel dials
//! the destination directly rather than chaining through a further
//! upstream proxy.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::OpaqueError;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::Body;
use rama_http::HeaderMap;
use rama_http::HeaderName;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use rama_http::layer::remove_header::RemoveResponseHeaderLayer;
use rama_http::matcher::MethodMatcher;
use rama_http_backend::server::HttpServer;
use rama_http_backend::server::layer::upgrade::UpgradeLayer;
use rama_http_backend::server::layer::upgrade::Upgraded;
use rama_net::http::RequestContext;
use rama_net::proxy::ProxyRequest;
use rama_net::proxy::ProxyTarget;
use rama_net::proxy::StreamForwardService;
use rama_tcp::server::TcpListener;

use crate::host_eval::HostEvaluator;
use crate::reasons::REASON_NOT_ALLOWED;
use crate::reasons::human_message;
use crate::upstream;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct HttpProxyState {
    pub evaluator: HostEvaluator,
    pub upstream: UpstreamClient,
}

/// Runs the HTTP forward proxy until the listener is dropped or the
/// process is torn down by the Orchestrator.
pub async fn run_http_proxy(state: Arc<HttpProxyState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::build().bind(addr).await?;
    run_http_proxy_with_listener(state, listener).await
}

/// Runs the HTTP forward proxy on an already-bound std listener. The
/// Orchestrator reserves a loopback ephemeral port synchronously (so
/// `get_proxy_port` can return it from `initialize` before the accept loop
/// starts) and hands the listener off here.
pub async fn run_http_proxy_with_std_listener(
    state: Arc<HttpProxyState>,
    listener: StdTcpListener,
) -> std::io::Result<()> {
    let listener = TcpListener::try_from(listener)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    run_http_proxy_with_listener(state, listener).await
}

async fn run_http_proxy_with_listener(
    state: Arc<HttpProxyState>,
    listener: TcpListener,
) -> std::io::Result<()> {
    let http_service = HttpServer::auto(Executor::new()).service(
        (
            UpgradeLayer::new(
                MethodMatcher::CONNECT,
                service_fn(connect_accept),
                service_fn(connect_upgraded),
            ),
            RemoveResponseHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn(plain_forward)),
    );

    listener
        .serve(AddInputExtensionLayer::new(state).into_layer(http_service))
        .await;
    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body.into()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// The `UpgradeLayer` accept hook: consults the Host-Matcher for the
/// `CONNECT` target and either rejects outright (`Err`, short-circuiting
/// before any upgrade happens) or stashes the destination as a
/// `ProxyTarget` extension for `connect_upgraded` to read back once the
/// stream has been upgraded.
async fn connect_accept(mut req: Request) -> Result<(Response, Request), Response> {
    let Some(state) = req.extensions().get::<Arc<HttpProxyState>>().cloned() else {
        return Err(text_response(StatusCode::INTERNAL_SERVER_ERROR, "missing state"));
    };

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(_) => return Err(text_response(StatusCode::BAD_REQUEST, "missing authority")),
    };

    let host = sandbox_policy::normalize_host(&authority.host.to_string());
    if !state.evaluator.allow(&host, authority.port) {
        return Err(text_response(
            StatusCode::FORBIDDEN,
            human_message(REASON_NOT_ALLOWED),
        ));
    }

    req.extensions_mut().insert(ProxyTarget(authority));
    Ok((
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())),
        req,
    ))
}

/// Runs once the client's `200 Connection Established` handshake has
/// completed: dials the destination directly and relays bytes
/// bidirectionally until either side closes.
async fn connect_upgraded(upgraded: Upgraded) -> Result<(), Infallible> {
    if let Err(err) = forward_connect_tunnel(upgraded).await {
        tracing::warn!("CONNECT tunnel error: {err}");
    }
    Ok(())
}

async fn forward_connect_tunnel(upgraded: Upgraded) -> Result<(), BoxError> {
    let authority = upgraded
        .extensions()
        .get::<ProxyTarget>()
        .map(|target| target.0.clone())
        .ok_or_else(|| OpaqueError::from_display("missing forward authority").into_boxed())?;

    let host = sandbox_policy::normalize_host(&authority.host.to_string());
    let destination = upstream::dial(&host, authority.port).await.map_err(|err| {
        Box::new(std::io::Error::new(err.io_kind(), err.to_string())) as BoxError
    })?;

    let proxy_req = ProxyRequest {
        source: upgraded,
        target: destination,
    };
    StreamForwardService::default()
        .serve(proxy_req)
        .await
        .map_err(Into::into)
}

async fn plain_forward(mut req: Request) -> Result<Response, Infallible> {
    let Some(state) = req.extensions().get::<Arc<HttpProxyState>>().cloned() else {
        return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "missing state"));
    };

    let Some(host_header) = req
        .uri()
        .host()
        .map(ToString::to_string)
        .or_else(|| req.headers().get("host").and_then(|v| v.to_str().ok()).map(ToString::to_string))
    else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "missing host"));
    };
    let (host, port) = extract_host_port(&host_header, req.uri().port_u16().unwrap_or(80));

    if !state.evaluator.allow(&host, port) {
        return Ok(text_response(
            StatusCode::FORBIDDEN,
            human_message(REASON_NOT_ALLOWED),
        ));
    }

    remove_hop_by_hop_request_headers(req.headers_mut());

    match state.upstream.forward(req).await {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::warn!("upstream request failed: {err}");
            Ok(text_response(StatusCode::BAD_GATEWAY, "upstream request failed"))
        }
    }
}

fn extract_host_port(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().unwrap_or(default_port);
            (host.to_string(), port)
        }
        _ => (authority.to_string(), default_port),
    }
}

/// Strips headers that must not be relayed past this hop, including any
/// headers the `Connection` header itself names.
fn remove_hop_by_hop_request_headers(headers: &mut HeaderMap) {
    while let Some(raw_connection) = headers.get(header::CONNECTION).cloned() {
        headers.remove(header::CONNECTION);
        if let Ok(raw_connection) = raw_connection.to_str() {
            let connection_headers: Vec<String> = raw_connection
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            for token in connection_headers {
                if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                    headers.remove(name);
                }
            }
        }
    }
    for name in [
        &header::KEEP_ALIVE,
        &header::PROXY_AUTHORIZATION,
        &header::TRAILER,
        &header::TRANSFER_ENCODING,
        &header::UPGRADE,
    ] {
        headers.remove(name);
    }
    if let Ok(proxy_connection) = HeaderName::from_bytes(b"proxy-connection") {
        headers.remove(proxy_connection);
    }
    if let Ok(te_header) = HeaderName::from_bytes(b"te") {
        headers.remove(te_header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_and_explicit_port() {
        assert_eq!(
            extract_host_port("example.com:8443", 443),
            ("example.com".to_string(), 8443)
        );
    }

    #[test]
    fn falls_back_to_default_port_when_absent() {
        assert_eq!(
            extract_host_port("example.com", 443),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn strips_hop_by_hop_headers_but_keeps_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-custom".parse().unwrap());
        headers.insert(header::KEEP_ALIVE, "timeout=5".parse().unwrap());
        headers.insert(
            HeaderName::from_bytes(b"x-custom").unwrap(),
            "1".parse().unwrap(),
        );
        headers.insert(header::HOST, "example.com".parse().unwrap());

        remove_hop_by_hop_request_headers(&mut headers);

        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key(header::KEEP_ALIVE));
        assert!(!headers.contains_key("x-custom"));
        assert!(headers.contains_key(header::HOST));
    }
}
