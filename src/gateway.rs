//! Inbound HTTP surface: routes each request to a tunnel, the registration
//! handler or the info report.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, header};
use hyper::{body::Body, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use libp2p::Multiaddr;
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;

use crate::{
    address_book,
    dispatch::{self, Route},
    host::{Host, ProbeHostFactory},
    proxy::{self, full_body, text_response},
    resolve::IdentityResolver,
    stats::GatewayInfo,
    tunnel::{BoxError, ProxyBody, TunnelClient, TunnelKind},
};

pub struct Gateway<H, F> {
    host: H,
    resolver: IdentityResolver<F>,
    http: TunnelClient<H>,
    term: TunnelClient<H>,
}

impl<H: Host, F: ProbeHostFactory> Gateway<H, F> {
    pub fn new(host: H, probes: F) -> Self {
        Self {
            http: TunnelClient::new(host.clone(), TunnelKind::Http),
            term: TunnelClient::new(host.clone(), TunnelKind::Term),
            resolver: IdentityResolver::new(probes),
            host,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn resolver(&self) -> &IdentityResolver<F> {
        &self.resolver
    }

    pub fn tunnel_client(&self, kind: TunnelKind) -> &TunnelClient<H> {
        match kind {
            TunnelKind::Http => &self.http,
            TunnelKind::Term => &self.term,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        tracing::debug!(method = %req.method(), %path, client = %client_addr, "request");
        match dispatch::dispatch(&path) {
            Route::Tunnel(kind) => self.handle_tunnel(kind, &path, req, client_addr).await,
            Route::Add => self.handle_add(&path).await,
            Route::Info => self.handle_info(),
        }
    }

    async fn handle_tunnel<B>(
        &self,
        kind: TunnelKind,
        path: &str,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let peers = self.host.peerstore().peers();
        let Some(target) = dispatch::match_peer(path, kind.prefix(), peers) else {
            return text_response(StatusCode::NOT_FOUND, "peer not found");
        };
        match proxy::forward(self.tunnel_client(kind), &target, req, client_addr).await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(peer = %target.peer, %kind, error = %e.chain(), "tunnel request failed");
                e.into_response()
            }
        }
    }

    async fn handle_add(&self, path: &str) -> Response<ProxyBody> {
        let raw = path.strip_prefix("/add").unwrap_or(path);
        let addr = match parse_multiaddr(raw) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::info!(addr = raw, error = %e, "rejected malformed address");
                return text_response(StatusCode::BAD_REQUEST, e);
            }
        };
        match address_book::register(self.host.peerstore(), &self.resolver, &addr).await {
            Ok(_) => {
                let mut res = Response::new(full_body(Bytes::new()));
                *res.status_mut() = StatusCode::SEE_OTHER;
                res.headers_mut()
                    .insert(header::LOCATION, HeaderValue::from_static("/"));
                res
            }
            Err(e) => {
                tracing::info!(%addr, error = %e, "failed to register address");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    fn handle_info(&self) -> Response<ProxyBody> {
        let info = GatewayInfo::collect(&self.host);
        match serde_json::to_string_pretty(&info) {
            Ok(mut json) => {
                json.push('\n');
                let mut res = Response::new(full_body(json));
                res.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                res
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode gateway info");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

/// Parse the percent-decoded remainder of an `/add` path.
fn parse_multiaddr(raw: &str) -> Result<Multiaddr, String> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| format!("invalid percent-encoding in {raw:?}: {e}"))?;
    if decoded.is_empty() {
        return Err("empty multiaddr".to_string());
    }
    decoded
        .parse::<Multiaddr>()
        .map_err(|e| format!("invalid multiaddr {decoded:?}: {e}"))
}

// ─── Accept loop ────────────────────────────────────────────────────────────

/// Serve HTTP/1.1 on `listener` until `shutdown` resolves. Connections
/// already accepted keep running to completion on their own tasks.
pub async fn serve<H, F>(
    listener: TcpListener,
    gateway: Arc<Gateway<H, F>>,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()>
where
    H: Host,
    F: ProbeHostFactory + 'static,
{
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "gateway listening");
    tokio::pin!(shutdown);

    loop {
        let (tcp, client_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
            () = &mut shutdown => {
                tracing::info!(addr = %local, "gateway stopped accepting connections");
                return Ok(());
            }
        };

        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(gateway.handle(req, client_addr).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tcp), svc)
                .with_upgrades()
                .await
            {
                tracing::debug!(client = %client_addr, error = %e, "http connection ended with error");
            }
        });
    }
}
