//! Reverse-proxy body shared by the tunnel handlers.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode,
    header::{self, CONNECTION, HOST, UPGRADE},
};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use thiserror::Error;

use crate::{
    dispatch::TunnelTarget,
    host::Host,
    tunnel::{BoxError, ProxyBody, TunnelClient, TunnelError},
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single hop and never cross the proxy.
static HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    UPGRADE,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid tunnel request path: {0}")]
    Path(#[from] http::uri::InvalidUri),
    #[error("tunnel to {peer} failed")]
    Upstream {
        peer: libp2p::PeerId,
        #[source]
        source: TunnelError,
    },
    #[error("upstream switched to {got:?} but client asked for {want:?}")]
    UpgradeMismatch { want: Option<String>, got: Option<String> },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Path(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream { .. } | ProxyError::UpgradeMismatch { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// This error and all of its sources, joined by `": "`.
    pub fn chain(&self) -> String {
        let mut chain = String::new();
        let mut err: Option<&dyn std::error::Error> = Some(self);
        while let Some(e) = err {
            if !chain.is_empty() {
                chain.push_str(": ");
            }
            chain.push_str(&e.to_string());
            err = e.source();
        }
        chain
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        text_response(self.status(), self.chain())
    }
}

pub fn text_response(status: StatusCode, text: impl Into<String>) -> Response<ProxyBody> {
    let mut text = text.into();
    text.push('\n');
    let mut res = Response::new(full_body(text));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res.headers_mut()
        .insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    res
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Forward `req` to `target` through `client` and hand back the upstream
/// response. Bodies are streamed in both directions; a `101` response is
/// bridged into a raw byte pipe between the two upgraded connections.
pub async fn forward<H, B>(
    client: &TunnelClient<H>,
    target: &TunnelTarget,
    mut req: Request<B>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError>
where
    H: Host,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let want_upgrade = upgrade_type(req.headers());
    let client_upgrade = want_upgrade
        .is_some()
        .then(|| hyper::upgrade::on(&mut req));

    let inbound_host = inbound_host(&req);
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{query}", target.rest),
        None => target.rest.clone(),
    };
    let uri: http::Uri = path_and_query.parse()?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    rewrite_request_headers(&mut parts.headers, inbound_host.as_deref(), client_addr);
    if let Some(kind) = &want_upgrade {
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::from_str(kind) {
            parts.headers.insert(UPGRADE, value);
        }
    }
    let outbound = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());

    let mut res = client
        .request(target.peer, outbound)
        .await
        .map_err(|source| ProxyError::Upstream {
            peer: target.peer,
            source,
        })?;

    if res.status() == StatusCode::SWITCHING_PROTOCOLS {
        let got = upgrade_type(res.headers());
        let client_upgrade = match (client_upgrade, &got) {
            (Some(upgrade), Some(got_kind))
                if want_upgrade
                    .as_deref()
                    .is_some_and(|want| want.eq_ignore_ascii_case(got_kind)) =>
            {
                upgrade
            }
            _ => {
                return Err(ProxyError::UpgradeMismatch {
                    want: want_upgrade,
                    got,
                });
            }
        };
        let upstream_upgrade = hyper::upgrade::on(&mut res);
        let peer = target.peer;
        tokio::spawn(async move {
            if let Err(e) = bridge_upgrade(client_upgrade, upstream_upgrade).await {
                tracing::warn!(%peer, error = %e, "upgraded tunnel failed");
            }
        });
        let (parts, _) = res.into_parts();
        return Ok(Response::from_parts(parts, full_body(Bytes::new())));
    }

    strip_hop_by_hop(res.headers_mut());
    Ok(res)
}

async fn bridge_upgrade(
    client: hyper::upgrade::OnUpgrade,
    upstream: hyper::upgrade::OnUpgrade,
) -> Result<(), BoxError> {
    let (client, upstream) = tokio::try_join!(client, upstream)?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    tracing::debug!(to_upstream, to_client, "upgraded tunnel closed");
    Ok(())
}

fn inbound_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// The protocol named in `Upgrade`, if `Connection` asks for one.
fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    match wants_upgrade {
        true => headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        false => None,
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn rewrite_request_headers(headers: &mut HeaderMap, host: Option<&str>, client_addr: SocketAddr) {
    strip_hop_by_hop(headers);

    // Client-supplied forwarding headers are never trusted.
    headers.remove(&X_FORWARDED_FOR);
    headers.remove(&X_FORWARDED_HOST);
    headers.remove(&X_FORWARDED_PROTO);
    headers.remove("forwarded");

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = host
        && let Ok(value) = HeaderValue::from_str(host)
    {
        headers.insert(X_FORWARDED_HOST, value.clone());
        headers.insert(HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
