//! Library-mode proxy: plain HTTP is forwarded through a shared upstream
//! client, `CONNECT` is either tunneled opaquely or terminated locally
//! against a masqueraded certificate so the inner request can be reissued.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{header, HeaderValue, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_rustls::builderstates::WantsSchemes;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::connect::{ProxyConnector, TimeoutConnect};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::{copy, net, tls};

/// Bound on TLS handshakes: the inbound intercept accept, and the whole
/// outbound dial-plus-handshake via [`TimeoutConnect`].
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Body = BoxBody<Bytes, hyper::Error>;

/// Shared upstream transport; owns its connection pool and is safe for
/// concurrent round-trips.
pub type UpstreamClient = Client<TimeoutConnect<HttpsConnector<ProxyConnector>>, Incoming>;

/// The interception snapshot: swapped in whole by [`ProxyHandler::set_cert`]
/// so a CONNECT in flight sees either the old or the new pair, never a
/// torn mix.
struct Mitm {
    tls: Arc<ServerConfig>,
    hosts: HashSet<String>,
}

/// HTTP proxy handler. Cheap to clone; all state lives behind an `Arc`.
#[derive(Clone)]
pub struct ProxyHandler {
    inner: Arc<Inner>,
}

struct Inner {
    client: UpstreamClient,
    pool: BufferPool,
    mitm: RwLock<Option<Arc<Mitm>>>,
}

impl ProxyHandler {
    /// Handler with the default upstream transport: native roots, ALPN
    /// `http/1.1` + `h2`, ambient proxy environment honoured.
    pub fn new() -> Result<Self> {
        let tls = HttpsConnectorBuilder::new().with_native_roots()?;
        Ok(Self::with_client(build_client(tls)))
    }

    /// Handler whose upstream transport trusts caller-pinned roots; used
    /// by tests and embedders.
    pub fn with_tls_config(tls: ClientConfig) -> Self {
        Self::with_client(build_client(HttpsConnectorBuilder::new().with_tls_config(tls)))
    }

    /// Handler over a caller-supplied upstream transport.
    pub fn with_client(client: UpstreamClient) -> Self {
        ProxyHandler {
            inner: Arc::new(Inner {
                client,
                pool: BufferPool::new(),
                mitm: RwLock::new(None),
            }),
        }
    }

    /// Load a PEM cert/key pair and swap in the new TLS configuration and
    /// host allowlist atomically.
    pub fn set_cert(
        &self,
        hosts: &[String],
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_file = cert_file.as_ref();
        let key_file = key_file.as_ref();
        if hosts.is_empty() || cert_file.as_os_str().is_empty() || key_file.as_os_str().is_empty()
        {
            return Err(Error::InvalidCert);
        }
        let config = tls::mitm_server_config(cert_file, key_file)?;
        let mitm = Arc::new(Mitm {
            tls: Arc::new(config),
            hosts: hosts.iter().cloned().collect(),
        });
        *self.inner.mitm.write() = Some(mitm);
        Ok(())
    }

    /// Current interception snapshot, if `host` is on the allowlist.
    fn mitm_for(&self, host: &str) -> Option<Arc<Mitm>> {
        let guard = self.inner.mitm.read();
        guard.as_ref().filter(|m| m.hosts.contains(host)).cloned()
    }

    pub(crate) async fn serve_request(
        self,
        peer: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<Body>> {
        tracing::debug!("request from {peer}: {} {}", req.method(), req.uri());

        if Method::CONNECT == req.method() {
            return self.connect(req);
        }

        tracing::info!("{} {}", req.method(), req.uri());
        match self.inner.client.request(req).await {
            Ok(res) => Ok(res.map(|b| b.boxed())),
            Err(err) => {
                tracing::warn!("upstream error: {err}");
                Ok(bad_gateway())
            }
        }
    }

    /// CONNECT dispatch: commandeer the socket via the upgrade mechanism,
    /// then either tunnel bytes opaquely or terminate TLS locally.
    fn connect(self, req: Request<Incoming>) -> Result<Response<Body>> {
        let authority = match req.uri().authority().filter(|a| a.port().is_some()) {
            Some(authority) => authority.clone(),
            None => {
                tracing::warn!("CONNECT target is not host:port: {:?}", req.uri());
                return Ok(bad_gateway());
            }
        };

        let mitm = self.mitm_for(authority.host());
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let res = match mitm {
                        Some(mitm) => self.intercept(mitm, authority, io).await,
                        None => self.tunnel(authority.as_str(), io).await,
                    };
                    if let Err(err) = res {
                        tracing::warn!("connect error: {err}");
                    }
                }
                Err(err) => tracing::warn!("upgrade error: {err}"),
            }
        });

        Ok(Response::new(empty()))
    }

    /// Opaque byte tunnel to `addr`.
    async fn tunnel<S>(&self, addr: &str, mut io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("connect tunnel {addr}");
        let mut backend = match net::dial(addr).await {
            Ok(backend) => backend,
            Err(err) => {
                net::write_bad_gateway(&mut io).await;
                return Err(err.into());
            }
        };
        let mut buf = self.inner.pool.get();
        match copy::copy_duplex(&mut io, &mut backend, &mut buf).await {
            Ok(copied) => tracing::debug!("tunnel {addr} done after {copied} bytes"),
            Err(err) => {
                net::write_bad_gateway(&mut io).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Terminate TLS against the masqueraded certificate, read exactly one
    /// HTTP/1.1 request and reissue it upstream. Keep-alive is cut short
    /// with `Connection: close`; a client that negotiated h2 fails the
    /// HTTP/1.1 parse and the session ends there.
    async fn intercept<S>(&self, mitm: Arc<Mitm>, authority: Authority, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("connect intercept {authority}");
        let acceptor = TlsAcceptor::from(mitm.tls.clone());
        let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(io))
            .await
            .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;

        let client = self.inner.client.clone();
        hyper::server::conn::http1::Builder::new()
            .serve_connection(
                TokioIo::new(tls_stream),
                service_fn(move |req| {
                    forward_intercepted(client.clone(), authority.clone(), req)
                }),
            )
            .await?;
        Ok(())
    }
}

/// Assemble the upstream transport: ambient-proxy TCP dial, TLS with the
/// given roots, one deadline over dial plus handshake, and a pool of 100
/// idle connections kept for 90 s.
fn build_client(tls: HttpsConnectorBuilder<WantsSchemes>) -> UpstreamClient {
    let https = tls
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(ProxyConnector::from_env());
    let connector = TimeoutConnect::new(https, TLS_HANDSHAKE_TIMEOUT);
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_timer(TokioTimer::new())
        .http1_title_case_headers(true)
        .http1_preserve_header_case(true)
        .build(connector)
}

/// Reissue an intercepted request to the origin over the shared upstream
/// transport.
async fn forward_intercepted(
    client: UpstreamClient,
    authority: Authority,
    req: Request<Incoming>,
) -> Result<Response<Body>> {
    let (mut parts, body) = req.into_parts();
    let mut uri = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority.clone());
    uri = match parts.uri.path_and_query() {
        Some(path_and_query) => uri.path_and_query(path_and_query.clone()),
        None => uri.path_and_query("/"),
    };
    parts.uri = uri.build()?;

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    match client.request(Request::from_parts(parts, body)).await {
        Ok(res) => {
            tracing::info!("{} {} {}", method, uri, res.status());
            let mut res = res.map(|b| b.boxed());
            res.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            Ok(res)
        }
        Err(err) => {
            tracing::warn!("intercepted round-trip failed: {err}");
            let mut res = bad_gateway();
            res.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            Ok(res)
        }
    }
}

/// Accept loop for the library proxy; one hyper connection per client
/// socket, upgrades enabled for CONNECT.
pub async fn serve(listener: TcpListener, handler: ProxyHandler) -> Result<()> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .title_case_headers(true)
        .preserve_header_case(true);

    loop {
        let (stream, peer) = accept(&listener).await;
        let handler = handler.clone();
        let builder = builder.clone();
        tokio::spawn(async move {
            if let Err(err) = builder
                .serve_connection_with_upgrades(
                    TokioIo::new(stream),
                    service_fn(move |req| handler.clone().serve_request(peer, req)),
                )
                .await
            {
                tracing::debug!("failed to serve connection: {err:?}");
            }
        });
    }
}

async fn accept(listener: &TcpListener) -> (tokio::net::TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(pair) => return pair,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

fn bad_gateway() -> Response<Body> {
    let mut res = Response::new(full("502 Bad Gateway"));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
