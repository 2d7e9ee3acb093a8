//! Outbound connector stack for the upstream transport: ambient-proxy
//! routing from the environment, and a deadline covering the dial plus
//! any TLS handshake layered on top.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower_service::Service;

use crate::net;

const MAX_PROXY_HEAD_BYTES: usize = 8 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// TCP connector that honours the ambient proxy environment.
///
/// Targets routed through `HTTP_PROXY`/`HTTPS_PROXY` are reached with a
/// CONNECT tunnel to the proxy, so TLS layered on top still handshakes
/// with the real origin. `NO_PROXY` exempts hosts: exact match, domain
/// suffix, or `*` for everything. TLS to the proxy hop itself and proxy
/// authentication are not supported.
#[derive(Clone)]
pub struct ProxyConnector {
    http_proxy: Option<String>,
    https_proxy: Option<String>,
    no_proxy: Vec<String>,
}

impl ProxyConnector {
    /// Read `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` (and their lowercase
    /// forms) once, at construction.
    pub fn from_env() -> Self {
        let no_proxy = std::env::var("NO_PROXY")
            .or_else(|_| std::env::var("no_proxy"))
            .map(|value| {
                value
                    .split(',')
                    .map(|p| p.trim().trim_start_matches('.').to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        ProxyConnector {
            http_proxy: proxy_from_env(&["HTTP_PROXY", "http_proxy"]),
            https_proxy: proxy_from_env(&["HTTPS_PROXY", "https_proxy"]),
            no_proxy,
        }
    }

    /// A connector that never consults the environment.
    pub fn direct() -> Self {
        ProxyConnector {
            http_proxy: None,
            https_proxy: None,
            no_proxy: Vec::new(),
        }
    }

    /// Explicit proxy configuration; used by tests and embedders.
    pub fn with_proxies(
        http_proxy: Option<String>,
        https_proxy: Option<String>,
        no_proxy: Vec<String>,
    ) -> Self {
        ProxyConnector {
            http_proxy,
            https_proxy,
            no_proxy,
        }
    }

    fn proxy_for(&self, scheme: Option<&str>, host: &str) -> Option<&str> {
        if self.exempt(host) {
            return None;
        }
        match scheme {
            Some("https") => self.https_proxy.as_deref(),
            _ => self.http_proxy.as_deref(),
        }
    }

    fn exempt(&self, host: &str) -> bool {
        self.no_proxy.iter().any(|pattern| {
            if pattern == "*" || host == pattern {
                return true;
            }
            host.len() > pattern.len()
                && host.ends_with(pattern.as_str())
                && host.as_bytes()[host.len() - pattern.len() - 1] == b'.'
        })
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = TokioIo<TcpStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<TokioIo<TcpStream>>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let host = dst
                .host()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "target has no host"))?;
            let port = dst
                .port_u16()
                .unwrap_or(if dst.scheme_str() == Some("https") { 443 } else { 80 });
            let target = if host.contains(':') {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            let stream = match this.proxy_for(dst.scheme_str(), host) {
                Some(proxy) => {
                    tracing::debug!("connect {target} via proxy {proxy}");
                    connect_tunnel(proxy, &target).await?
                }
                None => net::dial(&target).await?,
            };
            Ok(TokioIo::new(stream))
        })
    }
}

/// Reach `target` through an upstream HTTP proxy by establishing a
/// CONNECT tunnel first.
async fn connect_tunnel(proxy: &str, target: &str) -> io::Result<TcpStream> {
    let mut stream = net::dial(proxy).await?;
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;
    let head = read_proxy_head(&mut stream).await?;
    let status = proxy_status(&head)?;
    if status / 100 != 2 {
        return Err(io::Error::new(
            ErrorKind::ConnectionRefused,
            format!("upstream proxy CONNECT failed with status {status}"),
        ));
    }
    Ok(stream)
}

/// Read the proxy's response head byte by byte so nothing past the blank
/// line is consumed from the tunnel.
async fn read_proxy_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_PROXY_HEAD_BYTES {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "upstream proxy response head too large",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    Ok(head)
}

fn proxy_status(head: &[u8]) -> io::Result<u16> {
    let line = head.split(|&b| b == b'\r').next().unwrap_or(head);
    let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let status = fields
        .nth(1)
        .and_then(|f| std::str::from_utf8(f).ok())
        .and_then(|s| s.parse().ok());
    status.ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "malformed proxy response"))
}

fn proxy_from_env(names: &[&str]) -> Option<String> {
    for name in names {
        if let Ok(value) = std::env::var(name) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(normalize_proxy_addr(value));
            }
        }
    }
    None
}

/// Accepts `http://host:port/`, `host:port` and bare `host` (port 80).
/// Userinfo is dropped.
fn normalize_proxy_addr(value: &str) -> String {
    let addr = value
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let addr = addr.rsplit('@').next().unwrap_or(addr);
    let has_port = addr
        .rfind(':')
        .is_some_and(|i| i > addr.rfind(']').unwrap_or(0));
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:80")
    }
}

/// Connector wrapper applying one deadline to the inner connect,
/// covering the dial and the TLS handshake together.
#[derive(Clone)]
pub struct TimeoutConnect<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnect<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        TimeoutConnect { inner, timeout }
    }
}

impl<C> Service<Uri> for TimeoutConnect<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let deadline = self.timeout;
        let fut = self.inner.call(dst);
        Box::pin(async move {
            match tokio::time::timeout(deadline, fut).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => {
                    Err(io::Error::new(ErrorKind::TimedOut, "upstream connect timed out").into())
                }
            }
        })
    }
}
