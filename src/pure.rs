//! Pure-mode proxy: a standalone TCP listener that sniffs the request
//! line and `Host` header straight off the wire, without any HTTP
//! library, and tunnels bytes to the upstream named by that host. Bytes
//! already read while sniffing are replayed to the backend on
//! non-CONNECT requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::{copy, net};

const MAX_HEADER_BYTES: usize = 1 << 20;

/// Keepalive period applied to accepted client sockets.
const ACCEPT_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

/// A TCP proxy that forwards almost without touching the data.
///
/// Cloning shares the same server; `close` on any clone shuts the whole
/// thing down, closing the listener and every tracked connection.
#[derive(Clone, Default)]
pub struct PureProxy {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    in_shutdown: AtomicBool,
    next_conn_id: AtomicU64,
    active: Mutex<HashMap<u64, CancellationToken>>,
    done: CancellationToken,
    read_timeout: Option<Duration>,
    pool: BufferPool,
}

impl PureProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proxy that gives up on clients which do not produce a complete
    /// request head within `timeout`.
    pub fn with_read_timeout(timeout: Duration) -> Self {
        PureProxy {
            inner: Arc::new(Inner {
                read_timeout: Some(timeout),
                ..Inner::default()
            }),
        }
    }

    /// Listen on `addr` and serve until [`close`](Self::close) is called.
    /// Returns [`Error::ServerClosed`] once shut down, including on calls
    /// made after shutdown.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<()> {
        if self.shutting_down() {
            return Err(Error::ServerClosed);
        }
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.shutting_down() {
            return Err(Error::ServerClosed);
        }
        let mut backoff = Backoff::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.inner.done.cancelled() => return Err(Error::ServerClosed),
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(err) => {
                        if self.inner.done.is_cancelled() {
                            return Err(Error::ServerClosed);
                        }
                        if net::is_temporary(&err) {
                            let delay = backoff.next_delay();
                            tracing::warn!("accept error: {err}; retrying in {delay:?}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(err.into());
                    }
                },
            };
            backoff.reset();
            if let Err(err) = net::set_keepalive(&stream, ACCEPT_KEEPALIVE) {
                tracing::debug!("keepalive on {peer}: {err}");
            }

            let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let token = self.inner.done.child_token();
            self.track(id, Some(token.clone()));
            let conn = Conn {
                server: self.clone(),
                id,
            };
            tokio::spawn(conn.serve(stream, token));
        }
    }

    /// Immediately close the listener and every active connection.
    /// Idempotent under concurrent callers.
    pub fn close(&self) {
        self.inner.in_shutdown.store(true, Ordering::SeqCst);
        self.inner.done.cancel();
        let mut active = self.inner.active.lock();
        for (_, token) in active.drain() {
            token.cancel();
        }
    }

    fn shutting_down(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::SeqCst)
    }

    fn track(&self, id: u64, token: Option<CancellationToken>) {
        let mut active = self.inner.active.lock();
        match token {
            Some(token) => {
                active.insert(id, token);
            }
            None => {
                active.remove(&id);
            }
        }
    }
}

struct Conn {
    server: PureProxy,
    id: u64,
}

impl Conn {
    async fn serve(self, mut stream: TcpStream, token: CancellationToken) {
        let res = tokio::select! {
            _ = token.cancelled() => Ok(()),
            res = self.run(&mut stream) => res,
        };
        if let Err(err) = res {
            tracing::debug!("connection error: {err}");
            net::write_bad_gateway(&mut stream).await;
        }
        self.server.track(self.id, None);
    }

    async fn run(&self, stream: &mut TcpStream) -> Result<()> {
        let mut chunk = self.server.inner.pool.get_head();
        let head = match self.server.inner.read_timeout {
            Some(d) => timeout(d, read_head(stream, &mut chunk))
                .await
                .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??,
            None => read_head(stream, &mut chunk).await?,
        };
        tracing::info!(
            "{} {} {}",
            String::from_utf8_lossy(&head.method),
            String::from_utf8_lossy(&head.host),
            String::from_utf8_lossy(&head.request_uri),
        );

        let mut backend = net::dial(&head.dial_addr()).await?;

        if head.is_tls {
            // The backend sees nothing of the CONNECT request; discard the
            // remaining header lines and open the tunnel.
            drain_headers(stream, head.carryover, head.scanned, &mut chunk).await?;
            stream.write_all(net::HTTP_200_OK).await?;
        } else {
            backend.write_all(&head.carryover).await?;
        }
        drop(chunk);

        let mut buf = self.server.inner.pool.get();
        copy::copy_duplex(&mut *stream, &mut backend, &mut buf).await?;
        Ok(())
    }
}

/// Parsed request head plus every byte consumed while producing it.
#[derive(Debug)]
struct Head {
    method: Vec<u8>,
    host: Vec<u8>,
    request_uri: Vec<u8>,
    is_tls: bool,
    /// All bytes read from the client so far.
    carryover: Vec<u8>,
    /// Offset of the first unparsed byte in `carryover`.
    scanned: usize,
}

impl Head {
    /// CONNECT targets already carry a port; bare HTTP hosts default
    /// to 80.
    fn dial_addr(&self) -> String {
        let host = String::from_utf8_lossy(&self.host);
        if self.is_tls || host.rfind(':').is_some_and(|i| i > host.rfind(']').unwrap_or(0)) {
            host.into_owned()
        } else {
            format!("{host}:80")
        }
    }
}

/// Read the request head: the first line always, then header lines until
/// one yields a `Host`. CONNECT stops at the request line, which already
/// names the target.
async fn read_head<R>(reader: &mut R, chunk: &mut [u8]) -> Result<Head>
where
    R: AsyncRead + Unpin,
{
    let mut carryover: Vec<u8> = Vec::with_capacity(256);
    let mut scanned = 0usize;
    let mut method = Vec::new();
    let mut request_uri = Vec::new();
    let mut host = Vec::new();
    let mut is_tls = false;

    'read: loop {
        while let Some((line_len, consumed)) = next_line(&carryover[scanned..]) {
            let line_start = scanned;
            scanned += consumed;
            let line = &carryover[line_start..line_start + line_len];
            if method.is_empty() {
                let (m, uri) = parse_request_line(line)?;
                method = m.to_vec();
                if method == b"CONNECT" {
                    is_tls = true;
                    host = uri.to_vec();
                    request_uri = b"/".to_vec();
                    break 'read;
                }
                request_uri = uri.to_vec();
            } else {
                if line.is_empty() {
                    return Err(Error::MissingHost);
                }
                if let Some(h) = sniff_host(line) {
                    host = h.to_vec();
                    break 'read;
                }
            }
        }
        if carryover.len() > MAX_HEADER_BYTES {
            return Err(Error::HeadersTooLarge);
        }
        let n = reader.read(chunk).await?;
        if n == 0 {
            return Err(Error::MissingHost);
        }
        carryover.extend_from_slice(&chunk[..n]);
    }

    Ok(Head {
        method,
        host,
        request_uri,
        is_tls,
        carryover,
        scanned,
    })
}

/// Consume header lines up to and including the first empty one,
/// starting with any already sitting in the carryover.
async fn drain_headers<R>(
    reader: &mut R,
    mut cache: Vec<u8>,
    mut scanned: usize,
    chunk: &mut [u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        while let Some((line_len, consumed)) = next_line(&cache[scanned..]) {
            scanned += consumed;
            if line_len == 0 {
                return Ok(());
            }
        }
        if cache.len() > MAX_HEADER_BYTES {
            return Err(Error::HeadersTooLarge);
        }
        let n = reader.read(chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        cache.extend_from_slice(&chunk[..n]);
    }
}

/// Next complete line in `buf`: `(length without the line ending,
/// bytes consumed including the LF)`.
fn next_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    let mut end = lf;
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    Some((end, lf + 1))
}

/// `METHOD SP request-URI SP HTTP-version`. The last space delimits the
/// version suffix, so URIs containing spaces survive.
fn parse_request_line(line: &[u8]) -> Result<(&[u8], &[u8])> {
    let sp = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(Error::BadRequestLine)?;
    if sp == 0 {
        return Err(Error::BadRequestLine);
    }
    let method = &line[..sp];
    let rest = &line[sp + 1..];
    let last = rest
        .iter()
        .rposition(|&b| b == b' ')
        .ok_or(Error::BadRequestLine)?;
    if last == 0 {
        return Err(Error::BadRequestLine);
    }
    Ok((method, &rest[..last]))
}

/// Case-sensitive `Host` token followed by `": "`; the remainder of the
/// line is the host.
fn sniff_host(line: &[u8]) -> Option<&[u8]> {
    let pos = line.windows(4).position(|w| w == b"Host")?;
    let value = line[pos + 4..].strip_prefix(b": ")?;
    (!value.is_empty()).then_some(value)
}

/// Exponential accept backoff: 5 ms doubling to a 1 s cap, reset to the
/// start by any successful accept.
pub(crate) struct Backoff {
    delay: Option<Duration>,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    pub(crate) fn new() -> Self {
        Backoff { delay: None }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => Self::INITIAL,
            Some(delay) => (delay * 2).min(Self::MAX),
        };
        self.delay = Some(next);
        next
    }

    pub(crate) fn reset(&mut self) {
        self.delay = None;
    }
}
