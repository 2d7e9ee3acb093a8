use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

/// Connect timeout for backend dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive period applied to dialed backend sockets.
pub const DIAL_KEEPALIVE: Duration = Duration::from_secs(30);

/// Literal tunnel-established response, preserved verbatim on the raw
/// TCP path.
pub(crate) const HTTP_200_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

pub(crate) const HTTP_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Dial a backend over TCP. The address may resolve to several targets;
/// they are tried in order within a single connect timeout.
pub async fn dial(addr: &str) -> io::Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, format!("dial {addr} timed out")))??;
    set_keepalive(&stream, DIAL_KEEPALIVE)?;
    Ok(stream)
}

/// Enable TCP keepalive with the given period on a connected socket.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Bind a listener with `SO_REUSEADDR`.
pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Accept errors that are worth retrying with backoff instead of
/// tearing the listener down.
pub(crate) fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Best-effort `502 Bad Gateway` on a socket that may already be gone.
pub(crate) async fn write_bad_gateway<W>(writer: &mut W)
where
    W: AsyncWriteExt + Unpin,
{
    let _ = writer.write_all(HTTP_502).await;
    let _ = writer.flush().await;
}
