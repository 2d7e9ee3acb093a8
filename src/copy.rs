use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Full-duplex byte pump between a client and a backend stream.
///
/// The pooled buffer is split in half, one half per direction, and the two
/// copy loops race: the first direction to finish (clean EOF or error)
/// wins and the other is dropped mid-flight. Callers drop both streams on
/// return, which unblocks whatever the losing direction was doing.
///
/// Returns the byte count moved by the direction that finished first.
pub async fn copy_duplex<A, B>(user: A, backend: B, buf: &mut [u8]) -> io::Result<u64>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (buf_up, buf_down) = buf.split_at_mut(buf.len() / 2);
    let (mut user_rd, mut user_wr) = tokio::io::split(user);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let to_backend = copy_half(&mut user_rd, &mut backend_wr, buf_up);
    let from_backend = copy_half(&mut backend_rd, &mut user_wr, buf_down);
    tokio::pin!(to_backend, from_backend);

    tokio::select! {
        res = &mut to_backend => res,
        res = &mut from_backend => res,
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(copied);
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}
