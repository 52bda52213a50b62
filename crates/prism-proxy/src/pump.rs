//! Duplex pump: moves bytes in both directions between two streams until
//! both halves close.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::timeouts::{self, IO_CHUNK_SIZE};

/// Spawns one copy task per direction and returns once both have
/// finished. Neither direction's failure aborts the other; a closed
/// direction half-closes its peer's write side so in-flight bytes on the
/// opposite direction still drain.
pub(crate) async fn run<A, B>(client: A, origin: B, idle_timeout: Duration) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let upstream = tokio::spawn(copy_direction(
        client_read,
        origin_write,
        "client_to_origin",
        idle_timeout,
    ));
    let downstream = tokio::spawn(copy_direction(
        origin_read,
        client_write,
        "origin_to_client",
        idle_timeout,
    ));

    let (from_client, from_origin) = tokio::join!(upstream, downstream);
    (from_client.unwrap_or_default(), from_origin.unwrap_or_default())
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: &'static str,
    idle_timeout: Duration,
) -> u64
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = [0_u8; IO_CHUNK_SIZE];
    let mut copied = 0_u64;

    loop {
        let read = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => read,
            Ok(Err(error)) => {
                debug!(direction, error = %error, "tunnel direction read failed");
                break;
            }
            Err(_) => {
                debug!(direction, "tunnel direction idle timeout");
                break;
            }
        };
        match tokio::time::timeout(idle_timeout, writer.write_all(&buf[..read])).await {
            Ok(Ok(())) => copied += read as u64,
            Ok(Err(error)) => {
                debug!(direction, error = %error, "tunnel direction write failed");
                break;
            }
            Err(_) => {
                debug!(direction, "tunnel direction write idle timeout");
                break;
            }
        }
    }

    // Half-close: the peer may still be sending in the other direction.
    match writer.shutdown().await {
        Ok(()) => {}
        Err(error) if timeouts::ignored_shutdown_error(&error) => {}
        Err(error) => debug!(direction, error = %error, "tunnel direction shutdown failed"),
    }
    copied
}
