//! CONNECT handling: terminate TLS from the client with a freshly minted
//! leaf, open a second TLS session to the real origin, and pump decrypted
//! bytes between the two.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info};

use crate::timeouts::with_deadline;
use crate::{pump, responses, ProxyServer};

const MAX_CONNECT_HEAD_BYTES: usize = 64 * 1024;

pub(crate) async fn handle_connect(
    server: &ProxyServer,
    mut downstream: TcpStream,
    client_addr: SocketAddr,
    preamble: Vec<u8>,
) {
    let idle = server.idle_timeout();

    let head = match read_connect_head(&mut downstream, preamble, idle).await {
        Ok(head) => head,
        Err(error) => {
            error!(client = %client_addr, error = %error, "failed to read CONNECT head");
            return;
        }
    };
    let target = match prism_http::parse_connect(&head) {
        Ok(target) => target,
        Err(error) => {
            error!(client = %client_addr, error = %error, "failed to parse CONNECT request");
            return;
        }
    };

    info!(host = %target.host, port = target.port, client = %client_addr, "connect received");

    if server.host_is_blocked(&target.host, client_addr) {
        if let Err(error) = with_deadline(
            "forbidden response write",
            idle,
            responses::write_forbidden(&mut downstream, &target.host),
        )
        .await
        {
            error!(client = %client_addr, error = %error, "failed to send 403 response");
        }
        return;
    }

    let Some(root) = server.root_authority() else {
        error!(host = %target.host, "certificate authority unavailable, closing connect flow");
        return;
    };

    // The origin dial happens before the 200 acknowledgement so a dead
    // origin becomes a 502 instead of a stalled tunnel.
    let origin_tcp = match with_deadline(
        "origin dial",
        idle,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            error!(host = %target.host, port = target.port, error = %error, "failed to connect to origin");
            if let Err(error) = downstream.write_all(responses::BAD_GATEWAY).await {
                debug!(client = %client_addr, error = %error, "failed to send 502 response");
            }
            return;
        }
    };

    if let Err(error) = with_deadline(
        "connect ack",
        idle,
        downstream.write_all(responses::CONNECTION_ESTABLISHED),
    )
    .await
    {
        error!(client = %client_addr, error = %error, "failed to send 200 response");
        return;
    }

    // Keygen and signing are CPU-bound; keep them off the reactor threads.
    let minted = {
        let root = Arc::clone(root);
        let domain = target.host.clone();
        match tokio::task::spawn_blocking(move || root.mint(&domain)).await {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(error)) => {
                error!(host = %target.host, error = %error, "failed to mint leaf certificate");
                return;
            }
            Err(error) => {
                error!(host = %target.host, error = %error, "leaf minting task failed");
                return;
            }
        }
    };
    let server_config = match prism_tls::server_config_for_leaf(root, minted) {
        Ok(config) => config,
        Err(error) => {
            error!(host = %target.host, error = %error, "failed to build server tls config");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(server_config);
    let client_tls = match with_deadline("client tls handshake", idle, acceptor.accept(downstream))
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            error!(host = %target.host, client = %client_addr, error = %error, "client tls handshake failed");
            return;
        }
    };

    let connector = TlsConnector::from(server.origin_tls_config());
    let server_name = match ServerName::try_from(target.host.clone()) {
        Ok(name) => name,
        Err(error) => {
            error!(host = %target.host, error = %error, "invalid origin server name");
            return;
        }
    };
    let origin_tls = match with_deadline(
        "origin tls handshake",
        idle,
        connector.connect(server_name, origin_tcp),
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            error!(host = %target.host, error = %error, "origin tls handshake failed");
            return;
        }
    };

    info!(host = %target.host, client = %client_addr, "mitm tunnel established");

    let (from_client, from_origin) = pump::run(client_tls, origin_tls, idle).await;
    debug!(host = %target.host, from_client, from_origin, "tunnel closed");
}

/// Reads the CONNECT head byte by byte so nothing past the CRLFCRLF
/// boundary is consumed; the next bytes on the wire belong to the
/// client's TLS handshake.
async fn read_connect_head(
    stream: &mut TcpStream,
    preamble: Vec<u8>,
    idle: Duration,
) -> io::Result<Vec<u8>> {
    with_deadline("connect head read", idle, async {
        let mut head = preamble;
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let read = stream.read(&mut byte).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before CONNECT headers completed",
                ));
            }
            head.push(byte[0]);
            if head.len() > MAX_CONNECT_HEAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "CONNECT header exceeded configured limit",
                ));
            }
        }
        Ok(head)
    })
    .await
}
