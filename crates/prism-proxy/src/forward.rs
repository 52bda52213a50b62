//! Plaintext HTTP forwarding: parse one request, relay it verbatim, relay
//! one response verbatim.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::responses;
use crate::timeouts::with_deadline;
use crate::ProxyServer;

pub(crate) async fn handle_http<D>(server: &ProxyServer, downstream: D, client_addr: SocketAddr)
where
    D: AsyncRead + AsyncWrite + Unpin,
{
    let idle = server.idle_timeout();
    let mut client = BufReader::new(downstream);

    let request = match with_deadline("request parse", idle, prism_http::read_request(&mut client))
        .await
    {
        Ok(request) => request,
        Err(error) => {
            error!(client = %client_addr, error = %error, "failed to parse http request");
            return;
        }
    };

    if server.host_is_blocked(&request.host, client_addr) {
        if let Err(error) = with_deadline(
            "forbidden response write",
            idle,
            responses::write_forbidden(&mut client, &request.host),
        )
        .await
        {
            error!(client = %client_addr, error = %error, "failed to send 403 response");
        }
        return;
    }

    info!(
        method = %request.method,
        host = %request.host,
        target = %request.target,
        client = %client_addr,
        "http request"
    );

    let mut origin = match with_deadline(
        "origin dial",
        idle,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            error!(host = %request.host, port = request.port, error = %error, "failed to connect to origin");
            return;
        }
    };

    if let Err(error) = with_deadline("request forward", idle, origin.write_all(&request.raw)).await
    {
        error!(host = %request.host, error = %error, "failed to forward request");
        return;
    }

    let mut origin_reader = BufReader::new(origin);
    let response = match with_deadline(
        "response parse",
        idle,
        prism_http::read_response(&mut origin_reader),
    )
    .await
    {
        Ok(response) => response,
        Err(error) => {
            error!(host = %request.host, error = %error, "failed to parse origin response");
            return;
        }
    };

    info!(
        protocol = %response.protocol,
        status = response.status_code,
        host = %request.host,
        "http response"
    );

    if let Err(error) =
        with_deadline("response forward", idle, client.write_all(&response.raw)).await
    {
        error!(client = %client_addr, error = %error, "failed to forward response");
    }
}
