//! Intercepting HTTP/HTTPS forward proxy.
//!
//! Plaintext requests are parsed once and relayed verbatim. CONNECT
//! requests get the full MITM treatment: the proxy terminates TLS from
//! the client with a leaf minted under the local root CA, opens its own
//! TLS session to the origin, and pumps decrypted bytes between the two.
//! Both paths consult the blocklist before any origin socket is opened.

mod bridge;
pub mod config;
mod forward;
mod pump;
mod responses;
mod rewind;
mod timeouts;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prism_policy::{FileBlocklist, HostPolicy};
use prism_tls::RootAuthority;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ClientConfig;
use tracing::{error, info, warn};

pub use config::{ConfigError, ProxyConfig};

const PREAMBLE_LEN: usize = 7;

pub struct ProxyServer {
    config: ProxyConfig,
    blocklist: FileBlocklist,
    root: Option<Arc<RootAuthority>>,
    origin_tls: Arc<ClientConfig>,
}

impl ProxyServer {
    /// `root` may be absent; plaintext forwarding then still works while
    /// CONNECT flows are closed with an error.
    pub fn new(config: ProxyConfig, root: Option<Arc<RootAuthority>>) -> Self {
        let blocklist = FileBlocklist::new(&config.blocklist_path);
        let origin_tls = prism_tls::client_config(config.upstream_tls_insecure_skip_verify);
        Self {
            config,
            blocklist,
            root,
            origin_tls,
        }
    }

    /// Accepts connections forever, one task per connection. Accept
    /// errors are logged and never stop the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "proxy server started");

        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, client_addr).await;
                    });
                }
                Err(error) => {
                    error!(error = %error, "failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, client_addr: SocketAddr) {
        let mut preamble = [0_u8; PREAMBLE_LEN];
        let read: std::io::Result<()> =
            timeouts::with_deadline("preamble read", self.idle_timeout(), async {
                stream.read_exact(&mut preamble).await.map(|_| ())
            })
            .await;
        if let Err(error) = read {
            error!(client = %client_addr, error = %error, "failed to read connection preamble");
            return;
        }

        if preamble == *b"CONNECT" {
            bridge::handle_connect(self, stream, client_addr, preamble.to_vec()).await;
        } else {
            let downstream = rewind::Rewound::new(preamble.to_vec(), stream);
            forward::handle_http(self, downstream, client_addr).await;
        }
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    pub(crate) fn root_authority(&self) -> Option<&Arc<RootAuthority>> {
        self.root.as_ref()
    }

    pub(crate) fn origin_tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.origin_tls)
    }

    // Fail-open: an unreadable blocklist must not deny all traffic.
    pub(crate) fn host_is_blocked(&self, host: &str, client_addr: SocketAddr) -> bool {
        match self.blocklist.is_blocked(host) {
            Ok(true) => {
                warn!(host = %host, client = %client_addr, "blocked host accessed");
                true
            }
            Ok(false) => false,
            Err(error) => {
                error!(error = %error, "blocklist check failed");
                false
            }
        }
    }
}
