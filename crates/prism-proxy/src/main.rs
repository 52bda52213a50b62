use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use prism_proxy::{ProxyConfig, ProxyServer};
use prism_tls::RootAuthority;
use tokio::net::TcpListener;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match env::args().nth(1) {
        Some(path) => match ProxyConfig::load_json(&path) {
            Ok(config) => config,
            Err(error) => {
                error!(error = %error, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };

    let root = match RootAuthority::load(&config.ca_cert_path, &config.ca_key_path) {
        Ok(root) => Some(Arc::new(root)),
        Err(error) => {
            warn!(error = %error, "root CA unavailable, CONNECT interception disabled");
            None
        }
    };

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %config.listen_addr, error = %error, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = Arc::new(ProxyServer::new(config, root)).serve(listener).await {
        error!(error = %error, "proxy server terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
