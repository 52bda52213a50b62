use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prism_proxy::{ProxyConfig, ProxyServer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct ProxyFixture {
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
    blocklist_path: PathBuf,
}

impl Drop for ProxyFixture {
    fn drop(&mut self) {
        self.task.abort();
        let _ = fs::remove_file(&self.blocklist_path);
    }
}

fn unique_blocklist_path() -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
    std::env::temp_dir().join(format!(
        "prism-plaintext-blocklist-{}-{}",
        std::process::id(),
        now.as_nanos()
    ))
}

async fn start_proxy(blocklist: &str) -> ProxyFixture {
    let blocklist_path = unique_blocklist_path();
    fs::write(&blocklist_path, blocklist).expect("write blocklist");

    let config = ProxyConfig {
        blocklist_path: blocklist_path.to_string_lossy().to_string(),
        ..ProxyConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy addr");
    let task = tokio::spawn(Arc::new(ProxyServer::new(config, None)).serve(listener));

    ProxyFixture {
        addr,
        task,
        blocklist_path,
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head byte");
        assert!(read > 0, "stream closed before header terminator");
        head.push(byte[0]);
    }
    head
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwards_plaintext_get_byte_for_byte() {
    let origin_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin listener");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    let origin_task = tokio::spawn(async move {
        let (mut origin, _) = origin_listener.accept().await.expect("accept origin");
        let head = read_head(&mut origin).await;
        origin
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .expect("write response");
        origin.shutdown().await.expect("shutdown origin");
        head
    });

    let proxy = start_proxy("").await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");

    let forwarded = origin_task.await.expect("origin task");
    assert_eq!(forwarded, request.as_bytes(), "request must be relayed verbatim");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_host_gets_403_and_no_origin_socket() {
    let origin_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin listener");
    let origin_addr = origin_listener.local_addr().expect("origin addr");

    let proxy = start_proxy("127.0.0.1\n").await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");
    assert!(text.contains("Access to 127.0.0.1 has been restricted"), "{text}");

    let no_connection =
        tokio::time::timeout(Duration::from_millis(200), origin_listener.accept()).await;
    assert!(
        no_connection.is_err(),
        "blocked request must not open an origin socket"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocklist_match_is_case_insensitive() {
    let proxy = start_proxy("EXAMPLE.test\n").await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");
    assert!(text.contains("example.test"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_line_closes_without_a_response() {
    let proxy = start_proxy("").await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    client
        .write_all(b"GARBAGE\r\n\r\n")
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read until close");
    assert!(response.is_empty(), "malformed request must close silently");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn origin_dial_failure_closes_silently() {
    // Bind then drop to get a port that refuses connections.
    let dead_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind dead listener");
    let dead_port = dead_listener.local_addr().expect("dead addr").port();
    drop(dead_listener);

    let proxy = start_proxy("").await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{dead_port}\r\n\r\n");
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read until close");
    assert!(response.is_empty(), "dial failure must close without a response");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accept_loop_survives_bad_connections() {
    let origin_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin listener");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    let origin_task = tokio::spawn(async move {
        let (mut origin, _) = origin_listener.accept().await.expect("accept origin");
        read_head(&mut origin).await;
        origin
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .expect("write response");
        origin.shutdown().await.expect("shutdown origin");
    });

    let proxy = start_proxy("").await;

    // A connection that dies mid-preamble must not hurt the next one.
    let mut broken = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    broken.write_all(b"GE").await.expect("write partial");
    broken.shutdown().await.expect("shutdown partial");
    drop(broken);

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{port}/ok HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    assert!(
        response.starts_with(b"HTTP/1.1 204 No Content"),
        "accept loop must keep serving after a failed connection"
    );

    origin_task.await.expect("origin task");
}
