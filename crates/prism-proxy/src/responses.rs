use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const FORBIDDEN_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Access Denied</title>
    <style>
        body { font-family: Arial, sans-serif; text-align: center; padding: 50px; }
        h1 { color: #d9534f; }
    </style>
</head>
<body>
    <h1>403 Forbidden</h1>
    <p>Access to ${domain} has been restricted by the administrator.</p>
</body>
</html>"#;

pub(crate) fn forbidden_response(domain: &str) -> Vec<u8> {
    let html = FORBIDDEN_HTML_TEMPLATE.replace("${domain}", domain);
    format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{html}",
        html.len()
    )
    .into_bytes()
}

pub(crate) async fn write_forbidden<W>(writer: &mut W, domain: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&forbidden_response(domain)).await?;
    writer.flush().await
}
