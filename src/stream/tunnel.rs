//! HTTP CONNECT tunnelling, used to carry TLS through an HTTP proxy.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::proxy::ProxySettings;
use crate::url::basic_auth_token;

const MAX_REPLY: usize = 8 * 1024;

/// A TCP stream to an HTTP proxy on which a CONNECT tunnel has been
/// established.
#[derive(Debug)]
pub struct TunnelStream {
    inner: TcpStream,
}

impl TunnelStream {
    pub(crate) async fn handshake(
        mut inner: TcpStream,
        proxy: &ProxySettings,
        target: SocketAddr,
    ) -> io::Result<Self> {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if proxy.has_credentials() {
            let token = basic_auth_token(&format!("{}:{}", proxy.username, proxy.password));
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(&token);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        inner.write_all(request.as_bytes()).await?;

        // The origin stays silent until we speak, so reading in chunks up
        // to the blank line cannot swallow tunnelled bytes.
        let mut reply = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];
        loop {
            let n = inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed during CONNECT",
                ));
            }
            reply.extend_from_slice(&chunk[..n]);
            if reply.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if reply.len() > MAX_REPLY {
                return Err(io::Error::other("oversized CONNECT reply"));
            }
        }

        let status = connect_status(&reply)?;
        if !(200..300).contains(&status) {
            return Err(io::Error::other(format!(
                "proxy refused CONNECT with status {status}"
            )));
        }

        trace!(%target, "connect tunnel established");
        Ok(Self { inner })
    }
}

fn connect_status(reply: &[u8]) -> io::Result<u16> {
    let malformed = || io::Error::other("malformed CONNECT reply");
    let line_end = reply
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(malformed)?;
    let line = std::str::from_utf8(&reply[..line_end]).map_err(|_| malformed())?;
    let mut parts = line.split_whitespace();
    if !parts.next().is_some_and(|version| version.starts_with("HTTP/")) {
        return Err(malformed());
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(malformed)
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
