//! SOCKS5 client handshake (RFC 1928, with RFC 1929 authentication).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::proxy::ProxySettings;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_NAME: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// The destination the proxy is asked to connect to: a resolved endpoint,
/// or a hostname when the proxy resolves names remotely.
#[derive(Debug, Clone)]
pub(crate) enum Socks5Target {
    Addr(SocketAddr),
    Name(String, u16),
}

/// A TCP stream that has completed a SOCKS5 CONNECT handshake; reads and
/// writes pass straight through to the tunnelled connection.
#[derive(Debug)]
pub struct Socks5Stream {
    inner: TcpStream,
}

impl Socks5Stream {
    pub(crate) async fn handshake(
        mut inner: TcpStream,
        proxy: &ProxySettings,
        target: &Socks5Target,
    ) -> io::Result<Self> {
        let method = if proxy.has_credentials() {
            AUTH_USERPASS
        } else {
            AUTH_NONE
        };
        inner.write_all(&[SOCKS_VERSION, 1, method]).await?;

        let mut chosen = [0u8; 2];
        inner.read_exact(&mut chosen).await?;
        if chosen[0] != SOCKS_VERSION || chosen[1] != method {
            return Err(other("proxy refused the authentication method"));
        }

        if method == AUTH_USERPASS {
            let user = proxy.username.as_bytes();
            let pass = proxy.password.as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(other("credentials too long for SOCKS5"));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user);
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass);
            inner.write_all(&msg).await?;

            let mut status = [0u8; 2];
            inner.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(other("proxy rejected the credentials"));
            }
        }

        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match target {
            Socks5Target::Addr(SocketAddr::V4(addr)) => {
                request.push(ATYP_V4);
                request.extend_from_slice(&addr.ip().octets());
                request.extend_from_slice(&addr.port().to_be_bytes());
            }
            Socks5Target::Addr(SocketAddr::V6(addr)) => {
                request.push(ATYP_V6);
                request.extend_from_slice(&addr.ip().octets());
                request.extend_from_slice(&addr.port().to_be_bytes());
            }
            Socks5Target::Name(host, port) => {
                if host.len() > 255 {
                    return Err(other("hostname too long for SOCKS5"));
                }
                request.push(ATYP_NAME);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
                request.extend_from_slice(&port.to_be_bytes());
            }
        }
        inner.write_all(&request).await?;

        let mut head = [0u8; 4];
        inner.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(other("malformed SOCKS5 reply"));
        }
        if head[1] != 0 {
            return Err(other(reply_message(head[1])));
        }
        // drain the bound address the proxy reports
        let addr_len = match head[3] {
            ATYP_V4 => 4,
            ATYP_V6 => 16,
            ATYP_NAME => {
                let mut len = [0u8; 1];
                inner.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(other("malformed SOCKS5 reply")),
        };
        let mut bound = vec![0u8; addr_len + 2];
        inner.read_exact(&mut bound).await?;

        trace!(?target, "socks5 tunnel established");
        Ok(Self { inner })
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused by destination",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 failure",
    }
}

fn other(message: &'static str) -> io::Error {
    io::Error::other(message)
}

impl AsyncRead for Socks5Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socks5Stream {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;
    use std::net::Ipv4Addr;

    async fn expect(stream: &mut TcpStream, bytes: &[u8]) {
        let mut buf = vec![0u8; bytes.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, bytes);
    }

    #[tokio::test]
    async fn handshake_with_hostname_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            expect(&mut stream, &[0x05, 0x01, 0x00]).await;
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = vec![0u8; 4 + 1 + 7 + 2];
            stream.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x03]);
            assert_eq!(req[4], 7);
            assert_eq!(&req[5..12], b"example");
            // success, bound to 0.0.0.0:0
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy = ProxySettings::new(ProxyKind::Socks5, "127.0.0.1", addr.port());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let target = Socks5Target::Name("example".to_owned(), 80);
        Socks5Stream::handshake(tcp, &proxy, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_with_credentials_and_v4_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            expect(&mut stream, &[0x05, 0x01, 0x02]).await;
            stream.write_all(&[0x05, 0x02]).await.unwrap();
            expect(&mut stream, &[0x01, 2, b'm', b'e', 2, b'p', b'w']).await;
            stream.write_all(&[0x01, 0x00]).await.unwrap();
            expect(
                &mut stream,
                &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50],
            )
            .await;
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy = ProxySettings::new(ProxyKind::Socks5Pw, "127.0.0.1", addr.port())
            .with_credentials("me", "pw");
        let tcp = TcpStream::connect(addr).await.unwrap();
        let target = Socks5Target::Addr(SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 80));
        Socks5Stream::handshake(tcp, &proxy, &target).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            stream.read_exact(&mut req).await.unwrap();
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy = ProxySettings::new(ProxyKind::Socks5, "127.0.0.1", addr.port());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let target = Socks5Target::Addr(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 80));
        let err = Socks5Stream::handshake(tcp, &proxy, &target)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
