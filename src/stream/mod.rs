//! The per-request socket and its factory.
//!
//! A request can ride direct TCP, SOCKS5, an HTTP CONNECT tunnel, or TLS
//! over any of these, so [`Socket`] is a tagged union with the
//! read/write/shutdown operations dispatched per tag. The tag is chosen
//! once per connection attempt by [`Connector::connect`] from the request's
//! scheme and proxy settings; the driver itself never names a transport.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};

use crate::proxy::ProxySettings;

mod socks5;
mod tunnel;

pub use socks5::Socks5Stream;
pub(crate) use socks5::Socks5Target;
pub use tunnel::TunnelStream;

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

/// Dispatching wrapper over the transports a request can ride.
#[derive(Debug)]
#[pin_project(project = SocketProj)]
pub enum Socket {
    /// A direct TCP stream.
    Tcp(#[pin] TcpStream),

    /// TCP through a SOCKS5 proxy.
    Socks5(#[pin] Socks5Stream),

    /// TCP through an HTTP CONNECT tunnel.
    Tunnel(#[pin] TunnelStream),

    /// TLS over direct TCP.
    #[cfg(feature = "tls")]
    TlsTcp(#[pin] TlsStream<TcpStream>),

    /// TLS through a SOCKS5 proxy.
    #[cfg(feature = "tls")]
    TlsSocks5(#[pin] TlsStream<Socks5Stream>),

    /// TLS through an HTTP CONNECT tunnel.
    #[cfg(feature = "tls")]
    TlsTunnel(#[pin] TlsStream<TunnelStream>),
}

macro_rules! dispatch {
    (pin $driver:ident.$method:ident($($args:expr),*)) => {
        match $driver.project() {
            SocketProj::Tcp(stream) => stream.$method($($args),*),
            SocketProj::Socks5(stream) => stream.$method($($args),*),
            SocketProj::Tunnel(stream) => stream.$method($($args),*),
            #[cfg(feature = "tls")]
            SocketProj::TlsTcp(stream) => stream.$method($($args),*),
            #[cfg(feature = "tls")]
            SocketProj::TlsSocks5(stream) => stream.$method($($args),*),
            #[cfg(feature = "tls")]
            SocketProj::TlsTunnel(stream) => stream.$method($($args),*),
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(pin self.poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch!(pin self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(pin self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(pin self.poll_shutdown(cx))
    }
}

impl Socket {
    /// Whether the stream is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(
                self,
                Socket::TlsTcp(_) | Socket::TlsSocks5(_) | Socket::TlsTunnel(_)
            )
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

/// Chooses and establishes the socket variant for one connection attempt.
pub(crate) struct Connector {
    /// The proxy the stream itself must traverse: SOCKS5 always appears
    /// here; an HTTP proxy only when tunnelling for TLS (a plain request
    /// through an HTTP proxy is ordinary TCP to the proxy with an
    /// absolute-form target, handled above this layer).
    pub(crate) proxy: Option<ProxySettings>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<(
        Arc<rustls::ClientConfig>,
        rustls::pki_types::ServerName<'static>,
    )>,
    pub(crate) bind: Option<IpAddr>,
}

enum PlainSocket {
    Tcp(TcpStream),
    Socks5(Socks5Stream),
    Tunnel(TunnelStream),
}

impl Connector {
    /// Connect to `endpoint`, traversing the configured proxy and wrapping
    /// in TLS as required. `dst_name` carries the destination hostname when
    /// a SOCKS5 proxy resolves names remotely.
    pub(crate) async fn connect(
        &self,
        endpoint: SocketAddr,
        dst_name: Option<&str>,
    ) -> io::Result<Socket> {
        let plain = match &self.proxy {
            None => PlainSocket::Tcp(tcp_connect(self.bind, endpoint).await?),
            Some(proxy) if proxy.is_socks5() => {
                let stream = tcp_connect_host(self.bind, &proxy.host, proxy.port).await?;
                let target = match dst_name {
                    Some(name) => Socks5Target::Name(name.to_owned(), endpoint.port()),
                    None => Socks5Target::Addr(endpoint),
                };
                PlainSocket::Socks5(Socks5Stream::handshake(stream, proxy, &target).await?)
            }
            Some(proxy) => {
                let stream = tcp_connect_host(self.bind, &proxy.host, proxy.port).await?;
                PlainSocket::Tunnel(TunnelStream::handshake(stream, proxy, endpoint).await?)
            }
        };

        #[cfg(feature = "tls")]
        if let Some((config, name)) = &self.tls {
            let connector = tokio_rustls::TlsConnector::from(config.clone());
            return Ok(match plain {
                PlainSocket::Tcp(stream) => {
                    Socket::TlsTcp(connector.connect(name.clone(), stream).await?)
                }
                PlainSocket::Socks5(stream) => {
                    Socket::TlsSocks5(connector.connect(name.clone(), stream).await?)
                }
                PlainSocket::Tunnel(stream) => {
                    Socket::TlsTunnel(connector.connect(name.clone(), stream).await?)
                }
            });
        }

        Ok(match plain {
            PlainSocket::Tcp(stream) => Socket::Tcp(stream),
            PlainSocket::Socks5(stream) => Socket::Socks5(stream),
            PlainSocket::Tunnel(stream) => Socket::Tunnel(stream),
        })
    }
}

/// Open a TCP connection, binding the local side first when a bind address
/// is configured.
async fn tcp_connect(bind: Option<IpAddr>, addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = bind {
        if ip.is_ipv4() != addr.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bind address family does not match the endpoint",
            ));
        }
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    socket.connect(addr).await
}

/// Connect to a host the proxy layer names (the proxy itself): resolve and
/// try each address in order.
async fn tcp_connect_host(bind: Option<IpAddr>, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        if bind.is_some_and(|ip| ip.is_ipv4() != addr.is_ipv4()) {
            continue;
        }
        match tcp_connect(bind, addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last = Some(error),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "proxy address not found")
    }))
}
