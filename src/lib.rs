//! Bellhop
//!
//! A single-request asynchronous HTTP/1.1 client: one GET per handle,
//! carried through name resolution, endpoint failover, optional proxy
//! traversal (SOCKS5 or HTTP), optional TLS, redirect following, optional
//! gzip inflation, a completion deadline and token-bucket read pacing. The
//! result is delivered through a completion sink supplied when the handle
//! is built: either the whole buffered body at once ("bottled", the
//! default) or body slices as they arrive.
//!
//! ```no_run
//! use bellhop::{GetOptions, HttpConnection};
//!
//! # async fn run() {
//! let conn = HttpConnection::builder().build(|result, parser, body, _conn| {
//!     match result {
//!         Ok(()) => println!("{}: {} bytes", parser.status_code(), body.len()),
//!         Err(error) => eprintln!("request failed: {error}"),
//!     }
//! });
//! conn.get("http://example.com/", GetOptions::default());
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod conn;
pub mod dns;
mod error;
mod gzip;
mod limiter;
mod parser;
mod proxy;
pub mod stream;
mod url;

pub use conn::{
    Builder, ConnectCallback, EndpointFilter, GetOptions, Handler, HostnameFilter, HttpConnection,
    DEFAULT_MAX_BOTTLED_BUFFER,
};
pub use dns::{GaiResolver, ResolveFlags, ResolveRequest, Resolver};
pub use error::HttpError;
pub use parser::{is_redirect_status, ResponseParser};
pub use proxy::{ProxyKind, ProxySettings};
pub use stream::Socket;
