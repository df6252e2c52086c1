//! Error taxonomy for the request driver.

use std::io;

use thiserror::Error;

/// Errors delivered through the completion sink.
///
/// Every failure of a request is reported as one of these variants.
/// Validation failures detected inside
/// [`get`][crate::HttpConnection::get] are never raised to the caller
/// directly; they are delivered through the sink on a later dispatch turn,
/// so callers observe a single, uniformly asynchronous completion path.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The URL could not be split into scheme, host and path.
    #[error("invalid URL")]
    InvalidUrl,

    /// The URL scheme is not `http` (or `https` when TLS support is enabled).
    #[error("unsupported URL protocol")]
    UnsupportedProtocol,

    /// The hostname filter rejected the request before any network activity.
    #[error("hostname blocked by filter")]
    BlockedByFilter,

    /// No resolved endpoint matched the address family of the bind address.
    #[error("no resolved endpoint matches the bind address family")]
    AddressFamilyNotSupported,

    /// Name resolution failed.
    #[error("resolve: {0}")]
    Resolve(#[source] io::Error),

    /// All connection attempts failed; carries the last attempt's error.
    #[error("connect: {0}")]
    Connect(#[source] io::Error),

    /// Sending the request failed.
    #[error("write: {0}")]
    Write(#[source] io::Error),

    /// Receiving the response failed.
    #[error("read: {0}")]
    Read(#[source] io::Error),

    /// TLS setup or handshake failed.
    #[error("tls: {0}")]
    Tls(#[source] io::Error),

    /// The peer closed the connection before the response was complete.
    #[error("unexpected end of stream")]
    Eof,

    /// The response could not be parsed as HTTP/1.1.
    #[error("malformed HTTP response")]
    Parse,

    /// A redirect status arrived without a `Location` header.
    #[error("redirect without a Location header")]
    MissingLocation,

    /// The buffered response exceeded the configured size limit.
    #[error("response exceeds the buffer limit")]
    TooLarge,

    /// The gzip-encoded body could not be inflated.
    #[error("gzip inflation failed")]
    Inflate,

    /// The completion deadline elapsed.
    #[error("timed out")]
    TimedOut,

    /// The request was torn down by [`close`][crate::HttpConnection::close].
    #[error("operation aborted")]
    Aborted,
}

impl HttpError {
    /// True for errors that terminated the request before any byte of the
    /// response was parsed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HttpError::Resolve(_)
                | HttpError::Connect(_)
                | HttpError::Write(_)
                | HttpError::Read(_)
                | HttpError::Tls(_)
        )
    }

    /// True when the deadline fired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::TimedOut)
    }
}
