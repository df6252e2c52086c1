//! Name resolution for the request driver.
//!
//! Resolution is modelled as a [`tower::Service`] taking a
//! [`ResolveRequest`] and yielding the addresses for a hostname, so callers
//! can supply their own resolver (a caching layer, a test stub) without the
//! driver knowing. The default [`GaiResolver`] asks the operating system
//! via `getaddrinfo` on the blocking thread pool.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;

/// Opaque flags forwarded to the resolver with every lookup.
///
/// The driver never interprets them; custom resolvers may.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags(pub u32);

impl ResolveFlags {
    pub const NONE: ResolveFlags = ResolveFlags(0);
}

/// A single hostname lookup.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub host: Box<str>,
    pub flags: ResolveFlags,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe face of a resolver service, used by the connection handle
/// so callers are not infected by the concrete service type.
///
/// Implemented for every cloneable [`tower::Service`] from
/// [`ResolveRequest`] to a list of addresses, which is the form custom
/// resolvers should take.
pub trait Resolver: Send + Sync {
    fn resolve(&self, request: ResolveRequest) -> BoxFuture<'static, io::Result<Vec<IpAddr>>>;
}

impl<S> Resolver for S
where
    S: tower::Service<ResolveRequest, Response = Vec<IpAddr>, Error = io::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    fn resolve(&self, request: ResolveRequest) -> BoxFuture<'static, io::Result<Vec<IpAddr>>> {
        use tower::ServiceExt as _;

        Box::pin(self.clone().oneshot(request))
    }
}

/// GetAddrInfo based resolver.
///
/// Uses the `getaddrinfo` system call to resolve hostnames to IP addresses
/// via the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<ResolveRequest> for GaiResolver {
    type Response = Vec<IpAddr>;
    type Error = io::Error;
    type Future = GaiFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ResolveRequest) -> Self::Future {
        let span = tracing::Span::current();
        GaiFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
                    tracing::trace!(host = %req.host, "dns resolution starting");
                    (req.host.as_ref(), 0u16)
                        .to_socket_addrs()
                        .map(|addrs| addrs.map(|addr| addr.ip()).collect())
                })
            }),
        }
    }
}

/// Future returned by [`GaiResolver`], resolving on a worker thread.
#[pin_project(PinnedDrop)]
pub struct GaiFuture {
    #[pin]
    handle: JoinHandle<Result<Vec<IpAddr>, io::Error>>,
}

impl fmt::Debug for GaiFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl Future for GaiFuture {
    type Output = Result<Vec<IpAddr>, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for GaiFuture {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

/// Fisher-Yates shuffle over a xorshift generator seeded from the hasher's
/// per-process randomness. Endpoint ordering needs to vary between runs,
/// not be unpredictable.
pub(crate) fn shuffle<T>(items: &mut [T]) {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut seed = RandomState::new().build_hasher().finish() | 1;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for i in (1..items.len()).rev() {
        let j = (next() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_preserves_contents() {
        let mut items: Vec<u32> = (0..100).collect();
        shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_of_one_is_stable() {
        let mut items = vec![7];
        shuffle(&mut items);
        assert_eq!(items, vec![7]);
    }

    #[tokio::test]
    async fn gai_resolves_localhost() {
        use tower::ServiceExt as _;

        let addrs = GaiResolver::new()
            .oneshot(ResolveRequest {
                host: "localhost".into(),
                flags: ResolveFlags::NONE,
            })
            .await
            .unwrap();
        assert!(addrs.iter().any(|addr| addr.is_loopback()));
    }
}
