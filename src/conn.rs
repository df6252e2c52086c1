//! The HTTP request driver.
//!
//! [`HttpConnection`] carries exactly one GET at a time through name
//! resolution, endpoint selection with failover, optional proxy traversal,
//! optional TLS, request transmission, incremental response parsing,
//! redirect following, optional gzip inflation, a completion deadline and
//! rate-limited reads. The result is handed to the completion sink the
//! handle was built with: the fully buffered body when bottled, a stream of
//! body slices otherwise.
//!
//! The handle is cheaply cloneable shared state. [`get`][HttpConnection::get]
//! validates synchronously but never completes synchronously: failures are
//! posted to a spawned task so the sink always runs from the executor. The
//! spawned driver task holds its own clone of the handle, so the handle
//! outlives every operation it schedules, and the sink may drop all user
//! clones from inside the callback.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dns::{shuffle, GaiResolver, Resolver, ResolveFlags, ResolveRequest};
use crate::error::HttpError;
use crate::gzip::inflate_gzip;
use crate::limiter::RateLimiter;
use crate::parser::{is_redirect_status, ResponseParser};
use crate::proxy::ProxySettings;
use crate::stream::{Connector, Socket};
use crate::url::{basic_auth_token, parse_url, resolve_redirect_location};

/// Default cap on the bottled receive buffer.
pub const DEFAULT_MAX_BOTTLED_BUFFER: usize = 2 * 1024 * 1024;

const INITIAL_RECV_BUFFER: usize = 4096;

/// The completion sink: called with the outcome, the response parser for
/// header inspection, and the (decoded) body bytes.
pub type Handler =
    Box<dyn FnMut(Result<(), HttpError>, &ResponseParser, &[u8], &HttpConnection) + Send>;

/// Observer invoked once per successful connect, before the request is
/// written.
pub type ConnectCallback = Box<dyn FnMut(&HttpConnection) + Send>;

/// Invoked with the resolved endpoints; may remove entries.
pub type EndpointFilter = Box<dyn FnMut(&HttpConnection, &mut Vec<SocketAddr>) + Send>;

/// Predicate consulted before any network activity; returning `false`
/// fails the request.
pub type HostnameFilter = Box<dyn Fn(&HttpConnection, &str) -> bool + Send>;

/// Per-request configuration for [`HttpConnection::get`].
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Total completion budget for the request, redirects included.
    pub timeout: Duration,
    /// Scheduling tier, 0..2. Reserved; does not affect wire behavior.
    pub priority: u8,
    pub proxy: Option<ProxySettings>,
    /// Remaining permitted redirect hops.
    pub redirects: u32,
    /// Sent as `User-Agent` when non-empty.
    pub user_agent: String,
    /// Local address to bind before connecting.
    pub bind_addr: Option<IpAddr>,
    /// Forwarded opaquely to the resolver.
    pub resolve_flags: ResolveFlags,
    /// Basic-auth userinfo; overridden by userinfo in the URL.
    pub auth: String,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            priority: 0,
            proxy: None,
            redirects: 5,
            user_agent: String::new(),
            bind_addr: None,
            resolve_flags: ResolveFlags::NONE,
            auth: String::new(),
        }
    }
}

/// A single-request asynchronous HTTP/1.1 client handle.
pub struct HttpConnection {
    inner: Arc<Inner>,
}

impl Clone for HttpConnection {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    resolver: Box<dyn Resolver>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
    bottled: bool,
    max_bottled_buffer: usize,
    callbacks: Mutex<Callbacks>,
    abort: AtomicBool,
    rate: Arc<AtomicUsize>,
    cancel: Notify,
    force_close: AtomicBool,
    persisted: Mutex<Option<PersistedSocket>>,
}

#[derive(Default)]
struct Callbacks {
    handler: Option<Handler>,
    on_connect: Option<ConnectCallback>,
    endpoint_filter: Option<EndpointFilter>,
    hostname_filter: Option<HostnameFilter>,
}

/// A socket left open by a completed request, kept for the reuse check in
/// [`HttpConnection::start`].
struct PersistedSocket {
    socket: Socket,
    host: String,
    port: u16,
    ssl: bool,
    bind: Option<IpAddr>,
}

/// Configures and builds an [`HttpConnection`].
pub struct Builder {
    resolver: Box<dyn Resolver>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
    bottled: bool,
    max_bottled_buffer: usize,
    callbacks: Callbacks,
}

impl Builder {
    fn new() -> Self {
        Self {
            resolver: Box::new(GaiResolver::new()),
            #[cfg(feature = "tls")]
            tls: None,
            bottled: true,
            max_bottled_buffer: DEFAULT_MAX_BOTTLED_BUFFER,
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the system resolver.
    pub fn with_resolver<S>(mut self, resolver: S) -> Self
    where
        S: tower::Service<ResolveRequest, Response = Vec<IpAddr>, Error = io::Error>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send,
    {
        self.resolver = Box::new(resolver);
        self
    }

    /// TLS configuration for `https` URLs.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Buffer the whole response and deliver once (the default), instead of
    /// streaming body slices as they arrive.
    pub fn bottled(mut self, bottled: bool) -> Self {
        self.bottled = bottled;
        self
    }

    /// Cap on the bottled receive buffer.
    pub fn max_bottled_buffer(mut self, bytes: usize) -> Self {
        self.max_bottled_buffer = bytes;
        self
    }

    /// Observe each successful connect before the request is written.
    pub fn on_connect(
        mut self,
        callback: impl FnMut(&HttpConnection) + Send + 'static,
    ) -> Self {
        self.callbacks.on_connect = Some(Box::new(callback));
        self
    }

    /// Filter or reorder the resolved endpoints.
    pub fn endpoint_filter(
        mut self,
        filter: impl FnMut(&HttpConnection, &mut Vec<SocketAddr>) + Send + 'static,
    ) -> Self {
        self.callbacks.endpoint_filter = Some(Box::new(filter));
        self
    }

    /// Veto hostnames before any network activity.
    pub fn hostname_filter(
        mut self,
        filter: impl Fn(&HttpConnection, &str) -> bool + Send + 'static,
    ) -> Self {
        self.callbacks.hostname_filter = Some(Box::new(filter));
        self
    }

    /// Attach the completion sink and build the handle.
    pub fn build(
        mut self,
        handler: impl FnMut(Result<(), HttpError>, &ResponseParser, &[u8], &HttpConnection)
            + Send
            + 'static,
    ) -> HttpConnection {
        self.callbacks.handler = Some(Box::new(handler));
        HttpConnection {
            inner: Arc::new(Inner {
                resolver: self.resolver,
                #[cfg(feature = "tls")]
                tls: self.tls,
                bottled: self.bottled,
                max_bottled_buffer: self.max_bottled_buffer,
                callbacks: Mutex::new(self.callbacks),
                abort: AtomicBool::new(false),
                rate: Arc::new(AtomicUsize::new(0)),
                cancel: Notify::new(),
                force_close: AtomicBool::new(false),
                persisted: Mutex::new(None),
            }),
        }
    }
}

/// Everything one request (or one redirect hop) needs.
struct Plan {
    url: String,
    /// The host to connect to: the proxy's for a plain request through an
    /// HTTP proxy, the origin's otherwise.
    host: String,
    port: u16,
    ssl: bool,
    request: Vec<u8>,
    timeout: Duration,
    priority: u8,
    proxy: Option<ProxySettings>,
    redirects: u32,
    user_agent: String,
    auth: String,
    bind: Option<IpAddr>,
    flags: ResolveFlags,
}

enum HopOutcome {
    Done,
    Redirect(String),
}

enum Step<T> {
    Io(T),
    TimedOut,
    Cancelled,
}

/// The completion deadline. The window restarts when resolution completes
/// and when a connect succeeds; while resolution is outstanding the window
/// doubles, since the lookup may be queued behind slower ones. The grant is
/// judged by the phase at expiry, not retroactively.
struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    fn reset(&mut self) {
        self.start = Instant::now();
    }

    async fn expired(&self, resolving: bool) {
        let factor: u32 = if resolving { 2 } else { 1 };
        tokio::time::sleep_until(self.start + self.timeout * factor).await;
    }
}

impl HttpConnection {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Compose and start a GET against `url`.
    ///
    /// Must be called from within a tokio runtime. Failures are delivered
    /// through the sink, never returned here; that includes failures
    /// detected synchronously, such as an unparseable URL.
    pub fn get(&self, url: &str, options: GetOptions) {
        debug_assert!(options.priority < 3);
        match self.compose(url, &options) {
            Ok(plan) => self.spawn(plan),
            Err(error) => self.post_failure(error),
        }
    }

    /// Start a pre-assembled request against `host:port`.
    ///
    /// `request` is written verbatim once a connection is up. Redirects in
    /// the response are resolved against a synthetic origin URL.
    pub fn start(&self, host: &str, port: u16, request: Vec<u8>, ssl: bool, options: GetOptions) {
        debug_assert!(options.priority < 3);
        let scheme = if ssl { "https" } else { "http" };
        #[cfg(feature = "tls")]
        if ssl && self.inner.tls.is_none() {
            self.post_failure(HttpError::Tls(io::Error::other("no TLS configuration")));
            return;
        }
        #[cfg(not(feature = "tls"))]
        if ssl {
            self.post_failure(HttpError::UnsupportedProtocol);
            return;
        }
        self.spawn(Plan {
            url: format!("{scheme}://{host}:{port}/"),
            host: host.to_owned(),
            port,
            ssl,
            request,
            timeout: options.timeout,
            priority: options.priority,
            proxy: options.proxy,
            redirects: options.redirects,
            user_agent: options.user_agent,
            auth: options.auth,
            bind: options.bind_addr,
            flags: options.resolve_flags,
        });
    }

    /// Tear the connection down. Idempotent.
    ///
    /// With `force`, pending I/O and timers are cancelled and the socket is
    /// hard-closed; otherwise the socket is shut down gracefully. The sink
    /// is released either way: after `close` it is never invoked again.
    pub fn close(&self, force: bool) {
        if self.inner.abort.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.force_close.store(force, Ordering::SeqCst);
        self.inner.callbacks.lock().unwrap().handler = None;
        let persisted = self.inner.persisted.lock().unwrap().take();
        if let Some(entry) = persisted {
            if !force {
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    rt.spawn(async move {
                        let mut socket = entry.socket;
                        let _ = socket.shutdown().await;
                    });
                }
            }
        }
        self.inner.cancel.notify_one();
    }

    /// Limit read throughput to `bytes_per_second`; 0 lifts the limit.
    ///
    /// Takes effect on the in-flight request at its next quota grant. An
    /// already-armed limiter tick is left to expire naturally.
    pub fn rate_limit(&self, bytes_per_second: usize) {
        self.inner.rate.store(bytes_per_second, Ordering::Relaxed);
    }

    fn aborted(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    /// Validate the URL and policy, and assemble the request text.
    fn compose(&self, url: &str, options: &GetOptions) -> Result<Plan, HttpError> {
        let parsed = parse_url(url)?;

        let auth = if parsed.userinfo.is_empty() {
            options.auth.clone()
        } else {
            parsed.userinfo.clone()
        };

        if !self.hostname_allowed(&parsed.host) {
            return Err(HttpError::BlockedByFilter);
        }

        let ssl = match parsed.scheme.as_str() {
            "http" => false,
            #[cfg(feature = "tls")]
            "https" => true,
            _ => return Err(HttpError::UnsupportedProtocol),
        };
        #[cfg(feature = "tls")]
        if ssl && self.inner.tls.is_none() {
            return Err(HttpError::Tls(io::Error::other("no TLS configuration")));
        }

        let default_port = parsed.default_port();
        let port = parsed.port_or_default();
        let mut connect_host = parsed.host.clone();
        let mut connect_port = port;

        // A plain request through an HTTP proxy goes straight at the proxy
        // with an absolute-form target. TLS through an HTTP proxy tunnels
        // instead, at the stream layer.
        let http_proxy = options.proxy.as_ref().filter(|p| !ssl && p.is_http());

        let mut request = String::with_capacity(128 + url.len());
        if let Some(proxy) = http_proxy {
            request.push_str(&format!("GET {url} HTTP/1.1\r\n"));
            connect_host = proxy.host.clone();
            connect_port = proxy.port;
        } else {
            request.push_str(&format!("GET {} HTTP/1.1\r\n", parsed.path));
        }

        let host_field = if parsed.host.contains(':') {
            format!("[{}]", parsed.host)
        } else {
            parsed.host.clone()
        };
        if port != default_port {
            request.push_str(&format!("Host: {host_field}:{port}\r\n"));
        } else {
            request.push_str(&format!("Host: {host_field}\r\n"));
        }

        if !options.user_agent.is_empty() {
            request.push_str(&format!("User-Agent: {}\r\n", options.user_agent));
        }
        if self.inner.bottled {
            request.push_str("Accept-Encoding: gzip\r\n");
        }
        if !auth.is_empty() {
            request.push_str(&format!(
                "Authorization: Basic {}\r\n",
                basic_auth_token(&auth)
            ));
        }
        if let Some(proxy) = http_proxy {
            if proxy.has_credentials() {
                request.push_str(&format!(
                    "Proxy-Authorization: Basic {}\r\n",
                    basic_auth_token(&format!("{}:{}", proxy.username, proxy.password))
                ));
            }
        }
        request.push_str("Connection: close\r\n\r\n");

        Ok(Plan {
            url: url.to_owned(),
            host: connect_host,
            port: connect_port,
            ssl,
            request: request.into_bytes(),
            timeout: options.timeout,
            priority: options.priority,
            proxy: options.proxy.clone(),
            redirects: options.redirects,
            user_agent: options.user_agent.clone(),
            auth,
            bind: options.bind_addr,
            flags: options.resolve_flags,
        })
    }

    fn spawn(&self, plan: Plan) {
        let conn = self.clone();
        tokio::spawn(async move { conn.run(plan).await });
    }

    /// Deliver a validation failure from the executor, never from the
    /// caller's stack.
    fn post_failure(&self, error: HttpError) {
        let conn = self.clone();
        tokio::spawn(async move {
            let parser = ResponseParser::new();
            conn.deliver(Err(error), &parser, &[]);
        });
    }

    async fn run(self, mut plan: Plan) {
        loop {
            match self.run_hop(&mut plan).await {
                HopOutcome::Done => return,
                HopOutcome::Redirect(location) => {
                    let url = resolve_redirect_location(&plan.url, &location);
                    debug!(%url, redirects_left = plan.redirects - 1, "following redirect");
                    let options = GetOptions {
                        timeout: plan.timeout,
                        priority: plan.priority,
                        proxy: plan.proxy.clone(),
                        redirects: plan.redirects - 1,
                        user_agent: plan.user_agent.clone(),
                        bind_addr: plan.bind,
                        resolve_flags: plan.flags,
                        auth: plan.auth.clone(),
                    };
                    match self.compose(&url, &options) {
                        Ok(next) => plan = next,
                        Err(error) => {
                            self.deliver(Err(error), &ResponseParser::new(), &[]);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drive one hop: resolve, connect with failover, write, read.
    async fn run_hop(&self, plan: &mut Plan) -> HopOutcome {
        if self.aborted() {
            return HopOutcome::Done;
        }

        let mut parser = ResponseParser::new();
        let mut deadline = Deadline::new(plan.timeout);

        #[cfg(feature = "tls")]
        let tls = if plan.ssl {
            // the config was checked at composition; the name may still be
            // unusable for SNI
            let config = match self.inner.tls.clone() {
                Some(config) => config,
                None => {
                    self.deliver(
                        Err(HttpError::Tls(io::Error::other("no TLS configuration"))),
                        &parser,
                        &[],
                    );
                    return HopOutcome::Done;
                }
            };
            match rustls::pki_types::ServerName::try_from(plan.host.clone()) {
                Ok(name) => Some((config, name)),
                Err(_) => {
                    self.deliver(
                        Err(HttpError::Tls(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "hostname not usable as a TLS server name",
                        ))),
                        &parser,
                        &[],
                    );
                    return HopOutcome::Done;
                }
            }
        } else {
            None
        };

        let connector = Connector {
            proxy: plan
                .proxy
                .clone()
                .filter(|p| p.is_socks5() || (p.is_http() && plan.ssl)),
            #[cfg(feature = "tls")]
            tls,
            bind: plan.bind,
        };

        let mut endpoints: Vec<SocketAddr> = Vec::new();
        let mut dst_name: Option<String> = None;
        let mut socket = self.take_persisted(plan);

        if socket.is_none() {
            if plan.proxy.as_ref().is_some_and(|p| p.resolves_remotely()) {
                // the proxy maps the name; a literal IP is used directly
                match plan.host.parse::<IpAddr>() {
                    Ok(ip) => endpoints.push(SocketAddr::new(ip, plan.port)),
                    Err(_) => {
                        endpoints.push(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), plan.port));
                        dst_name = Some(plan.host.clone());
                    }
                }
            } else {
                trace!(host = %plan.host, "resolving");
                let lookup = self.inner.resolver.resolve(ResolveRequest {
                    host: plan.host.clone().into_boxed_str(),
                    flags: plan.flags,
                });
                let resolved = tokio::select! {
                    biased;
                    _ = self.inner.cancel.notified() => Step::Cancelled,
                    _ = deadline.expired(true) => Step::TimedOut,
                    result = lookup => Step::Io(result),
                };
                let addrs = match resolved {
                    Step::Cancelled => return self.cancelled(None).await,
                    Step::TimedOut => {
                        self.deliver(Err(HttpError::TimedOut), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    Step::Io(Err(error)) => {
                        self.deliver(Err(HttpError::Resolve(error)), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    Step::Io(Ok(addrs)) => addrs,
                };
                if self.aborted() {
                    return HopOutcome::Done;
                }

                // resolution latency must not count against the budget twice
                deadline.reset();

                endpoints.extend(addrs.into_iter().map(|addr| SocketAddr::new(addr, plan.port)));
                trace!(count = endpoints.len(), "resolved");

                self.filter_endpoints(&mut endpoints);
                if let Some(bind) = plan.bind {
                    endpoints.retain(|ep| ep.is_ipv4() == bind.is_ipv4());
                }
                if endpoints.is_empty() {
                    self.deliver(Err(HttpError::AddressFamilyNotSupported), &parser, &[]);
                    self.close(false);
                    return HopOutcome::Done;
                }
                shuffle(&mut endpoints);
            }
        }

        let mut next_ep = 0usize;
        let mut last_connect_error: Option<HttpError> = None;

        'attempt: loop {
            if self.aborted() {
                return HopOutcome::Done;
            }

            let mut sock = match socket.take() {
                Some(sock) => sock,
                None => {
                    if next_ep >= endpoints.len() {
                        let error = last_connect_error.take().unwrap_or_else(|| {
                            HttpError::Connect(io::Error::new(
                                io::ErrorKind::NotConnected,
                                "no endpoints to try",
                            ))
                        });
                        self.deliver(Err(error), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    let endpoint = endpoints[next_ep];
                    next_ep += 1;
                    trace!(%endpoint, attempt = next_ep, "connecting");

                    let attempt = tokio::select! {
                        biased;
                        _ = self.inner.cancel.notified() => Step::Cancelled,
                        _ = deadline.expired(false) => Step::TimedOut,
                        result = connector.connect(endpoint, dst_name.as_deref()) => Step::Io(result),
                    };
                    match attempt {
                        Step::Cancelled => return self.cancelled(None).await,
                        Step::TimedOut => {
                            if next_ep < endpoints.len() && !self.aborted() {
                                deadline.reset();
                                last_connect_error = Some(HttpError::TimedOut);
                                continue 'attempt;
                            }
                            self.deliver(Err(HttpError::TimedOut), &parser, &[]);
                            return HopOutcome::Done;
                        }
                        Step::Io(Err(error)) => {
                            trace!(%endpoint, %error, "connect failed");
                            if next_ep < endpoints.len() && !self.aborted() {
                                last_connect_error = Some(HttpError::Connect(error));
                                continue 'attempt;
                            }
                            self.deliver(Err(HttpError::Connect(error)), &parser, &[]);
                            return HopOutcome::Done;
                        }
                        Step::Io(Ok(sock)) => {
                            deadline.reset();
                            self.notify_connected();
                            sock
                        }
                    }
                }
            };

            let written = tokio::select! {
                biased;
                _ = self.inner.cancel.notified() => Step::Cancelled,
                _ = deadline.expired(false) => Step::TimedOut,
                result = sock.write_all(&plan.request) => Step::Io(result),
            };
            match written {
                Step::Cancelled => return self.cancelled(Some(sock)).await,
                Step::TimedOut => {
                    if next_ep < endpoints.len() && !self.aborted() {
                        deadline.reset();
                        continue 'attempt;
                    }
                    self.deliver(Err(HttpError::TimedOut), &parser, &[]);
                    return HopOutcome::Done;
                }
                Step::Io(Err(error)) => {
                    self.deliver(Err(HttpError::Write(error)), &parser, &[]);
                    return HopOutcome::Done;
                }
                Step::Io(Ok(())) => {}
            }

            parser.reset();
            let mut recv = vec![0u8; INITIAL_RECV_BUFFER.min(self.inner.max_bottled_buffer)];
            let mut read_pos = 0usize;
            let mut limiter = RateLimiter::new(self.inner.rate.clone());

            loop {
                if self.aborted() {
                    return HopOutcome::Done;
                }

                if read_pos == recv.len() {
                    if read_pos >= self.inner.max_bottled_buffer {
                        self.deliver(Err(HttpError::TooLarge), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    let grown = (read_pos * 2).min(self.inner.max_bottled_buffer);
                    recv.resize(grown, 0);
                }

                if limiter.exhausted() {
                    let refilled = tokio::select! {
                        biased;
                        _ = self.inner.cancel.notified() => false,
                        _ = limiter.refill() => true,
                    };
                    if !refilled {
                        return self.cancelled(Some(sock)).await;
                    }
                    continue;
                }
                let want = limiter.clamp(recv.len() - read_pos);
                if want == 0 {
                    // the rate changed under us; re-evaluate the quota
                    continue;
                }

                let read = tokio::select! {
                    biased;
                    _ = self.inner.cancel.notified() => Step::Cancelled,
                    _ = deadline.expired(false) => Step::TimedOut,
                    result = sock.read(&mut recv[read_pos..read_pos + want]) => Step::Io(result),
                };
                let n = match read {
                    Step::Cancelled => return self.cancelled(Some(sock)).await,
                    Step::TimedOut => {
                        if next_ep < endpoints.len() && !self.aborted() {
                            deadline.reset();
                            continue 'attempt;
                        }
                        self.deliver(Err(HttpError::TimedOut), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    // rustls reports a truncated TLS close as UnexpectedEof
                    Step::Io(Err(error)) if error.kind() == io::ErrorKind::UnexpectedEof => 0,
                    Step::Io(Err(error)) => {
                        self.deliver(Err(HttpError::Read(error)), &parser, &[]);
                        return HopOutcome::Done;
                    }
                    Step::Io(Ok(n)) => n,
                };
                limiter.consume(n);

                if n == 0 {
                    trace!("end of stream");
                    if self.inner.bottled && parser.header_finished() {
                        let start = parser.body_start();
                        let len = parser.body_len();
                        self.finish(Err(HttpError::Eof), &parser, &recv[start..start + len]);
                    } else {
                        self.deliver(Err(HttpError::Eof), &parser, &[]);
                    }
                    return HopOutcome::Done;
                }

                read_pos += n;
                match parser.incoming(&mut recv[..read_pos]) {
                    Ok(new_len) => read_pos = new_len,
                    Err(_) => {
                        self.deliver(Err(HttpError::Parse), &parser, &[]);
                        return HopOutcome::Done;
                    }
                }

                // a redirect is honored only while budget remains; any
                // other status zeroes the budget so a later 3xx in the same
                // response cannot start a hop
                if plan.redirects > 0 && parser.header_finished() {
                    if is_redirect_status(parser.status_code()) {
                        let Some(location) = parser.header("location").map(str::to_owned) else {
                            self.deliver(Err(HttpError::MissingLocation), &parser, &[]);
                            return HopOutcome::Done;
                        };
                        // hard-close before the next hop rebuilds state
                        drop(sock);
                        return HopOutcome::Redirect(location);
                    }
                    plan.redirects = 0;
                }

                if !self.inner.bottled && parser.header_finished() {
                    let start = parser.body_start();
                    let len = parser.body_len();
                    if len > 0 {
                        self.deliver(Ok(()), &parser, &recv[start..start + len]);
                        if self.aborted() {
                            return HopOutcome::Done;
                        }
                    }
                    let consumed = start + len;
                    recv.copy_within(consumed..read_pos, 0);
                    read_pos -= consumed;
                    parser.rewind_body();
                } else if self.inner.bottled && parser.finished() {
                    let start = parser.body_start();
                    let len = parser.body_len();
                    self.persist(sock, plan);
                    self.finish(Ok(()), &parser, &recv[start..start + len]);
                    return HopOutcome::Done;
                }
            }
        }
    }

    /// Bottled delivery: inflate a gzip body and convert a clean EOF after
    /// a complete message into success.
    fn finish(&self, result: Result<(), HttpError>, parser: &ResponseParser, body: &[u8]) {
        let mut result = result;
        let mut inflated = None;
        if !body.is_empty() && parser.header_finished() {
            let encoding = parser.header("content-encoding").unwrap_or("");
            if encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip") {
                match inflate_gzip(body, self.inner.max_bottled_buffer) {
                    Ok(buf) => inflated = Some(buf),
                    Err(_) => {
                        self.deliver(Err(HttpError::Inflate), parser, body);
                        return;
                    }
                }
            }
            if parser.finished() {
                result = Ok(());
            }
        }
        let body = inflated.as_deref().unwrap_or(body);
        self.deliver(result, parser, body);
    }

    /// Invoke the sink once. After `close` the sink is gone and nothing is
    /// delivered; a sink that closes the handle from inside the callback is
    /// not reinstalled.
    fn deliver(&self, result: Result<(), HttpError>, parser: &ResponseParser, body: &[u8]) {
        if self.aborted() {
            return;
        }
        let taken = self.inner.callbacks.lock().unwrap().handler.take();
        let Some(mut handler) = taken else {
            return;
        };
        trace!(ok = result.is_ok(), bytes = body.len(), "delivering");
        handler(result, parser, body, self);
        if !self.aborted() {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            if callbacks.handler.is_none() {
                callbacks.handler = Some(handler);
            }
        }
    }

    fn hostname_allowed(&self, host: &str) -> bool {
        let taken = self.inner.callbacks.lock().unwrap().hostname_filter.take();
        let Some(filter) = taken else {
            return true;
        };
        let allowed = filter(self, host);
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        if callbacks.hostname_filter.is_none() {
            callbacks.hostname_filter = Some(filter);
        }
        allowed
    }

    fn filter_endpoints(&self, endpoints: &mut Vec<SocketAddr>) {
        let taken = self.inner.callbacks.lock().unwrap().endpoint_filter.take();
        let Some(mut filter) = taken else {
            return;
        };
        filter(self, endpoints);
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        if callbacks.endpoint_filter.is_none() {
            callbacks.endpoint_filter = Some(filter);
        }
    }

    fn notify_connected(&self) {
        let taken = self.inner.callbacks.lock().unwrap().on_connect.take();
        let Some(mut callback) = taken else {
            return;
        };
        callback(self);
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        if callbacks.on_connect.is_none() {
            callbacks.on_connect = Some(callback);
        }
    }

    /// Tear down after `close`: honor a graceful shutdown, deliver nothing.
    async fn cancelled(&self, socket: Option<Socket>) -> HopOutcome {
        if let Some(mut sock) = socket {
            if !self.inner.force_close.load(Ordering::SeqCst) {
                let _ = sock.shutdown().await;
            }
        }
        HopOutcome::Done
    }

    fn take_persisted(&self, plan: &Plan) -> Option<Socket> {
        let mut slot = self.inner.persisted.lock().unwrap();
        let matches = slot.as_ref().is_some_and(|p| {
            p.host == plan.host && p.port == plan.port && p.ssl == plan.ssl && p.bind == plan.bind
        });
        if matches {
            slot.take().map(|p| p.socket)
        } else {
            None
        }
    }

    fn persist(&self, socket: Socket, plan: &Plan) {
        if self.aborted() {
            return;
        }
        *self.inner.persisted.lock().unwrap() = Some(PersistedSocket {
            socket,
            host: plan.host.clone(),
            port: plan.port,
            ssl: plan.ssl,
            bind: plan.bind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;

    fn handle() -> HttpConnection {
        HttpConnection::builder().build(|_, _, _, _| {})
    }

    fn request_text(conn: &HttpConnection, url: &str, options: &GetOptions) -> String {
        let plan = conn.compose(url, options).unwrap();
        String::from_utf8(plan.request).unwrap()
    }

    #[test]
    fn assembles_minimal_request() {
        let text = request_text(&handle(), "http://example.com/path", &GetOptions::default());
        assert_eq!(
            text,
            "GET /path HTTP/1.1\r\n\
             Host: example.com\r\n\
             Accept-Encoding: gzip\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[test]
    fn host_carries_port_only_when_not_default() {
        let text = request_text(
            &handle(),
            "http://example.com:8080/",
            &GetOptions::default(),
        );
        assert!(text.contains("Host: example.com:8080\r\n"));

        let text = request_text(&handle(), "http://example.com:80/", &GetOptions::default());
        assert!(text.contains("Host: example.com\r\n"));
    }

    #[test]
    fn user_agent_sent_when_non_empty() {
        let options = GetOptions {
            user_agent: "bellhop/0.1".to_owned(),
            ..GetOptions::default()
        };
        let text = request_text(&handle(), "http://example.com/", &options);
        assert!(text.contains("User-Agent: bellhop/0.1\r\n"));

        let text = request_text(&handle(), "http://example.com/", &GetOptions::default());
        assert!(!text.contains("User-Agent"));
    }

    #[test]
    fn streaming_mode_does_not_accept_gzip() {
        let conn = HttpConnection::builder().bottled(false).build(|_, _, _, _| {});
        let text = request_text(&conn, "http://example.com/", &GetOptions::default());
        assert!(!text.contains("Accept-Encoding"));
    }

    #[test]
    fn url_userinfo_overrides_auth_option() {
        let options = GetOptions {
            auth: "other:secret".to_owned(),
            ..GetOptions::default()
        };
        let text = request_text(&handle(), "http://me:pw@example.com/", &options);
        // me:pw
        assert!(text.contains("Authorization: Basic bWU6cHc=\r\n"));

        let text = request_text(&handle(), "http://example.com/", &options);
        // other:secret
        assert!(text.contains("Authorization: Basic b3RoZXI6c2VjcmV0\r\n"));
    }

    #[test]
    fn plain_http_proxy_uses_absolute_target() {
        let proxy = ProxySettings::new(ProxyKind::HttpPw, "proxy.example", 3128)
            .with_credentials("pu", "pp");
        let options = GetOptions {
            proxy: Some(proxy),
            ..GetOptions::default()
        };
        let conn = handle();
        let plan = conn.compose("http://example.com/file", &options).unwrap();
        let text = String::from_utf8(plan.request).unwrap();

        assert!(text.starts_with("GET http://example.com/file HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic cHU6cHA=\r\n"));
        assert_eq!(plan.host, "proxy.example");
        assert_eq!(plan.port, 3128);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn https_through_http_proxy_keeps_origin_target() {
        let tls = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );
        let conn = HttpConnection::builder().with_tls(tls).build(|_, _, _, _| {});
        let proxy = ProxySettings::new(ProxyKind::Http, "proxy.example", 3128);
        let options = GetOptions {
            proxy: Some(proxy),
            ..GetOptions::default()
        };
        let plan = conn.compose("https://example.com/file", &options).unwrap();
        let text = String::from_utf8(plan.request).unwrap();

        assert!(text.starts_with("GET /file HTTP/1.1\r\n"));
        assert!(!text.contains("Proxy-Authorization"));
        assert_eq!(plan.host, "example.com");
        assert_eq!(plan.port, 443);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let conn = handle();
        assert!(matches!(
            conn.compose("ftp://example.com/x", &GetOptions::default()),
            Err(HttpError::UnsupportedProtocol)
        ));
    }

    #[test]
    fn hostname_filter_vetoes() {
        let conn = HttpConnection::builder()
            .hostname_filter(|_, host| host != "blocked.example")
            .build(|_, _, _, _| {});
        assert!(matches!(
            conn.compose("http://blocked.example/", &GetOptions::default()),
            Err(HttpError::BlockedByFilter)
        ));
        assert!(conn
            .compose("http://fine.example/", &GetOptions::default())
            .is_ok());
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let text = request_text(&handle(), "http://[::1]:8080/x", &GetOptions::default());
        assert!(text.contains("Host: [::1]:8080\r\n"));
    }
}
