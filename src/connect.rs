//! Connection factories.
//!
//! A factory turns a [`Target`] into a [`Connecting`]: a socket future plus,
//! when the factory resolves DNS, a one-shot lookup event reporting the
//! address it is about to dial. The guard observes that event; the factories
//! themselves never classify anything.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use hickory_resolver::TokioResolver;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, OnceCell};
use url::Url;

use crate::error::Error;

/// Outcome of the DNS lookup a factory performed for one connection attempt.
pub type LookupEvent = io::Result<IpAddr>;

/// The endpoint a connection is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// `host` is a hostname or an IP literal; IPv6 literals may keep their brackets.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host and port of `url`, defaulting the port to 80 for http and 443 for https.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_url(url.as_str(), "URL must have a host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_url(url.as_str(), "URL has no port and no default"))?;
        Ok(Self::new(host, port))
    }

    /// The host exactly as requested.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host without IPv6 brackets.
    fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    /// The host as an IP address, if it is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.bare_host().parse().ok()
    }
}

/// Sending half of a connection attempt's lookup event.
#[derive(Debug)]
pub struct LookupReporter(oneshot::Sender<LookupEvent>);

impl LookupReporter {
    pub fn report(self, event: LookupEvent) {
        // Nobody listening is fine: unguarded callers ignore the event.
        let _ = self.0.send(event);
    }
}

/// An in-flight connection attempt.
///
/// A factory that resolves DNS must report exactly one [`LookupEvent`]
/// before its socket future completes. A factory that connects to a literal
/// address drops the reporter without reporting (or never creates one).
pub struct Connecting<S> {
    lookup: Option<oneshot::Receiver<LookupEvent>>,
    socket: BoxFuture<'static, Result<S, Error>>,
}

impl<S: Send + 'static> Connecting<S> {
    /// An attempt that performs no DNS lookup.
    pub fn new<F>(socket: F) -> Self
    where
        F: Future<Output = Result<S, Error>> + Send + 'static,
    {
        Self {
            lookup: None,
            socket: Box::pin(socket),
        }
    }

    /// An attempt whose socket future reports its lookup through the given reporter.
    pub fn resolving<F, Fut>(start: F) -> Self
    where
        F: FnOnce(LookupReporter) -> Fut,
        Fut: Future<Output = Result<S, Error>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        Self {
            lookup: Some(rx),
            socket: Box::pin(start(LookupReporter(tx))),
        }
    }

    /// Chain a step (a TLS handshake, say) after the socket is established.
    /// The lookup event is carried over untouched.
    pub fn and_then<T, F, Fut>(self, next: F) -> Connecting<T>
    where
        T: Send + 'static,
        F: FnOnce(S) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let socket = self.socket;
        Connecting {
            lookup: self.lookup,
            socket: Box::pin(async move { next(socket.await?).await }),
        }
    }

    /// Drive the attempt to completion.
    pub async fn establish(self) -> Result<S, Error> {
        self.socket.await
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<oneshot::Receiver<LookupEvent>>,
        BoxFuture<'static, Result<S, Error>>,
    ) {
        (self.lookup, self.socket)
    }
}

/// Abortive close: no graceful shutdown, no further data.
pub trait HardClose {
    fn hard_close(self);
}

impl HardClose for TcpStream {
    // tokio deprecates set_linger because a nonzero timeout blocks the thread
    // in close(); a zero timeout returns immediately.
    #[allow(deprecated)]
    fn hard_close(self) {
        // Zero linger makes the kernel send RST and discard anything buffered,
        // so nothing queued for the private peer is flushed after the abort.
        if let Err(e) = self.set_linger(Some(Duration::ZERO)) {
            tracing::debug!(error = %e, "could not set zero linger before close");
        }
        drop(self);
    }
}

impl<S: HardClose> HardClose for tokio_rustls::client::TlsStream<S> {
    fn hard_close(self) {
        let (io, _session) = self.into_inner();
        io.hard_close();
    }
}

impl HardClose for tokio::io::DuplexStream {
    fn hard_close(self) {
        drop(self);
    }
}

/// A connection factory for one transport.
pub trait Connect: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + HardClose + Send + Unpin + 'static;

    /// Begin connecting to `target`. Errors returned here mean no socket I/O started.
    fn connect(&self, target: &Target) -> Result<Connecting<Self::Stream>, Error>;

    /// Whether this factory already validates the addresses it connects to.
    fn is_guarded(&self) -> bool {
        false
    }
}

/// Lazily built system resolver, shared by clones.
#[derive(Clone, Default)]
pub(crate) struct SystemResolver(Arc<OnceCell<TokioResolver>>);

impl SystemResolver {
    fn with(resolver: TokioResolver) -> Self {
        Self(Arc::new(OnceCell::new_with(Some(resolver))))
    }

    async fn resolver(&self) -> io::Result<&TokioResolver> {
        self.0
            .get_or_try_init(|| async {
                TokioResolver::builder_tokio()
                    .map(|builder| builder.build())
                    .map_err(|e| io::Error::other(e.to_string()))
            })
            .await
    }

    /// Every address `host` resolves to, in resolver order.
    pub(crate) async fn lookup_all(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let response = self
            .resolver()
            .await?
            .lookup_ip(host)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("DNS error for {host}: {e}")))?;
        let addrs: Vec<IpAddr> = response.iter().collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IP addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }

    async fn lookup_first(&self, host: &str) -> io::Result<IpAddr> {
        let addrs = self.lookup_all(host).await?;
        Ok(addrs[0])
    }
}

/// Plaintext TCP factory. Hostnames are resolved with the system resolver
/// and the first address returned is dialed.
#[derive(Clone, Default)]
pub struct TcpConnector {
    resolver: SystemResolver,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve hostnames with a preconfigured hickory resolver instead of
    /// the system configuration.
    pub fn with_resolver(resolver: TokioResolver) -> Self {
        Self {
            resolver: SystemResolver::with(resolver),
        }
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, target: &Target) -> Result<Connecting<TcpStream>, Error> {
        let port = target.port();

        if let Some(ip) = target.ip() {
            return Ok(Connecting::new(async move {
                Ok(TcpStream::connect(SocketAddr::new(ip, port)).await?)
            }));
        }

        let host = target.bare_host().to_string();
        let resolver = self.resolver.clone();
        Ok(Connecting::resolving(move |reporter| async move {
            let ip = match resolver.lookup_first(&host).await {
                Ok(ip) => {
                    reporter.report(Ok(ip));
                    ip
                }
                Err(e) => {
                    reporter.report(Err(io::Error::new(e.kind(), e.to_string())));
                    return Err(Error::Network(e));
                }
            };
            Ok(TcpStream::connect(SocketAddr::new(ip, port)).await?)
        }))
    }
}

/// TLS-over-TCP factory using rustls with the webpki root store.
#[derive(Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// A connector trusting the Mozilla roots shipped in `webpki-roots`.
    pub fn new() -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self::with_config(TcpConnector::new(), Arc::new(config)))
    }

    pub fn with_config(tcp: TcpConnector, config: Arc<ClientConfig>) -> Self {
        Self {
            tcp,
            tls: tokio_rustls::TlsConnector::from(config),
        }
    }
}

impl Connect for TlsConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    fn connect(&self, target: &Target) -> Result<Connecting<Self::Stream>, Error> {
        let server_name = ServerName::try_from(target.bare_host())
            .map_err(|e| Error::tls(format!("invalid server name '{}': {e}", target.host())))?
            .to_owned();
        let tls = self.tls.clone();

        Ok(self.tcp.connect(target)?.and_then(move |tcp| async move {
            Ok(tls.connect(server_name, tcp).await?)
        }))
    }
}

/// A socket established through an [`Agent`](crate::Agent).
pub enum AgentStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for AgentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStream::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            AgentStream::Tls(s) => f.debug_tuple("Tls").field(&s.get_ref().0).finish(),
        }
    }
}

impl HardClose for AgentStream {
    fn hard_close(self) {
        match self {
            AgentStream::Plain(s) => s.hard_close(),
            AgentStream::Tls(s) => s.hard_close(),
        }
    }
}

impl AsyncRead for AgentStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AgentStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AgentStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AgentStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AgentStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}
