//! reqwest integration.
//!
//! reqwest does not accept a custom connection factory, so the two guard
//! checkpoints are applied at the seams it does expose: the DNS resolver
//! (post-resolution) and the request/redirect URLs (pre-connect, which also
//! covers literal IPs that never reach the resolver).

use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::{Body, Client, IntoUrl, Method, Request, RequestBuilder, Response};
use url::Url;

use crate::classify::Classifier;
use crate::connect::SystemResolver;
use crate::error::Error;
use crate::registry::Registry;
use crate::select::AgentOptions;
use crate::violation::policy_violation;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 10;

/// A reqwest resolver that fails the lookup when any answer is private.
#[derive(Clone)]
pub struct GuardedResolver {
    classifier: Arc<dyn Classifier>,
    resolver: SystemResolver,
}

impl GuardedResolver {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            classifier,
            resolver: SystemResolver::default(),
        }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let classifier = Arc::clone(&self.classifier);
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs = resolver.lookup_all(&host).await?;
            check_resolved(&host, classifier.as_ref(), &addrs)
                .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;
            let addrs: Addrs = Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Reject the whole answer if any address is private: reqwest may fall back
/// to any of them.
fn check_resolved(host: &str, classifier: &dyn Classifier, addrs: &[IpAddr]) -> Result<(), Error> {
    match addrs
        .iter()
        .find(|ip| classifier.is_private(&ip.to_string()))
    {
        Some(&private) => {
            tracing::warn!(host, address = %private, "DNS lookup returned a private address");
            Err(Error::aborted_after_resolution(host, private))
        }
        None => Ok(()),
    }
}

/// Pre-connect check for a request or redirect URL.
fn check_url(classifier: &dyn Classifier, url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(Error::unsupported_scheme(url.as_str(), scheme)),
    }
    match url.host_str() {
        Some(host) if classifier.is_private(host) => {
            tracing::warn!(host, "rejected request to private address");
            Err(Error::rejected_before_connect(host))
        }
        Some(_) => Ok(()),
        None => Err(Error::invalid_url(url.as_str(), "URL must have a host")),
    }
}

fn redirect_verdict(classifier: &dyn Classifier, next: &Url, hops: usize) -> Option<Error> {
    if hops >= MAX_REDIRECTS {
        return Some(Error::Network(io::Error::other(format!(
            "too many redirects (max {MAX_REDIRECTS})"
        ))));
    }
    check_url(classifier, next).err()
}

/// A reqwest client that runs the pre-connect check on every request it sends.
///
/// The resolver and redirect policy cover hostnames and redirect hops; a
/// literal IP in the request URL never reaches the resolver, so the request
/// URL itself is checked here before it is handed to reqwest.
#[derive(Clone)]
pub struct GuardedClient {
    inner: Client,
    classifier: Option<Arc<dyn Classifier>>,
}

impl GuardedClient {
    /// Whether requests are validated (`false` for allow-listed targets).
    pub fn is_guarded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> GuardedRequest {
        self.request(Method::GET, url)
    }

    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> GuardedRequest {
        GuardedRequest {
            builder: self.inner.request(method, url),
            classifier: self.classifier.clone(),
        }
    }

    /// Send a prebuilt request.
    ///
    /// # Errors
    ///
    /// A policy violation if the request URL is private, otherwise the
    /// request failure as a network error.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        send_checked(&self.inner, self.classifier.as_deref(), request).await
    }
}

/// A pending request on a [`GuardedClient`]. Only [`send`](Self::send) dispatches it.
pub struct GuardedRequest {
    builder: RequestBuilder,
    classifier: Option<Arc<dyn Classifier>>,
}

impl GuardedRequest {
    pub fn header(self, key: HeaderName, value: HeaderValue) -> Self {
        self.configure(|builder| builder.header(key, value))
    }

    pub fn body<T: Into<Body>>(self, body: T) -> Self {
        self.configure(|builder| builder.body(body))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.configure(|builder| builder.timeout(timeout))
    }

    /// Apply any other [`RequestBuilder`] option. The URL is still checked on send.
    pub fn configure(self, f: impl FnOnce(RequestBuilder) -> RequestBuilder) -> Self {
        Self {
            builder: f(self.builder),
            classifier: self.classifier,
        }
    }

    /// # Errors
    ///
    /// A policy violation if the request URL is private, otherwise the
    /// request failure as a network error.
    pub async fn send(self) -> Result<Response, Error> {
        let (client, request) = self.builder.build_split();
        let request = request.map_err(from_reqwest)?;
        send_checked(&client, self.classifier.as_deref(), request).await
    }
}

async fn send_checked(
    client: &Client,
    classifier: Option<&dyn Classifier>,
    request: Request,
) -> Result<Response, Error> {
    if let Some(classifier) = classifier {
        check_url(classifier, request.url())?;
    }
    client.execute(request).await.map_err(from_reqwest)
}

/// A guarded client for `options`, validated with the global registry's classifier.
///
/// # Errors
///
/// Configuration errors from agent selection, or a client build failure.
pub fn client(options: &AgentOptions) -> Result<GuardedClient, Error> {
    client_with(Registry::global()?, options)
}

/// Like [`client`], against a given registry.
pub fn client_with(registry: &Registry, options: &AgentOptions) -> Result<GuardedClient, Error> {
    let classifier = registry
        .select(options)?
        .map(|_| Arc::clone(registry.classifier()));
    let inner = build_client(classifier.as_ref())?;
    Ok(GuardedClient { inner, classifier })
}

/// Proxies are disabled: through a proxy the resolver would only ever see
/// the proxy's address, never the target's.
fn build_client(classifier: Option<&Arc<dyn Classifier>>) -> Result<Client, Error> {
    let mut builder = Client::builder().no_proxy();

    if let Some(classifier) = classifier {
        let redirects = Arc::clone(classifier);
        builder = builder
            .dns_resolver(Arc::new(GuardedResolver::new(Arc::clone(classifier))))
            .redirect(RedirectPolicy::custom(move |attempt| {
                let verdict =
                    redirect_verdict(redirects.as_ref(), attempt.url(), attempt.previous().len());
                match verdict {
                    Some(err) => attempt.error(err),
                    None => attempt.follow(),
                }
            }));
    }

    builder
        .build()
        .map_err(|e| Error::Network(io::Error::other(e)))
}

/// GET `options.url()` with the global registry's classifier.
///
/// # Errors
///
/// A policy violation if the URL, any redirect hop, or any resolved address
/// is private; configuration errors from agent selection; otherwise the
/// request failure as a network error.
pub async fn fetch(options: &AgentOptions) -> Result<Response, Error> {
    fetch_with(Registry::global()?, options).await
}

/// Like [`fetch`], against a given registry.
pub async fn fetch_with(registry: &Registry, options: &AgentOptions) -> Result<Response, Error> {
    let client = client_with(registry, options)?;
    let url = Url::parse(options.url())
        .map_err(|e| Error::invalid_url(options.url(), e.to_string()))?;
    client.get(url).send().await
}

fn from_reqwest(err: reqwest::Error) -> Error {
    if let Some(violation) = policy_violation(&err) {
        return Error::PolicyViolation(violation.clone());
    }
    Error::Network(io::Error::other(err))
}
