//! Choosing the guarded factory for an outbound request.

use url::Url;

use crate::connect::{AgentStream, Connect, Target, TcpConnector, TlsConnector};
use crate::error::Error;
use crate::guard::Guarded;
use crate::log::LogSink;
use crate::registry::Registry;

/// Per-request selection options.
///
/// Defaults: empty allow list, no-op log sink.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    url: String,
    allow_list: Vec<String>,
    log: LogSink,
}

impl AgentOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            allow_list: Vec::new(),
            log: LogSink::none(),
        }
    }

    /// Hostnames exempt from validation. Matched exactly against the URL's
    /// hostname: no case folding, no trailing-dot or subdomain matching.
    pub fn allow_list<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn log(mut self, sink: LogSink) -> Self {
        self.log = sink;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn allow_list_domains(&self) -> &[String] {
        &self.allow_list
    }

    pub fn log_sink(&self) -> &LogSink {
        &self.log
    }
}

/// A guarded factory chosen for one request.
#[derive(Clone, Copy)]
pub enum Agent<'a> {
    Http(&'a Guarded<TcpConnector>),
    Https(&'a Guarded<TlsConnector>),
}

impl Agent<'_> {
    pub fn is_https(&self) -> bool {
        matches!(self, Agent::Https(_))
    }

    /// Open a validated connection to `target`.
    pub async fn connect(&self, target: &Target) -> Result<AgentStream, Error> {
        match self {
            Agent::Http(factory) => {
                let stream = factory.connect(target)?.establish().await?;
                Ok(AgentStream::Plain(stream))
            }
            Agent::Https(factory) => {
                let stream = factory.connect(target)?.establish().await?;
                Ok(AgentStream::Tls(Box::new(stream)))
            }
        }
    }

    /// Open a validated connection to the host and port of `url`.
    pub async fn connect_url(&self, url: &Url) -> Result<AgentStream, Error> {
        self.connect(&Target::from_url(url)?).await
    }
}

impl std::fmt::Debug for Agent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Agent::Http(_) => f.write_str("Agent::Http"),
            Agent::Https(_) => f.write_str("Agent::Https"),
        }
    }
}

/// Pick the guarded factory for `options.url()` from the global registry.
///
/// `Ok(None)` means the host is allow-listed: do not filter this request.
///
/// # Errors
///
/// [`Error::InvalidUrl`] for an unparsable URL and [`Error::UnsupportedScheme`]
/// for anything but http/https. Neither is a policy violation.
pub fn select_agent(options: &AgentOptions) -> Result<Option<Agent<'static>>, Error> {
    Registry::global()?.select(options)
}

impl Registry {
    /// Pick the guarded factory for `options.url()` from this registry.
    ///
    /// # Errors
    ///
    /// See [`select_agent`].
    pub fn select(&self, options: &AgentOptions) -> Result<Option<Agent<'_>>, Error> {
        let url = Url::parse(options.url())
            .map_err(|e| Error::invalid_url(options.url(), e.to_string()))?;

        if let Some(host) = url.host_str() {
            if options.allow_list.iter().any(|domain| domain == host) {
                tracing::debug!(host, "allow list match, skipping address validation");
                options.log.log(&format!(
                    "Allow list match: {}, in: {}, ignore ssrf",
                    host,
                    options.allow_list.join(",")
                ));
                return Ok(None);
            }
        }

        match url.scheme() {
            "https" => Ok(Some(Agent::Https(self.https()))),
            "http" => Ok(Some(Agent::Http(self.http()))),
            scheme => Err(Error::unsupported_scheme(options.url(), scheme)),
        }
    }
}
