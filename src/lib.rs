//! # ssrf-agent
//!
//! SSRF-guarded connection factories.
//!
//! `ssrf-agent` wraps a connection factory so that every outbound socket is
//! validated twice: once against the requested host before any I/O starts,
//! and once against the address DNS actually returned, at lookup time. The
//! second check closes the gap a hostname-only check leaves open to DNS
//! rebinding. It does not resolve DNS itself (the wrapped factory does) and
//! it is not an HTTP client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ssrf_agent::{is_policy_violation, select_agent, AgentOptions};
//! use url::Url;
//!
//! # async fn example() -> Result<(), ssrf_agent::Error> {
//! let url = Url::parse("https://example.com/api").unwrap();
//! let options = AgentOptions::new(url.as_str()).allow_list(["trusted.internal"]);
//!
//! match select_agent(&options)? {
//!     Some(agent) => match agent.connect_url(&url).await {
//!         Ok(_stream) => { /* hand the stream to your HTTP client */ }
//!         Err(e) if is_policy_violation(&e) => { /* blocked by policy */ }
//!         Err(e) => return Err(e),
//!     },
//!     None => { /* allow-listed: connect without filtering */ }
//! }
//! # Ok(())
//! # }
//! ```

mod allow_list;
mod classify;
mod connect;
mod error;
mod guard;
mod log;
mod registry;
mod select;
mod violation;

#[cfg(feature = "fetch")]
mod fetch;

pub use allow_list::{
    allow_list_from, allow_list_from_env, parse_allow_list, ALLOW_LIST_VAR, LEGACY_ALLOW_LIST_VAR,
};
pub use classify::{is_private, is_private_ip, Classifier, PrivateRanges};
pub use connect::{
    AgentStream, Connect, Connecting, HardClose, LookupEvent, LookupReporter, Target, TcpConnector,
    TlsConnector,
};
pub use error::{Checkpoint, Error, Violation, VIOLATION_PREFIX};
pub use guard::{guard, Guarded};
pub use log::LogSink;
pub use registry::Registry;
pub use select::{select_agent, Agent, AgentOptions};
pub use violation::{
    is_policy_violation, is_violation_message, policy_violation, report_if_policy_violation,
};

#[cfg(feature = "fetch")]
pub use fetch::{
    client, client_with, fetch, fetch_with, GuardedClient, GuardedRequest, GuardedResolver,
};
