//! Error types for ssrf-agent.

use std::fmt;
use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Prefix carried by the message of every policy violation, and only by them.
pub const VIOLATION_PREFIX: &str = "SSRF:";

/// Which of the two guard checkpoints rejected a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// The requested host itself classified as private; no socket was opened.
    PreConnect,
    /// DNS resolution of the requested host returned a private address.
    PostResolution,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::PreConnect => f.write_str("pre-connect"),
            Checkpoint::PostResolution => f.write_str("post-resolution"),
        }
    }
}

/// A connection refused by the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub checkpoint: Checkpoint,
    /// Host as it was requested (hostname or literal IP).
    pub host: String,
    /// Address that DNS resolution returned, for post-resolution rejections.
    pub address: Option<IpAddr>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(
                f,
                "{} DNS lookup of private '{}' returned {} is not allowed.",
                VIOLATION_PREFIX, self.host, address
            ),
            None => write!(
                f,
                "{} private address {} is not allowed.",
                VIOLATION_PREFIX, self.host
            ),
        }
    }
}

/// Errors raised while selecting an agent or establishing a guarded connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The guard refused the connection.
    #[error("{0}")]
    PolicyViolation(Violation),

    /// The URL could not be parsed or has no host.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The URL scheme is neither http nor https.
    #[error("Bad protocol, url must start with http/https, got scheme '{scheme}' in {url}")]
    UnsupportedScheme { url: String, scheme: String },

    /// The TLS client configuration could not be built, or the host is not a valid server name.
    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// DNS failure, refused connection, reset and the like. Never altered by the guard.
    #[error(transparent)]
    Network(#[from] io::Error),
}

impl Error {
    pub(crate) fn rejected_before_connect(host: impl Into<String>) -> Self {
        Self::PolicyViolation(Violation {
            checkpoint: Checkpoint::PreConnect,
            host: host.into(),
            address: None,
        })
    }

    pub(crate) fn aborted_after_resolution(host: impl Into<String>, address: IpAddr) -> Self {
        Self::PolicyViolation(Violation {
            checkpoint: Checkpoint::PostResolution,
            host: host.into(),
            address: Some(address),
        })
    }

    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported_scheme(url: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self::UnsupportedScheme {
            url: url.into(),
            scheme: scheme.into(),
        }
    }

    pub(crate) fn tls(reason: impl Into<String>) -> Self {
        Self::Tls {
            reason: reason.into(),
        }
    }

    /// The violation details, if the guard raised this error.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Error::PolicyViolation(v) => Some(v),
            _ => None,
        }
    }

    /// True for `InvalidUrl`, `UnsupportedScheme` and `Tls`: caller misuse, not a security event.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl { .. } | Error::UnsupportedScheme { .. } | Error::Tls { .. }
        )
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Network(e) => e,
            e @ Error::PolicyViolation(_) => io::Error::new(io::ErrorKind::PermissionDenied, e),
            e => io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_connect_message() {
        let err = Error::rejected_before_connect("10.0.0.5");
        assert_eq!(
            err.to_string(),
            "SSRF: private address 10.0.0.5 is not allowed."
        );
        assert_eq!(err.violation().unwrap().checkpoint, Checkpoint::PreConnect);
    }

    #[test]
    fn test_post_resolution_message() {
        let err = Error::aborted_after_resolution("internal.example.com", "127.0.0.1".parse().unwrap());
        assert_eq!(
            err.to_string(),
            "SSRF: DNS lookup of private 'internal.example.com' returned 127.0.0.1 is not allowed."
        );
    }

    #[test]
    fn test_only_violations_carry_prefix() {
        let others = [
            Error::invalid_url("nope", "relative URL without a base"),
            Error::unsupported_scheme("ftp://example.com/", "ftp"),
            Error::tls("bad server name"),
            Error::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
        ];
        for err in others {
            assert!(!err.to_string().starts_with(VIOLATION_PREFIX), "{err}");
            assert!(err.violation().is_none());
        }
    }

    #[test]
    fn test_configuration_errors() {
        assert!(Error::unsupported_scheme("ftp://x/", "ftp").is_configuration());
        assert!(Error::invalid_url("x", "y").is_configuration());
        assert!(!Error::rejected_before_connect("127.0.0.1").is_configuration());
    }

    #[test]
    fn test_into_io_error_keeps_violation() {
        let io_err: io::Error = Error::rejected_before_connect("127.0.0.1").into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
        let inner = io_err.get_ref().unwrap().downcast_ref::<Error>().unwrap();
        assert!(inner.violation().is_some());
    }

    #[test]
    fn test_network_error_passes_through_unchanged() {
        let original = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let io_err: io::Error = Error::Network(original).into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(io_err.to_string(), "timed out");
    }
}
