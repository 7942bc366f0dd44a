//! Process-wide guarded factories, one per transport.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::classify::{Classifier, PrivateRanges};
use crate::connect::{TcpConnector, TlsConnector};
use crate::error::Error;
use crate::guard::Guarded;

static GLOBAL: OnceCell<Registry> = OnceCell::new();

/// The guarded plaintext and TLS factories.
///
/// Reusing one registry keeps the wrapped factories (and their resolver)
/// alive across requests instead of rebuilding them per call.
pub struct Registry {
    http: Guarded<TcpConnector>,
    https: Guarded<TlsConnector>,
}

impl Registry {
    /// The shared registry using [`PrivateRanges`]. Built on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the TLS client configuration cannot be built.
    pub fn global() -> Result<&'static Registry, Error> {
        GLOBAL.get_or_try_init(|| Registry::with_classifier(PrivateRanges))
    }

    /// A standalone registry validating with `classifier`.
    pub fn with_classifier<K: Classifier + 'static>(classifier: K) -> Result<Self, Error> {
        let classifier: Arc<dyn Classifier> = Arc::new(classifier);
        Ok(Self {
            http: Guarded::new(TcpConnector::new(), Arc::clone(&classifier)),
            https: Guarded::new(TlsConnector::new()?, classifier),
        })
    }

    pub fn http(&self) -> &Guarded<TcpConnector> {
        &self.http
    }

    pub fn https(&self) -> &Guarded<TlsConnector> {
        &self.https
    }

    pub fn classifier(&self) -> &Arc<dyn Classifier> {
        self.http.classifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::Connect;

    #[test]
    fn test_global_is_built_once() {
        let first = Registry::global().unwrap();
        let second = Registry::global().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_factories_are_guarded() {
        let registry = Registry::global().unwrap();
        assert!(registry.http().is_guarded());
        assert!(registry.https().is_guarded());
        assert!(registry.http().validates());
        assert!(registry.classifier().is_private("127.0.0.1"));
    }

    #[test]
    fn test_custom_classifier_shared_by_both_transports() {
        let registry = Registry::with_classifier(|address: &str| address == "198.51.100.1").unwrap();
        assert!(registry.http().classifier().is_private("198.51.100.1"));
        assert!(registry.https().classifier().is_private("198.51.100.1"));
        assert!(!registry.https().classifier().is_private("127.0.0.1"));
    }
}
