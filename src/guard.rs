//! The connection guard: pre-connect and post-resolution address validation
//! wrapped around any [`Connect`] factory.
//!
//! Checking a hostname before connecting is not enough. DNS can answer with a
//! different (private) address by the time the factory resolves it, so the
//! guard also watches the factory's own lookup event and aborts the attempt
//! when the resolved address is private, even if the socket already
//! connected.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::classify::Classifier;
use crate::connect::{Connect, Connecting, HardClose, LookupEvent, Target};
use crate::error::{Checkpoint, Error};

/// A connection factory wrapped with address validation.
///
/// Built with [`guard`] or [`Guarded::new`]. The wrapped factory is moved in
/// and never modified; `Guarded` itself implements [`Connect`] so it can be
/// used anywhere the wrapped factory could.
pub struct Guarded<C> {
    inner: C,
    classifier: Arc<dyn Classifier>,
    validate: bool,
}

/// Wrap `factory` so every connection it makes is validated with `classifier`.
///
/// Wrapping a factory that is already guarded yields a pass-through wrapper:
/// connections are validated once, by the inner guard.
pub fn guard<C, K>(factory: C, classifier: K) -> Guarded<C>
where
    C: Connect,
    K: Classifier + 'static,
{
    Guarded::new(factory, Arc::new(classifier))
}

impl<C: Connect> Guarded<C> {
    pub fn new(inner: C, classifier: Arc<dyn Classifier>) -> Self {
        let validate = !inner.is_guarded();
        Self {
            inner,
            classifier,
            validate,
        }
    }

    /// The wrapped factory.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn classifier(&self) -> &Arc<dyn Classifier> {
        &self.classifier
    }

    /// False when this wrapper defers to an inner guard.
    pub fn validates(&self) -> bool {
        self.validate
    }
}

impl<C: Connect> Connect for Guarded<C> {
    type Stream = C::Stream;

    fn connect(&self, target: &Target) -> Result<Connecting<C::Stream>, Error> {
        if !self.validate {
            return self.inner.connect(target);
        }

        if self.classifier.is_private(target.host()) {
            tracing::warn!(
                checkpoint = %Checkpoint::PreConnect,
                host = target.host(),
                "rejected connection to private address"
            );
            return Err(Error::rejected_before_connect(target.host()));
        }

        let (lookup, socket) = self.inner.connect(target)?.into_parts();
        let Some(lookup) = lookup else {
            return Ok(Connecting::new(socket));
        };

        let host = target.host().to_string();
        let classifier = Arc::clone(&self.classifier);
        Ok(Connecting::new(watch_lookup(host, classifier, lookup, socket)))
    }

    fn is_guarded(&self) -> bool {
        true
    }
}

/// Drive `socket` while watching its lookup event.
///
/// Biased toward the event so a private answer drops the socket future
/// before the handshake can finish whenever the factory reports first.
async fn watch_lookup<S: HardClose>(
    host: String,
    classifier: Arc<dyn Classifier>,
    mut lookup: oneshot::Receiver<LookupEvent>,
    mut socket: BoxFuture<'static, Result<S, Error>>,
) -> Result<S, Error> {
    tokio::select! {
        biased;

        event = &mut lookup => {
            // Lookup failures and dropped reporters are not ours to judge:
            // the socket future fails or succeeds on its own.
            if let Ok(Ok(address)) = event {
                check_resolved(&host, classifier.as_ref(), address)?;
            }
            socket.await
        }

        result = &mut socket => {
            let stream = result?;
            match lookup.try_recv() {
                Ok(Ok(address)) => {
                    if let Err(e) = check_resolved(&host, classifier.as_ref(), address) {
                        stream.hard_close();
                        return Err(e);
                    }
                }
                Ok(Err(_)) | Err(TryRecvError::Closed) => {}
                Err(TryRecvError::Empty) => {
                    stream.hard_close();
                    return Err(Error::Network(io::Error::other(format!(
                        "connection to '{host}' completed before its DNS lookup was reported"
                    ))));
                }
            }
            Ok(stream)
        }
    }
}

fn check_resolved(host: &str, classifier: &dyn Classifier, address: IpAddr) -> Result<(), Error> {
    if classifier.is_private(&address.to_string()) {
        tracing::warn!(
            checkpoint = %Checkpoint::PostResolution,
            host,
            %address,
            "DNS lookup returned a private address, aborting connection"
        );
        return Err(Error::aborted_after_resolution(host, address));
    }
    tracing::debug!(host, %address, "DNS lookup returned a public address");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::classify::PrivateRanges;
    use crate::violation::is_policy_violation;

    /// How a stub factory orders its lookup event against socket completion.
    #[derive(Clone, Copy)]
    enum Timing {
        /// Report, yield, then complete: the guard sees the event first.
        ReportThenConnect,
        /// Report and complete in the same poll: the socket wins the race.
        ConnectedAlready,
        /// Keep the reporter alive without reporting.
        NeverReport,
    }

    /// Stands in for a pooled factory: "resolves" every hostname to a fixed
    /// answer and hands out in-memory sockets.
    struct StubConnector {
        answer: Option<Result<IpAddr, io::ErrorKind>>,
        timing: Timing,
        calls: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<DuplexStream>>>,
        held: Arc<Mutex<Vec<crate::connect::LookupReporter>>>,
    }

    impl StubConnector {
        fn resolving_to(answer: &str) -> Self {
            Self::with_answer(Some(Ok(answer.parse().unwrap())))
        }

        fn with_answer(answer: Option<Result<IpAddr, io::ErrorKind>>) -> Self {
            Self {
                answer,
                timing: Timing::ReportThenConnect,
                calls: Arc::new(AtomicUsize::new(0)),
                peers: Arc::new(Mutex::new(Vec::new())),
                held: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn timing(mut self, timing: Timing) -> Self {
            self.timing = timing;
            self
        }

        fn pair(&self) -> DuplexStream {
            let (ours, theirs) = tokio::io::duplex(64);
            self.peers.lock().unwrap().push(theirs);
            ours
        }
    }

    impl Connect for StubConnector {
        type Stream = DuplexStream;

        fn connect(&self, target: &Target) -> Result<Connecting<DuplexStream>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stream = self.pair();

            let answer = match (target.ip(), self.answer.clone()) {
                (Some(_), _) | (None, None) => return Ok(Connecting::new(async move { Ok(stream) })),
                (None, Some(answer)) => answer,
            };

            let timing = self.timing;
            let held = Arc::clone(&self.held);
            Ok(Connecting::resolving(move |reporter| async move {
                match answer {
                    Err(kind) => {
                        reporter.report(Err(io::Error::new(kind, "lookup failed")));
                        Err(Error::Network(io::Error::new(kind, "getaddrinfo ENOTFOUND")))
                    }
                    Ok(ip) => {
                        match timing {
                            Timing::ReportThenConnect => {
                                reporter.report(Ok(ip));
                                tokio::task::yield_now().await;
                            }
                            Timing::ConnectedAlready => reporter.report(Ok(ip)),
                            Timing::NeverReport => {
                                held.lock().unwrap().push(reporter);
                            }
                        }
                        Ok(stream)
                    }
                }
            }))
        }
    }

    async fn connect<C: Connect>(factory: &C, host: &str) -> Result<C::Stream, Error> {
        factory.connect(&Target::new(host, 80))?.establish().await
    }

    // ==================== Pre-connect ====================

    #[tokio::test]
    async fn test_literal_private_rejected_before_connect() {
        let stub = StubConnector::resolving_to("93.184.216.34");
        let calls = Arc::clone(&stub.calls);
        let guarded = guard(stub, PrivateRanges);

        let err = connect(&guarded, "10.0.0.5").await.unwrap_err();
        assert!(is_policy_violation(&err));
        assert_eq!(err.violation().unwrap().checkpoint, Checkpoint::PreConnect);
        assert_eq!(err.to_string(), "SSRF: private address 10.0.0.5 is not allowed.");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_literal_private_ipv6_rejected() {
        let stub = StubConnector::resolving_to("93.184.216.34");
        let calls = Arc::clone(&stub.calls);
        let guarded = guard(stub, PrivateRanges);

        for host in ["[::1]", "[fe80::1]", "[::ffff:127.0.0.1]", "localhost"] {
            let err = connect(&guarded, host).await.unwrap_err();
            assert!(is_policy_violation(&err), "{host}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_literal_public_connects() {
        let stub = StubConnector::resolving_to("10.0.0.1");
        let calls = Arc::clone(&stub.calls);
        let guarded = guard(stub, PrivateRanges);

        // Literal hosts skip resolution, so the stub's private answer never applies.
        assert!(connect(&guarded, "93.184.216.34").await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ==================== Post-resolution ====================

    #[tokio::test]
    async fn test_public_resolution_connects() {
        let guarded = guard(StubConnector::resolving_to("93.184.216.34"), PrivateRanges);
        let mut stream = connect(&guarded, "example.com").await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut peer = guarded.inner().peers.lock().unwrap().pop().unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_private_resolution_aborted() {
        let guarded = guard(StubConnector::resolving_to("127.0.0.1"), PrivateRanges);

        let err = connect(&guarded, "internal.example.com").await.unwrap_err();
        assert!(is_policy_violation(&err));
        let violation = err.violation().unwrap();
        assert_eq!(violation.checkpoint, Checkpoint::PostResolution);
        assert_eq!(violation.host, "internal.example.com");
        assert_eq!(violation.address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(
            err.to_string(),
            "SSRF: DNS lookup of private 'internal.example.com' returned 127.0.0.1 is not allowed."
        );
    }

    #[tokio::test]
    async fn test_private_resolution_after_connect_hard_closes() {
        let stub = StubConnector::resolving_to("169.254.169.254").timing(Timing::ConnectedAlready);
        let peers = Arc::clone(&stub.peers);
        let guarded = guard(stub, PrivateRanges);

        let err = connect(&guarded, "rebind.example.com").await.unwrap_err();
        assert_eq!(err.violation().unwrap().checkpoint, Checkpoint::PostResolution);

        // Our end was dropped: the far side sees EOF, nothing was ever written.
        let mut peer = peers.lock().unwrap().pop().unwrap();
        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_passes_through() {
        let guarded = guard(
            StubConnector::with_answer(Some(Err(io::ErrorKind::NotFound))),
            PrivateRanges,
        );

        let err = connect(&guarded, "nxdomain.example.com").await.unwrap_err();
        assert!(!is_policy_violation(&err));
        match err {
            Error::Network(e) => {
                assert_eq!(e.kind(), io::ErrorKind::NotFound);
                assert_eq!(e.to_string(), "getaddrinfo ENOTFOUND");
            }
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_lookup_report_fails_closed() {
        let stub = StubConnector::resolving_to("93.184.216.34").timing(Timing::NeverReport);
        let guarded = guard(stub, PrivateRanges);

        let err = connect(&guarded, "example.com").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(!is_policy_violation(&err));
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let only_doc_range = |address: &str| address.starts_with("203.0.113.");
        let guarded = guard(StubConnector::resolving_to("127.0.0.1"), only_doc_range);
        assert!(connect(&guarded, "internal.example.com").await.is_ok());

        let guarded = guard(StubConnector::resolving_to("203.0.113.7"), only_doc_range);
        assert!(connect(&guarded, "example.com").await.is_err());
    }

    // ==================== Idempotence ====================

    #[tokio::test]
    async fn test_double_wrap_validates_once() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counting = {
            let checks = Arc::clone(&checks);
            move |address: &str| {
                checks.fetch_add(1, Ordering::SeqCst);
                PrivateRanges.is_private(address)
            }
        };

        let once = guard(StubConnector::resolving_to("93.184.216.34"), counting.clone());
        let twice = guard(once, counting);
        assert!(twice.is_guarded());
        assert!(!twice.validates());
        assert!(twice.inner().validates());

        connect(&twice, "example.com").await.unwrap();
        // One pre-connect check plus one post-resolution check.
        assert_eq!(checks.load(Ordering::SeqCst), 2);

        let err = connect(&twice, "127.0.0.1").await.unwrap_err();
        assert_eq!(err.violation().unwrap().checkpoint, Checkpoint::PreConnect);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unguarded_factory_reports_unguarded() {
        assert!(!StubConnector::resolving_to("93.184.216.34").is_guarded());
    }
}
