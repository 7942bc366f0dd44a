//! Telling policy violations apart from ordinary failures.
//!
//! Violations are recognized by their typed discriminant anywhere in an error's
//! source chain, including inside `io::Error` and HTTP client errors. Errors
//! that crossed a text-only boundary are still recognized by
//! [`VIOLATION_PREFIX`].

use std::error::Error as StdError;
use std::io;

use crate::error::{Error, Violation, VIOLATION_PREFIX};
use crate::log::LogSink;

/// True if `message` has the shape of a policy violation message.
pub fn is_violation_message(message: &str) -> bool {
    message.starts_with(VIOLATION_PREFIX)
}

/// The typed violation carried somewhere in `err`'s source chain.
pub fn policy_violation<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Violation> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(violation) = direct_violation(e) {
            return Some(violation);
        }
        current = e.source();
    }
    None
}

/// True if `err`, or any error it wraps, was raised by the connection guard.
pub fn is_policy_violation(err: &(dyn StdError + 'static)) -> bool {
    violation_message(err).is_some()
}

/// Pass the violation message to `sink` if `err` is a policy violation.
pub fn report_if_policy_violation(err: &(dyn StdError + 'static), sink: &LogSink) {
    if let Some(message) = violation_message(err) {
        sink.log(&message);
    }
}

fn violation_message(err: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(violation) = policy_violation(err) {
        return Some(violation.to_string());
    }

    let mut current = Some(err);
    while let Some(e) = current {
        let message = e.to_string();
        if is_violation_message(&message) {
            return Some(message);
        }
        current = e.source();
    }
    None
}

fn direct_violation<'a>(e: &'a (dyn StdError + 'static)) -> Option<&'a Violation> {
    if let Some(ours) = e.downcast_ref::<Error>() {
        return match ours {
            Error::PolicyViolation(violation) => Some(violation),
            // `Network` is transparent, so its io::Error never shows up as a source
            Error::Network(io_err) => wrapped_violation(io_err),
            _ => None,
        };
    }
    e.downcast_ref::<io::Error>().and_then(wrapped_violation)
}

/// `io::Error::source` skips a custom payload, so look inside explicitly.
fn wrapped_violation(io_err: &io::Error) -> Option<&Violation> {
    let inner: &(dyn StdError + 'static) = io_err.get_ref()?;
    policy_violation(inner)
}
