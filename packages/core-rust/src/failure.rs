//! Captured failures and error matching.
//!
//! Failures never cross an async boundary as a returned error: processors
//! record them on the exchange as a [`CapturedFailure`], and error-handling
//! nodes decide what to do by matching the failure against
//! [`ErrorMatcher`]s.

use std::any::type_name;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// An error recorded on an exchange, plus the node that raised it.
///
/// The error is shared behind an `Arc` so exchanges (and their failure
/// history) stay cheap to clone.
#[derive(Clone)]
pub struct CapturedFailure {
    error: Arc<anyhow::Error>,
    failed_at: Option<String>,
}

impl CapturedFailure {
    /// Wraps an error with no node information.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(error.into()),
            failed_at: None,
        }
    }

    /// Wraps an error raised by the named node.
    pub fn at(error: impl Into<anyhow::Error>, node: impl Into<String>) -> Self {
        Self {
            error: Arc::new(error.into()),
            failed_at: Some(node.into()),
        }
    }

    /// Attaches `node` as the failing node unless one is already recorded.
    #[must_use]
    pub fn or_at(mut self, node: impl Into<String>) -> Self {
        if self.failed_at.is_none() {
            self.failed_at = Some(node.into());
        }
        self
    }

    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Label of the node where the failure occurred, if known.
    #[must_use]
    pub fn failed_at(&self) -> Option<&str> {
        self.failed_at.as_deref()
    }

    /// Returns the first error in the cause chain of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.error.chain().find_map(|cause| cause.downcast_ref::<E>())
    }

    /// Returns `true` if this failure and `other` share the same error
    /// instance (not merely an equal message).
    #[must_use]
    pub fn same_error(&self, other: &CapturedFailure) -> bool {
        Arc::ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Debug for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFailure")
            .field("error", &format_args!("{:#}", self.error))
            .field("failed_at", &self.failed_at)
            .finish()
    }
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failed_at {
            Some(node) => write!(f, "{:#} (at {node})", self.error),
            None => write!(f, "{:#}", self.error),
        }
    }
}

type MatchFn = dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync;

/// Matches captured failures by error type.
///
/// Rust errors have no class hierarchy, so a matcher tests every error in
/// the failure's cause chain (outermost first). A matcher built with
/// [`ErrorMatcher::of`] therefore also matches when the error of interest
/// was wrapped with `anyhow::Context`.
#[derive(Clone)]
pub struct ErrorMatcher {
    name: String,
    test: Arc<MatchFn>,
}

impl ErrorMatcher {
    /// Matches failures whose cause chain contains an error of type `E`.
    #[must_use]
    pub fn of<E>() -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            name: short_type_name::<E>(),
            test: Arc::new(|cause| cause.is::<E>()),
        }
    }

    /// Matches every failure.
    #[must_use]
    pub fn any() -> Self {
        Self {
            name: "*".to_string(),
            test: Arc::new(|_| true),
        }
    }

    /// Matches with a custom test applied to each error in the chain.
    pub fn custom<F>(name: impl Into<String>, test: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            test: Arc::new(test),
        }
    }

    /// Matches when any error in the chain renders a message containing
    /// `needle`. Useful for errors built with `anyhow!`, which carry no
    /// distinct type.
    pub fn message_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            name: format!("message~{needle}"),
            test: Arc::new(move |cause| cause.to_string().contains(&needle)),
        }
    }

    /// Human-readable name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn matches(&self, failure: &CapturedFailure) -> bool {
        failure.error().chain().any(|cause| (self.test)(cause))
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

fn short_type_name<E>() -> String {
    let full = type_name::<E>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

/// Failure history kept across redelivery attempts.
#[derive(Debug, Clone)]
pub struct FailureHistory {
    /// Number of failed attempts observed so far.
    pub attempts: u32,
    /// The failure from the first attempt.
    pub first: CapturedFailure,
    /// The failure from the most recent attempt.
    pub last: CapturedFailure,
}

impl FailureHistory {
    #[must_use]
    pub fn new(first: CapturedFailure) -> Self {
        Self {
            attempts: 1,
            last: first.clone(),
            first,
        }
    }

    pub fn record(&mut self, failure: CapturedFailure) {
        self.attempts += 1;
        self.last = failure;
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Debug, thiserror::Error)]
    #[error("timed out")]
    struct TimedOut;

    #[test]
    fn matcher_finds_type_directly() {
        let failure = CapturedFailure::new(DiskFull);
        assert!(ErrorMatcher::of::<DiskFull>().matches(&failure));
        assert!(!ErrorMatcher::of::<TimedOut>().matches(&failure));
    }

    #[test]
    fn matcher_walks_cause_chain() {
        let err = Err::<(), _>(DiskFull).context("writing batch").unwrap_err();
        let failure = CapturedFailure::new(err);
        assert!(ErrorMatcher::of::<DiskFull>().matches(&failure));
        assert!(failure.downcast_ref::<DiskFull>().is_some());
    }

    #[test]
    fn any_and_message_matchers() {
        let failure = CapturedFailure::at(anyhow::anyhow!("connection refused"), "to:tcp");
        assert!(ErrorMatcher::any().matches(&failure));
        assert!(ErrorMatcher::message_contains("refused").matches(&failure));
        assert!(!ErrorMatcher::message_contains("reset").matches(&failure));
        assert_eq!(failure.failed_at(), Some("to:tcp"));
        assert_eq!(failure.or_at("other").failed_at(), Some("to:tcp"));
        assert_eq!(
            CapturedFailure::new(TimedOut).or_at("to:x").failed_at(),
            Some("to:x")
        );
    }

    #[test]
    fn matcher_name_is_short_type_name() {
        assert_eq!(ErrorMatcher::of::<DiskFull>().name(), "DiskFull");
    }

    #[test]
    fn history_tracks_first_and_last() {
        let first = CapturedFailure::new(DiskFull);
        let mut history = FailureHistory::new(first.clone());
        let second = CapturedFailure::new(TimedOut);
        history.record(second.clone());
        assert_eq!(history.attempts, 2);
        assert!(history.first.same_error(&first));
        assert!(history.last.same_error(&second));
    }
}
