//! Outcome classification for errors and results
//!
//! This module decides whether a completed call counts as a success, a
//! failure, or is ignored entirely. Errors and return values are passed as
//! `&dyn Any` so classifiers can downcast to the caller's own types.
//!
//! Precedence: an ignore match always wins over a record match.

use std::any::Any;
use std::fmt;
use std::time::Duration;

/// How a completed call is counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Counted as a successful call
    Success,
    /// Counted as a failed call
    Failure,
    /// Not recorded at all
    Ignored,
}

/// Context provided to classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// Context provided to classifiers for result evaluation
#[derive(Debug)]
pub struct ResultContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The value the call returned (can be downcast to specific types)
    pub result: &'a dyn Any,
    /// Duration of the call
    pub duration: Duration,
}

/// Trait for classifying completed calls
///
/// # Examples
///
/// ```rust
/// use sliding_breaker::{FailureClassifier, FailureContext, Verdict};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn classify_error(&self, ctx: &FailureContext<'_>) -> Verdict {
///         match ctx.error.downcast_ref::<u16>() {
///             Some(status) if *status < 500 => Verdict::Ignored,
///             _ => Verdict::Failure,
///         }
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Classify a call that returned an error. Defaults to `Failure`.
    fn classify_error(&self, _ctx: &FailureContext<'_>) -> Verdict {
        Verdict::Failure
    }

    /// Classify a call that returned a value. Defaults to `Success`.
    fn classify_result(&self, _ctx: &ResultContext<'_>) -> Verdict {
        Verdict::Success
    }
}

/// Default classifier: every error is a failure, every result a success
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {}

type ErrorPredicate = Box<dyn Fn(&FailureContext<'_>) -> bool + Send + Sync>;
type ResultPredicate = Box<dyn Fn(&ResultContext<'_>) -> bool + Send + Sync>;

/// Predicate-based classifier using closures
///
/// - `ignore_error`: matching errors are not recorded at all
/// - `record_error`: when set, only matching errors are failures; others count as successes
/// - `record_result`: matching return values are failures
///
/// # Examples
///
/// ```rust
/// use sliding_breaker::{FailureClassifier, PredicateClassifier, ResultContext, Verdict};
/// use std::time::Duration;
///
/// let classifier = PredicateClassifier::new()
///     .record_result(|ctx| ctx.result.downcast_ref::<&str>() == Some(&"failure"));
///
/// let ctx = ResultContext {
///     circuit_name: "api",
///     result: &"failure",
///     duration: Duration::ZERO,
/// };
/// assert_eq!(classifier.classify_result(&ctx), Verdict::Failure);
/// ```
#[derive(Default)]
pub struct PredicateClassifier {
    ignore_error: Option<ErrorPredicate>,
    record_error: Option<ErrorPredicate>,
    record_result: Option<ResultPredicate>,
}

impl PredicateClassifier {
    /// Create a classifier with no predicates (behaves like `DefaultClassifier`)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.ignore_error = Some(Box::new(predicate));
        self
    }

    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.record_error = Some(Box::new(predicate));
        self
    }

    pub fn record_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResultContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.record_result = Some(Box::new(predicate));
        self
    }
}

impl FailureClassifier for PredicateClassifier {
    fn classify_error(&self, ctx: &FailureContext<'_>) -> Verdict {
        if self.ignore_error.as_ref().is_some_and(|ignore| ignore(ctx)) {
            return Verdict::Ignored;
        }
        match &self.record_error {
            Some(record) if !record(ctx) => Verdict::Success,
            _ => Verdict::Failure,
        }
    }

    fn classify_result(&self, ctx: &ResultContext<'_>) -> Verdict {
        match &self.record_result {
            Some(record) if record(ctx) => Verdict::Failure,
            _ => Verdict::Success,
        }
    }
}

impl fmt::Debug for PredicateClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("ignore_error", &self.ignore_error.as_ref().map(|_| "<closure>"))
            .field("record_error", &self.record_error.as_ref().map(|_| "<closure>"))
            .field("record_result", &self.record_result.as_ref().map(|_| "<closure>"))
            .finish()
    }
}
