use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fixed vocabulary used to drive retry, fallback and user messaging decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    ResourceExhausted,
    DependencyFailure,
    RateLimited,
    AuthFailure,
    InvalidInput,
    Unknown,
}

/// What the caller should be told to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    RetryLater,
    FixRequest,
    ContactSupport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::DependencyFailure => "DEPENDENCY_FAILURE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::AuthFailure => "AUTH_FAILURE",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Fatal kinds are never retried and never degraded to a fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::AuthFailure | ErrorKind::InvalidInput)
    }

    pub fn user_action(&self) -> UserAction {
        match self {
            ErrorKind::Timeout
            | ErrorKind::RateLimited
            | ErrorKind::DependencyFailure
            | ErrorKind::ResourceExhausted => UserAction::RetryLater,
            ErrorKind::InvalidInput => UserAction::FixRequest,
            ErrorKind::AuthFailure | ErrorKind::Unknown => UserAction::ContactSupport,
        }
    }

    /// Retry hint used when the failing call did not supply its own.
    pub fn default_retry_after(&self) -> Option<Duration> {
        match self {
            ErrorKind::RateLimited | ErrorKind::ResourceExhausted => Some(Duration::from_secs(60)),
            ErrorKind::Timeout | ErrorKind::DependencyFailure => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic details attached to a classified error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub cause: Option<String>,
}

/// An error tagged with an [`ErrorKind`].
///
/// Values are immutable once built: the `with_*` helpers consume the error and
/// return a new one.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
    retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DependencyFailure, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimited, message)
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn attempts(&self) -> u32 {
        self.context.attempts
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.context.elapsed_ms)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.context.cause = Some(cause.into());
        self
    }

    /// Stamp the attempt count and elapsed time of the policy run that produced
    /// this error. The kind is never changed.
    pub(crate) fn enriched(mut self, operation: &str, attempts: u32, elapsed: Duration) -> Self {
        self.context.operation = Some(operation.to_string());
        self.context.attempts = attempts;
        self.context.elapsed_ms = elapsed.as_millis() as u64;
        self
    }

    /// Classify an arbitrary collaborator error.
    ///
    /// An already-classified error anywhere in the chain is returned as-is;
    /// anything else is classified from its message.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(classified) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
        {
            return classified.clone();
        }

        let message = format!("{:#}", err);
        Self::new(classify_message(&message), message.clone()).with_cause(message)
    }
}

/// Keyword classification for errors that arrive without a kind.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out", "deadline exceeded"]) {
        ErrorKind::Timeout
    } else if has(&["out of memory", "memory"]) {
        ErrorKind::ResourceExhausted
    } else if has(&["rate limit", "too many requests", "429", "quota"]) {
        ErrorKind::RateLimited
    } else if has(&[
        "api key",
        "unauthorized",
        "forbidden",
        "authentication",
        "401",
        "403",
    ]) {
        ErrorKind::AuthFailure
    } else if has(&[
        "connection",
        "unavailable",
        "service",
        "502",
        "503",
        "504",
        "network",
    ]) {
        ErrorKind::DependencyFailure
    } else if has(&["invalid", "validation", "malformed"]) {
        ErrorKind::InvalidInput
    } else {
        ErrorKind::Unknown
    }
}

/// Serializable body the orchestrator returns to end users.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub category: UserAction,
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl From<&ClassifiedError> for ErrorResponse {
    fn from(err: &ClassifiedError) -> Self {
        let kind = err.kind();
        let (title, message, suggestions): (&str, &str, &[&str]) = match kind {
            ErrorKind::Timeout => (
                "Taking longer than expected",
                "Sorry, your question took too long to answer this time. Please try again in a moment.",
                &["Try asking a shorter or more specific question", "Wait a few seconds and retry"],
            ),
            ErrorKind::ResourceExhausted => (
                "System busy",
                "Sorry, we are handling a lot of work right now. Please try again shortly.",
                &["Retry in about a minute", "Ask for less information at once"],
            ),
            ErrorKind::DependencyFailure => (
                "Temporarily unavailable",
                "Sorry, part of the system is temporarily unavailable. Please try again in a moment.",
                &["Wait a moment and retry", "If this keeps happening, check back later"],
            ),
            ErrorKind::RateLimited => (
                "Too many requests",
                "You are asking questions faster than we can answer them. Please wait a moment before trying again.",
                &["Wait before sending the next question", "Combine related questions into one"],
            ),
            ErrorKind::AuthFailure => (
                "Service configuration problem",
                "Sorry, we could not complete your request because of a configuration problem on our side.",
                &["Contact support if this continues"],
            ),
            ErrorKind::InvalidInput => (
                "Request could not be processed",
                "The request was not in a form we can answer. Please check it and try again.",
                &["Make sure the question is not empty", "Check the session identifier"],
            ),
            ErrorKind::Unknown => (
                "Unexpected problem",
                "Sorry, something unexpected happened while answering your question.",
                &["Try again", "Contact support if this continues"],
            ),
        };

        Self {
            error: kind,
            category: kind.user_action(),
            title: title.to_string(),
            message: message.to_string(),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
            retry_after_seconds: err
                .retry_after()
                .or_else(|| kind.default_retry_after())
                .map(|d| d.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_messages() {
        let cases = [
            ("Connection timeout occurred", ErrorKind::Timeout),
            ("Out of memory error", ErrorKind::ResourceExhausted),
            ("Rate limit exceeded", ErrorKind::RateLimited),
            ("Invalid API key provided", ErrorKind::AuthFailure),
            ("Service unavailable", ErrorKind::DependencyFailure),
            ("Invalid input format", ErrorKind::InvalidInput),
            ("Something went wrong", ErrorKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(classify_message(message), expected, "message: {}", message);
        }
    }

    #[test]
    fn test_classify_keeps_existing_kind() {
        let limited = ClassifiedError::rate_limited("slow down", Some(Duration::from_secs(7)));
        let wrapped = anyhow::Error::from(limited).context("calling llm");

        let classified = ClassifiedError::classify(&wrapped);
        assert_eq!(classified.kind(), ErrorKind::RateLimited);
        assert_eq!(classified.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_enrich_preserves_kind() {
        let err = ClassifiedError::dependency("vector store down")
            .enriched("vector_search", 3, Duration::from_millis(1500));

        assert_eq!(err.kind(), ErrorKind::DependencyFailure);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.elapsed(), Duration::from_millis(1500));
        assert_eq!(err.context().operation.as_deref(), Some("vector_search"));
    }

    #[test]
    fn test_user_actions() {
        assert_eq!(ErrorKind::Timeout.user_action(), UserAction::RetryLater);
        assert_eq!(ErrorKind::RateLimited.user_action(), UserAction::RetryLater);
        assert_eq!(ErrorKind::InvalidInput.user_action(), UserAction::FixRequest);
        assert_eq!(ErrorKind::AuthFailure.user_action(), UserAction::ContactSupport);
        assert_eq!(ErrorKind::Unknown.user_action(), UserAction::ContactSupport);
    }

    #[test]
    fn test_error_response() {
        let err = ClassifiedError::timeout("embedding exceeded 2s");
        let response = ErrorResponse::from(&err);
        assert_eq!(response.category, UserAction::RetryLater);
        assert_eq!(response.retry_after_seconds, Some(30));
        assert!(!response.suggestions.is_empty());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"], "TIMEOUT");
        assert_eq!(json["category"], "retry_later");

        let invalid = ErrorResponse::from(&ClassifiedError::invalid_input("empty"));
        assert!(invalid.retry_after_seconds.is_none());
    }
}
