use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

const NOT_FOUND_PREFIX: &str = "session not found: ";
const NOT_LIVE_PREFIX: &str = "session not live: ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionControlError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session not live: {0}")]
    NotLive(String),
    #[error("{0}")]
    Other(String),
}

impl SessionControlError {
    /// Recovers the variant from a `command.failed` error string produced by
    /// this error's `Display`.
    pub fn from_failure(message: &str) -> Self {
        if let Some(session_id) = message.strip_prefix(NOT_FOUND_PREFIX) {
            return SessionControlError::NotFound(session_id.to_string());
        }
        if let Some(session_id) = message.strip_prefix(NOT_LIVE_PREFIX) {
            return SessionControlError::NotLive(session_id.to_string());
        }
        SessionControlError::Other(message.to_string())
    }

    /// The session is already gone, so "not subscribed" already holds.
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            SessionControlError::NotFound(_) | SessionControlError::NotLive(_)
        )
    }
}

/// Per-session event streams exposed by the session process manager.
#[async_trait]
pub trait SessionStreams: Send + Sync {
    async fn subscribe_session(&self, session_id: &str) -> Result<(), SessionControlError>;
    async fn unsubscribe_session(&self, session_id: &str) -> Result<(), SessionControlError>;
}

/// Process-wide observed task/repository event stream.
#[async_trait]
pub trait ObservedEventSource: Send + Sync {
    type Error: Send;

    async fn subscribe_observed(&self, after_cursor: Option<u64>) -> Result<String, Self::Error>;
    async fn unsubscribe_observed(&self, subscription_id: &str) -> Result<(), Self::Error>;
}

pub async fn subscribe_session_events<S>(
    streams: &S,
    session_id: &str,
) -> Result<(), SessionControlError>
where
    S: SessionStreams + ?Sized,
{
    tolerate_gone_session(streams.subscribe_session(session_id).await, "subscribe")
}

pub async fn unsubscribe_session_events<S>(
    streams: &S,
    session_id: &str,
) -> Result<(), SessionControlError>
where
    S: SessionStreams + ?Sized,
{
    tolerate_gone_session(streams.unsubscribe_session(session_id).await, "unsubscribe")
}

fn tolerate_gone_session(
    result: Result<(), SessionControlError>,
    action: &'static str,
) -> Result<(), SessionControlError> {
    match result {
        Err(err) if err.is_session_gone() => {
            debug!(event = "session_subscription_skipped", action, reason = %err);
            Ok(())
        }
        other => other,
    }
}

/// Holds at most one observed-stream subscription id.
#[derive(Debug, Default)]
pub struct ObservedStreamSubscription {
    subscription_id: Option<String>,
}

impl ObservedStreamSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.subscription_id.is_some()
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub async fn subscribe<S>(&mut self, source: &S, after_cursor: Option<u64>) -> Result<(), S::Error>
    where
        S: ObservedEventSource + ?Sized,
    {
        if self.subscription_id.is_some() {
            return Ok(());
        }
        let subscription_id = source.subscribe_observed(after_cursor).await?;
        self.subscription_id = Some(subscription_id);
        Ok(())
    }

    pub async fn unsubscribe<S>(&mut self, source: &S) -> Result<(), S::Error>
    where
        S: ObservedEventSource + ?Sized,
    {
        let Some(subscription_id) = self.subscription_id.take() else {
            return Ok(());
        };
        source.unsubscribe_observed(&subscription_id).await
    }
}
