//! Error Handling and Retry Logic
//!
//! Provides the error taxonomy for the sync protocol plus retry helpers
//! for the collaborators that own reconnect/rediscovery policy.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Connections and the codec never retry on their own; this helper is for
/// the owning side (CLI discovery loops, subscriber reconnects).
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    return Err(anyhow::anyhow!(
                        "Operation failed after {} attempts: {}",
                        attempts,
                        e
                    ));
                }

                eprintln!(
                    "⚠️  Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempts, policy.max_attempts, e, delay
                );

                sleep(delay).await;

                // Exponential backoff
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect/accept/read/write failure on a connection (fatal to that
    /// connection only)
    Transport,

    /// Malformed frame or payload (fatal to that connection only)
    Protocol,

    /// Advertise/browse/resolve failure (never affects open connections)
    Discovery,

    /// Message referencing a name that is not currently shared (silent
    /// no-op by design)
    UnknownTarget,

    /// Unknown errors
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind closes the connection it occurred on
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Protocol)
    }

    /// Check if this error kind is retryable by the owning collaborator
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Discovery)
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("frame")
        || error_str.contains("decode")
        || error_str.contains("malformed")
        || error_str.contains("payload")
    {
        ErrorKind::Protocol
    } else if error_str.contains("beacon")
        || error_str.contains("discovery")
        || error_str.contains("browse")
        || error_str.contains("advertise")
    {
        ErrorKind::Discovery
    } else if error_str.contains("not shared") || error_str.contains("unknown name") {
        ErrorKind::UnknownTarget
    } else if error_str.contains("connect")
        || error_str.contains("accept")
        || error_str.contains("read")
        || error_str.contains("write")
        || error_str.contains("socket")
        || error_str.contains("broken pipe")
        || error_str.contains("reset")
    {
        ErrorKind::Transport
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let transport = anyhow::anyhow!("Connection reset by peer");
        assert_eq!(categorize_error(&transport), ErrorKind::Transport);

        let protocol = anyhow::anyhow!("failed to decode frame payload: eof");
        assert_eq!(categorize_error(&protocol), ErrorKind::Protocol);

        let discovery = anyhow::anyhow!("advertise failed: network unreachable");
        assert_eq!(categorize_error(&discovery), ErrorKind::Discovery);

        let unknown_target = anyhow::anyhow!("set for name that is not shared");
        assert_eq!(categorize_error(&unknown_target), ErrorKind::UnknownTarget);
    }

    #[test]
    fn test_fatality() {
        assert!(ErrorKind::Transport.is_fatal_to_connection());
        assert!(ErrorKind::Protocol.is_fatal_to_connection());
        assert!(!ErrorKind::Discovery.is_fatal_to_connection());
        assert!(!ErrorKind::UnknownTarget.is_fatal_to_connection());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);

        let no_retry = RetryPolicy::no_retry();
        assert_eq!(no_retry.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let mut failures = 2u32;
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result = with_retry(&policy, || {
            let attempt_fails = failures > 0;
            if attempt_fails {
                failures -= 1;
            }
            async move {
                if attempt_fails {
                    Err("transient")
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
    }
}
