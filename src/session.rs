//! Portal session state and the login retry driver.
//!
//! Login is abstracted behind [`SessionAcquirer`] so the relay loop and its
//! tests never need a real browser. The concrete browser-driving
//! implementation lives in [`crate::login`].

use std::time::Duration;

use tracing::{info, warn};

/// One cookie captured from the browser after login.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Credentials for authenticated portal requests.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    /// Cookies captured from the browser context.
    pub cookies: Vec<SessionCookie>,

    /// When the session was captured (Unix timestamp).
    pub captured_at: Option<i64>,
}

impl SessionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookie(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        self.cookies.push(SessionCookie {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        });
        self
    }

    /// Format cookies as a Cookie header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Seconds since the session was captured, relative to `now`.
    pub fn age_secs(&self, now: i64) -> Option<i64> {
        self.captured_at.map(|captured| now - captured)
    }
}

/// Why a single login attempt failed. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// Neither credential field was found; usually the anti-bot challenge
    /// screen was served instead of the real form.
    #[error("login form not found (challenge screen?)")]
    FormNotFound,

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser error: {0}")]
    Browser(#[from] anyhow::Error),
}

/// Retry policy for session acquisition.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before giving up. Zero is treated as one.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Result of driving an acquirer through its retry budget.
#[derive(Debug)]
pub enum SessionOutcome {
    Acquired(SessionData),
    /// All attempts failed. Definitive: the caller must degrade, not crash;
    /// anti-bot defenses are adversarial and not always passable.
    Exhausted,
}

/// The abstracted login capability.
///
/// One call is one full attempt: the implementation owns any resources it
/// needs (browser instance, pages) and releases them before returning, even
/// on the failure path.
#[async_trait::async_trait]
pub trait SessionAcquirer: Send + Sync {
    async fn acquire(&self, attempt: u32) -> Result<SessionData, LoginError>;
}

/// Run `acquirer` under `policy`, sleeping between failed attempts.
pub async fn acquire_session(
    acquirer: &dyn SessionAcquirer,
    policy: &RetryPolicy,
) -> SessionOutcome {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        info!(attempt, max_attempts, "attempting portal login");

        match acquirer.acquire(attempt).await {
            Ok(session) => {
                info!(cookies = session.cookies.len(), "portal login succeeded");
                return SessionOutcome::Acquired(session);
            }
            Err(err) => {
                warn!(attempt, error = %err, "portal login attempt failed");
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    warn!(max_attempts, "portal login attempts exhausted; no session");
    SessionOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingAcquirer {
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl SessionAcquirer for FailingAcquirer {
        async fn acquire(&self, _attempt: u32) -> Result<SessionData, LoginError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LoginError::FormNotFound)
        }
    }

    struct FlakyAcquirer {
        attempts: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait::async_trait]
    impl SessionAcquirer for FlakyAcquirer {
        async fn acquire(&self, _attempt: u32) -> Result<SessionData, LoginError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(SessionData::new().with_cookie("laravel_session", "abc", ".portal.test"))
            } else {
                Err(LoginError::Navigation("timeout".to_string()))
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn exhaustion_after_exactly_max_attempts() {
        let acquirer = FailingAcquirer {
            attempts: AtomicU32::new(0),
        };

        let outcome = acquire_session(&acquirer, &fast_policy(3)).await;

        assert!(matches!(outcome, SessionOutcome::Exhausted));
        assert_eq!(acquirer.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_on_a_later_attempt() {
        let acquirer = FlakyAcquirer {
            attempts: AtomicU32::new(0),
            succeed_on: 2,
        };

        let outcome = acquire_session(&acquirer, &fast_policy(3)).await;

        match outcome {
            SessionOutcome::Acquired(session) => {
                assert_eq!(session.cookies.len(), 1);
            }
            SessionOutcome::Exhausted => panic!("expected a session"),
        }
        assert_eq!(acquirer.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let acquirer = FailingAcquirer {
            attempts: AtomicU32::new(0),
        };

        let outcome = acquire_session(&acquirer, &fast_policy(0)).await;

        assert!(matches!(outcome, SessionOutcome::Exhausted));
        assert_eq!(acquirer.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let session = SessionData::new()
            .with_cookie("a", "1", ".portal.test")
            .with_cookie("b", "2", ".portal.test");
        assert_eq!(session.cookie_header(), "a=1; b=2");
    }

    #[test]
    fn age_is_measured_from_capture_time() {
        let mut session = SessionData::new();
        assert_eq!(session.age_secs(1_000), None);

        session.captured_at = Some(400);
        assert_eq!(session.age_secs(1_000), Some(600));
    }
}
