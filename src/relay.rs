//! The polling loop: login, fetch, dedup, notify, persist.
//!
//! Every collaborator sits behind a trait so the loop itself can run under
//! test with fakes and zero delays. Cycle errors are swallowed at this
//! boundary; nothing short of ctrl-c stops a running relay.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{error, info, warn};

use crate::cache::SentCache;
use crate::notify::Notify;
use crate::portal::{FetchOutcome, MessageSource};
use crate::session::{acquire_session, RetryPolicy, SessionAcquirer, SessionOutcome};

/// Loop timing and re-login behavior.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base delay between poll cycles.
    pub interval: Duration,
    /// Random jitter in the range [-jitter, +jitter] added to each delay.
    pub jitter: Duration,
    /// Consecutive missing-token fetches before attempting a re-login.
    /// Zero disables expiry detection.
    pub missing_token_relogin_after: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
            missing_token_relogin_after: 3,
        }
    }
}

/// What a single relay step decided.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Normal cycle; keep polling.
    Continue,
    /// Login attempts are exhausted. The relay must idle, not crash: the
    /// portal's anti-bot defenses are adversarial and not always passable.
    Degraded,
}

pub struct Relay {
    source: Box<dyn MessageSource>,
    notifier: Box<dyn Notify>,
    acquirer: Box<dyn SessionAcquirer>,
    cache: SentCache,
    retry: RetryPolicy,
    config: RelayConfig,
    missing_token_streak: u32,
}

impl Relay {
    pub fn new(
        source: Box<dyn MessageSource>,
        notifier: Box<dyn Notify>,
        acquirer: Box<dyn SessionAcquirer>,
        cache: SentCache,
        retry: RetryPolicy,
        config: RelayConfig,
    ) -> Self {
        Self {
            source,
            notifier,
            acquirer,
            cache,
            retry,
            config,
            missing_token_streak: 0,
        }
    }

    /// Perform the startup login.
    pub async fn start(&mut self) -> Step {
        match acquire_session(self.acquirer.as_ref(), &self.retry).await {
            SessionOutcome::Acquired(session) => {
                self.source.set_session(session);
                Step::Continue
            }
            SessionOutcome::Exhausted => Step::Degraded,
        }
    }

    /// One poll cycle: fetch, forward unseen messages, persist the cache,
    /// and react to session-expiry signals. Errors are logged, never
    /// propagated; the next cycle runs regardless.
    pub async fn step(&mut self) -> Step {
        match self.run_cycle().await {
            Ok(CycleOutcome::Forwarded(count)) => {
                self.missing_token_streak = 0;
                if count > 0 {
                    info!(forwarded = count, "relayed new OTP messages");
                }
                Step::Continue
            }
            Ok(CycleOutcome::MissingToken) => {
                self.missing_token_streak += 1;
                let threshold = self.config.missing_token_relogin_after;

                if threshold > 0 && self.missing_token_streak >= threshold {
                    warn!(
                        streak = self.missing_token_streak,
                        "repeated missing-token fetches; session looks expired, re-authenticating"
                    );
                    self.missing_token_streak = 0;
                    self.start().await
                } else {
                    Step::Continue
                }
            }
            Err(err) => {
                error!(error = %err, "poll cycle failed");
                Step::Continue
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let messages = match self.source.fetch().await? {
            FetchOutcome::MissingToken => return Ok(CycleOutcome::MissingToken),
            FetchOutcome::Messages(messages) => messages,
        };

        let mut forwarded = 0usize;
        for message in messages {
            if self.cache.contains(&message) {
                continue;
            }

            // Notify before persisting: a crash in between re-forwards the
            // message on restart, which beats silently dropping it.
            self.notifier.notify(&message).await?;
            self.cache.insert(message)?;
            forwarded += 1;
        }

        Ok(CycleOutcome::Forwarded(forwarded))
    }

    /// Run until ctrl-c.
    pub async fn run(&mut self) -> Result<()> {
        if self.start().await == Step::Degraded {
            return self.idle().await;
        }

        info!(
            interval = ?self.config.interval,
            cached = self.cache.len(),
            "relay running"
        );

        loop {
            if self.step().await == Step::Degraded {
                return self.idle().await;
            }

            let delay = next_delay(self.config.interval, self.config.jitter);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Degraded idle state: sleep forever instead of crashing, so an
    /// external supervisor doesn't hot-loop restarts against the anti-bot
    /// wall. Only ctrl-c gets us out.
    async fn idle(&self) -> Result<()> {
        error!("no portal session available; relay idling until restarted");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug)]
enum CycleOutcome {
    Forwarded(usize),
    MissingToken,
}

/// Base interval with optional random jitter, clamped to at least a second
/// so a large jitter can't produce a busy loop.
fn next_delay(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }

    let base_ms = interval.as_millis().min(u128::from(u64::MAX)) as i128;
    let jitter_ms = jitter.as_millis().min(u128::from(u64::MAX)) as i128;
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);

    let min_ms = 1_000_i128;
    let max_ms = i128::from(u64::MAX);
    let delay_ms = (base_ms + offset).clamp(min_ms, max_ms) as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_returns_interval() {
        let interval = Duration::from_secs(5);
        assert_eq!(next_delay(interval, Duration::ZERO), interval);
    }

    #[test]
    fn jitter_stays_in_range() {
        let interval = Duration::from_secs(10);
        let jitter = Duration::from_secs(2);

        for _ in 0..100 {
            let delay = next_delay(interval, jitter);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn jitter_never_drops_below_one_second() {
        let delay = next_delay(Duration::from_secs(2), Duration::from_secs(30));
        assert!(delay >= Duration::from_secs(1));
    }
}
