use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use otp_relay::cache::SentCache;
use otp_relay::notify::Notify;
use otp_relay::portal::{FetchOutcome, MessageSource};
use otp_relay::relay::{Relay, RelayConfig, Step};
use otp_relay::session::{LoginError, RetryPolicy, SessionAcquirer, SessionData};

/// Replays a fixed sequence of fetch results, then empty listings.
struct ScriptedSource {
    script: Mutex<VecDeque<Result<FetchOutcome>>>,
    sessions_set: Arc<AtomicU32>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<FetchOutcome>>, sessions_set: Arc<AtomicU32>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sessions_set,
        }
    }
}

#[async_trait::async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch(&self) -> Result<FetchOutcome> {
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(FetchOutcome::Messages(vec![])))
    }

    fn set_session(&mut self, _session: SessionData) {
        self.sessions_set.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every delivered message.
struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Notify for RecordingNotifier {
    async fn notify(&self, raw_sms: &str) -> Result<()> {
        self.delivered.lock().unwrap().push(raw_sms.to_string());
        Ok(())
    }
}

struct CountingAcquirer {
    attempts: Arc<AtomicU32>,
    succeed: bool,
}

#[async_trait::async_trait]
impl SessionAcquirer for CountingAcquirer {
    async fn acquire(&self, _attempt: u32) -> Result<SessionData, LoginError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(SessionData::new().with_cookie("laravel_session", "abc", ".portal.test"))
        } else {
            Err(LoginError::FormNotFound)
        }
    }
}

struct Harness {
    relay: Relay,
    delivered: Arc<Mutex<Vec<String>>>,
    login_attempts: Arc<AtomicU32>,
    sessions_set: Arc<AtomicU32>,
    cache_path: std::path::PathBuf,
    _dir: TempDir,
}

fn harness(
    script: Vec<Result<FetchOutcome>>,
    login_succeeds: bool,
    relogin_after: u32,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("sent_cache.json");

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let login_attempts = Arc::new(AtomicU32::new(0));
    let sessions_set = Arc::new(AtomicU32::new(0));

    let relay = Relay::new(
        Box::new(ScriptedSource::new(script, sessions_set.clone())),
        Box::new(RecordingNotifier {
            delivered: delivered.clone(),
        }),
        Box::new(CountingAcquirer {
            attempts: login_attempts.clone(),
            succeed: login_succeeds,
        }),
        SentCache::load(&cache_path),
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        },
        RelayConfig {
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
            missing_token_relogin_after: relogin_after,
        },
    );

    Harness {
        relay,
        delivered,
        login_attempts,
        sessions_set,
        cache_path,
        _dir: dir,
    }
}

fn messages(texts: &[&str]) -> Result<FetchOutcome> {
    Ok(FetchOutcome::Messages(
        texts.iter().map(|t| t.to_string()).collect(),
    ))
}

#[tokio::test]
async fn duplicate_messages_are_forwarded_once() {
    let mut h = harness(
        vec![
            messages(&["Your code is 48213", "Use 7781 to sign in"]),
            messages(&["Your code is 48213", "New code 9012"]),
        ],
        true,
        3,
    );

    assert_eq!(h.relay.step().await, Step::Continue);
    assert_eq!(h.relay.step().await, Step::Continue);

    let delivered = h.delivered.lock().unwrap().clone();
    assert_eq!(
        delivered,
        vec![
            "Your code is 48213".to_string(),
            "Use 7781 to sign in".to_string(),
            "New code 9012".to_string(),
        ]
    );

    // Dedup state survives a restart.
    let reloaded = SentCache::load(&h.cache_path);
    assert_eq!(reloaded.len(), 3);
    assert!(reloaded.contains("Your code is 48213"));
}

#[tokio::test]
async fn missing_token_streak_triggers_relogin() {
    let mut h = harness(
        vec![
            Ok(FetchOutcome::MissingToken),
            Ok(FetchOutcome::MissingToken),
            Ok(FetchOutcome::MissingToken),
        ],
        true,
        2,
    );

    assert_eq!(h.relay.step().await, Step::Continue);
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 0);

    // Second consecutive miss crosses the threshold.
    assert_eq!(h.relay.step().await, Step::Continue);
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions_set.load(Ordering::SeqCst), 1);

    // Streak was reset, so the next miss does not re-login again.
    assert_eq!(h.relay.step().await, Step::Continue);
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_threshold_disables_expiry_detection() {
    let mut h = harness(
        vec![
            Ok(FetchOutcome::MissingToken),
            Ok(FetchOutcome::MissingToken),
            Ok(FetchOutcome::MissingToken),
        ],
        true,
        0,
    );

    for _ in 0..3 {
        assert_eq!(h.relay.step().await, Step::Continue);
    }
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn startup_login_exhaustion_degrades() {
    let mut h = harness(vec![], false, 3);

    assert_eq!(h.relay.start().await, Step::Degraded);
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.sessions_set.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn startup_login_success_installs_session() {
    let mut h = harness(vec![], true, 3);

    assert_eq!(h.relay.start().await, Step::Continue);
    assert_eq!(h.login_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions_set.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_error_is_swallowed_and_polling_continues() {
    let mut h = harness(
        vec![
            Err(anyhow!("connection reset")),
            messages(&["Your code is 48213"]),
        ],
        true,
        3,
    );

    assert_eq!(h.relay.step().await, Step::Continue);
    assert!(h.delivered.lock().unwrap().is_empty());

    assert_eq!(h.relay.step().await, Step::Continue);
    assert_eq!(
        h.delivered.lock().unwrap().clone(),
        vec!["Your code is 48213".to_string()]
    );
}
