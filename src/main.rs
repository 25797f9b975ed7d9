use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use otp_relay::cache::SentCache;
use otp_relay::config::Config;
use otp_relay::login::{BrowserLogin, BrowserLoginConfig};
use otp_relay::notify::TelegramNotifier;
use otp_relay::portal::PortalClient;
use otp_relay::relay::{Relay, RelayConfig};
use otp_relay::session::{RetryPolicy, SessionData};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    otp_relay::duration::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "otp-relay")]
#[command(about = "Relays OTP messages from an SMS portal to Telegram")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "otp-relay.toml")]
    config: PathBuf,

    /// Override the poll interval (e.g. "5s", "1m").
    #[arg(long, value_parser = parse_duration_arg)]
    interval: Option<Duration>,

    /// Override the sent-message cache path.
    #[arg(long)]
    cache_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off",
            )
        }))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;

    if let Some(interval) = cli.interval {
        config.poll.interval = interval;
    }
    if let Some(cache_file) = cli.cache_file {
        config.cache_file = cache_file;
    }

    config.validate()?;

    let cache = SentCache::load(&config.cache_file);
    info!(
        path = %config.cache_file.display(),
        entries = cache.len(),
        "loaded sent-message cache"
    );

    let acquirer = BrowserLogin::new(BrowserLoginConfig {
        login_url: config.portal.login_url(),
        email: config.portal.email.clone(),
        password: config.portal.password.clone(),
        settle_delay: config.login.settle_delay,
        keystroke_delay: Duration::from_millis(config.login.keystroke_delay_ms),
        headless: config.login.headless,
        chrome_path: config.login.chrome_path.clone(),
        screenshot_dir: config.login.screenshot_dir.clone(),
    });

    // Starts with an empty session; the relay logs in before the first fetch.
    let source = PortalClient::new(SessionData::new())?
        .with_base_url(config.portal.base_url.clone())
        .with_sms_path(config.portal.sms_path.clone());

    let notifier = TelegramNotifier::new(
        Bot::new(&config.telegram.bot_token),
        config.telegram.chat_ids.clone(),
    );

    let retry = RetryPolicy {
        max_attempts: config.login.max_attempts,
        delay: config.login.retry_delay,
    };

    let relay_config = RelayConfig {
        interval: config.poll.interval,
        jitter: config.poll.jitter,
        missing_token_relogin_after: config.poll.missing_token_relogin_after,
    };

    let mut relay = Relay::new(
        Box::new(source),
        Box::new(notifier),
        Box::new(acquirer),
        cache,
        retry,
        relay_config,
    );

    relay.run().await
}
