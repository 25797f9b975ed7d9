use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::duration::deserialize_duration;

fn default_base_url() -> String {
    "https://www.ivasms.com".to_string()
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_sms_path() -> String {
    "/portal/sms/received/getsms".to_string()
}

/// Portal endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Portal account email. Required; may also come from `PORTAL_EMAIL`.
    pub email: String,

    /// Portal account password. Required; may also come from `PORTAL_PASSWORD`.
    pub password: String,

    /// Portal origin, scheme included, no trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the login page relative to `base_url`.
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Path of the received-SMS listing endpoint relative to `base_url`.
    #[serde(default = "default_sms_path")]
    pub sms_path: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            base_url: default_base_url(),
            login_path: default_login_path(),
            sms_path: default_sms_path(),
        }
    }
}

impl PortalConfig {
    /// Full login page URL.
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_path)
    }
}

/// Telegram delivery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot API token. Required; may also come from `TELEGRAM_BOT_TOKEN`.
    pub bot_token: String,

    /// Destination chat ids. Required, at least one; may also come from
    /// `TELEGRAM_CHAT_IDS` as a JSON array.
    pub chat_ids: Vec<i64>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_missing_token_relogin_after() -> u32 {
    3
}

/// Poll loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Base delay between poll cycles.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,

    /// Random jitter added to each delay. Zero disables jitter.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub jitter: Duration,

    /// Consecutive missing-token fetches before re-authenticating.
    /// Zero disables session-expiry detection.
    #[serde(default = "default_missing_token_relogin_after")]
    pub missing_token_relogin_after: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            jitter: Duration::ZERO,
            missing_token_relogin_after: default_missing_token_relogin_after(),
        }
    }
}

fn default_login_max_attempts() -> u32 {
    3
}

fn default_login_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_keystroke_delay_ms() -> u64 {
    60
}

fn default_headless() -> bool {
    true
}

fn default_screenshot_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Browser login settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Attempts per login round before giving up.
    #[serde(default = "default_login_max_attempts")]
    pub max_attempts: u32,

    /// Delay between failed attempts.
    #[serde(
        default = "default_login_retry_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_delay: Duration,

    /// Fixed delay after navigation before looking for the login form.
    #[serde(
        default = "default_settle_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub settle_delay: Duration,

    /// Per-keystroke delay while typing credentials, in milliseconds.
    #[serde(default = "default_keystroke_delay_ms")]
    pub keystroke_delay_ms: u64,

    /// Run the browser headless. Turn off to watch a login attempt.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Explicit Chrome binary path; auto-detected when unset.
    pub chrome_path: Option<String>,

    /// Where diagnostic screenshots land on failed attempts.
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_login_max_attempts(),
            retry_delay: default_login_retry_delay(),
            settle_delay: default_settle_delay(),
            keystroke_delay_ms: default_keystroke_delay_ms(),
            headless: default_headless(),
            chrome_path: None,
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("sent_cache.json")
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the sent-message cache is persisted.
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,

    /// Portal endpoints and credentials.
    #[serde(default)]
    pub portal: PortalConfig,

    /// Telegram delivery settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Poll loop settings.
    #[serde(default)]
    pub poll: PollConfig,

    /// Browser login settings.
    #[serde(default)]
    pub login: LoginConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
            portal: PortalConfig::default(),
            telegram: TelegramConfig::default(),
            poll: PollConfig::default(),
            login: LoginConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill secrets from the environment. Environment values win over the
    /// file so deployments never need credentials on disk.
    ///
    /// Takes the lookup as a closure so tests don't touch the process
    /// environment.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(email) = lookup("PORTAL_EMAIL") {
            self.portal.email = email;
        }
        if let Some(password) = lookup("PORTAL_PASSWORD") {
            self.portal.password = password;
        }
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(ids) = lookup("TELEGRAM_CHAT_IDS") {
            self.telegram.chat_ids = serde_json::from_str(&ids)
                .context("TELEGRAM_CHAT_IDS must be a JSON array of chat ids, e.g. [123, -456]")?;
        }
        Ok(())
    }

    /// Reject configurations that cannot possibly work.
    pub fn validate(&self) -> Result<()> {
        if self.portal.email.is_empty() {
            anyhow::bail!("portal email is not set (config [portal].email or PORTAL_EMAIL)");
        }
        if self.portal.password.is_empty() {
            anyhow::bail!("portal password is not set (config [portal].password or PORTAL_PASSWORD)");
        }
        if self.telegram.bot_token.is_empty() {
            anyhow::bail!(
                "Telegram bot token is not set (config [telegram].bot_token or TELEGRAM_BOT_TOKEN)"
            );
        }
        if self.telegram.chat_ids.is_empty() {
            anyhow::bail!(
                "no Telegram chat ids configured (config [telegram].chat_ids or TELEGRAM_CHAT_IDS)"
            );
        }
        Ok(())
    }
}
