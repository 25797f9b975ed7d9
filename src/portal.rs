//! Authenticated portal client for the received-SMS listing.
//!
//! Uses session cookies captured by the browser login to make plain HTTP
//! requests against the portal, the same way a logged-in browser tab would.

use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::otp::extract_otp;
use crate::session::SessionData;

/// Fetch seam for the relay loop; implemented by [`PortalClient`] and by
/// scripted fakes in tests.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(&self) -> Result<FetchOutcome>;

    /// Swap in fresh credentials after a re-login.
    fn set_session(&mut self, session: SessionData);
}

const DEFAULT_BASE_URL: &str = "https://www.ivasms.com";
const SMS_PATH: &str = "/portal/sms/received/getsms";

/// Portal date format for the lookback window.
const DATE_FORMAT: &str = "%m/%d/%Y";

/// Outcome of one fetch cycle.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Message texts containing an OTP-like token, in document order.
    Messages(Vec<String>),
    /// The landing page had no CSRF token. Soft failure; usually means the
    /// session has expired and the portal served the login page instead.
    MissingToken,
}

/// Cookie-authenticated client for the SMS portal.
pub struct PortalClient {
    client: Client,
    base_url: String,
    sms_path: String,
    session: SessionData,
    clock: Box<dyn Clock>,
}

impl PortalClient {
    /// Create a client for the given session.
    pub fn new(session: SessionData) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36")
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            sms_path: SMS_PATH.to_string(),
            session,
            clock: Box::new(SystemClock),
        })
    }

    /// Override the portal base URL (useful for tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the SMS listing endpoint path.
    pub fn with_sms_path(mut self, path: impl Into<String>) -> Self {
        self.sms_path = path.into();
        self
    }

    /// Override the clock that drives the lookback window (useful for tests).
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fetch qualifying messages for the lookback window (yesterday through
    /// today). No deduplication happens here.
    async fn fetch_inner(&self) -> Result<FetchOutcome> {
        let landing = self
            .client
            .get(&self.base_url)
            .header("cookie", self.session.cookie_header())
            .send()
            .await
            .context("Portal landing page request failed")?
            .error_for_status()
            .context("Portal landing page returned an error status")?
            .text()
            .await
            .context("Failed to read portal landing page")?;

        let Some(csrf) = extract_csrf_token(&landing) else {
            let age = self.session.age_secs(self.clock.now().timestamp());
            warn!(session_age_secs = age, "CSRF token not found on landing page");
            return Ok(FetchOutcome::MissingToken);
        };

        let from = self.clock.yesterday().format(DATE_FORMAT).to_string();
        let to = self.clock.today().format(DATE_FORMAT).to_string();

        let body = self
            .client
            .post(format!("{}{}", self.base_url, self.sms_path))
            .header("cookie", self.session.cookie_header())
            .header("X-CSRF-TOKEN", &csrf)
            .form(&[
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("_token", csrf.as_str()),
            ])
            .send()
            .await
            .context("SMS listing request failed")?
            .error_for_status()
            .context("SMS listing returned an error status")?
            .text()
            .await
            .context("Failed to read SMS listing response")?;

        Ok(FetchOutcome::Messages(extract_messages(&body)))
    }
}

#[async_trait::async_trait]
impl MessageSource for PortalClient {
    async fn fetch(&self) -> Result<FetchOutcome> {
        self.fetch_inner().await
    }

    fn set_session(&mut self, session: SessionData) {
        self.session = session;
    }
}

/// Pull the CSRF token out of the landing page's `<meta>` tags.
fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"meta[name="csrf-token"]"#).expect("selector is valid");

    document
        .select(&selector)
        .next()
        .and_then(|meta| meta.value().attr("content"))
        .map(str::to_string)
}

/// Extract the visible text of each message card, keeping only texts that
/// contain an OTP-like token.
fn extract_messages(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("div.card-body").expect("selector is valid");

    document
        .select(&selector)
        .map(|card| normalize_text(card.text()))
        .filter(|text| extract_otp(text).is_some())
        .collect()
}

/// Join text nodes with single spaces, collapsing surrounding whitespace.
fn normalize_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
