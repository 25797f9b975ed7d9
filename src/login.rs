//! Browser-driven portal login.
//!
//! The portal sits behind Cloudflare-style anti-bot defenses, so login runs
//! through a real Chrome instance: navigate, wait for the page to settle,
//! find the credential fields (falling back to embedded frames), type like a
//! human, submit, and capture the resulting cookies. Each attempt launches a
//! fresh browser and closes it before returning, success or not.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::session::{LoginError, SessionAcquirer, SessionData};

/// Prioritized selectors for the email field; the portal has served all of
/// these at one time or another.
const EMAIL_SELECTORS: &[&str] = &[
    r#"input[type="email"]"#,
    r#"input[type="text"]"#,
    r#"input[placeholder*="Email"]"#,
];

const PASSWORD_SELECTORS: &[&str] = &[r#"input[type="password"]"#];

const FIELD_WAIT: Duration = Duration::from_secs(10);
const FIELD_POLL: Duration = Duration::from_millis(500);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(120);
const IDLE_WAIT: Duration = Duration::from_secs(10);

/// Settings for the browser login flow.
#[derive(Debug, Clone)]
pub struct BrowserLoginConfig {
    pub login_url: String,
    pub email: String,
    pub password: String,
    /// Fixed delay after navigation before looking for the form.
    pub settle_delay: Duration,
    /// Per-keystroke delay while typing credentials.
    pub keystroke_delay: Duration,
    pub headless: bool,
    /// Explicit Chrome binary; auto-detected when unset.
    pub chrome_path: Option<String>,
    /// Where diagnostic screenshots land on failed attempts.
    pub screenshot_dir: PathBuf,
}

/// [`SessionAcquirer`] backed by a headless Chrome instance.
pub struct BrowserLogin {
    config: BrowserLoginConfig,
}

impl BrowserLogin {
    pub fn new(config: BrowserLoginConfig) -> Self {
        Self { config }
    }

    async fn launch(&self) -> Result<(Browser, tokio::task::JoinHandle<()>)> {
        let chrome_path = match &self.config.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome().context(
                "Chrome/Chromium not found. Please install Chrome or Chromium to use otp-relay.",
            )?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            // Required on restricted/containerized hosts.
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if !self.config.headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("Failed to configure browser: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        Ok((browser, handler_task))
    }

    async fn run_attempt(&self, page: &Page, attempt: u32) -> Result<SessionData, LoginError> {
        tokio::time::timeout(NAVIGATION_TIMEOUT, page.goto(self.config.login_url.clone()))
            .await
            .map_err(|_| LoginError::Navigation("login page navigation timed out".to_string()))?
            .map_err(|e| LoginError::Navigation(e.to_string()))?;

        // Heuristic settling: a fixed delay plus a network-idle check. The
        // challenge screen and the real form are indistinguishable until the
        // page stops loading.
        tokio::time::sleep(self.config.settle_delay).await;
        wait_for_network_idle(page, IDLE_WAIT).await;

        let email_found = wait_and_focus(page, EMAIL_SELECTORS, FIELD_WAIT).await?;
        if !email_found {
            self.capture_screenshot(page, attempt).await;
            return Err(LoginError::FormNotFound);
        }
        type_text(page, &self.config.email, self.config.keystroke_delay).await?;

        let password_found = wait_and_focus(page, PASSWORD_SELECTORS, FIELD_WAIT).await?;
        if !password_found {
            self.capture_screenshot(page, attempt).await;
            return Err(LoginError::FormNotFound);
        }
        type_text(page, &self.config.password, self.config.keystroke_delay).await?;

        submit_form(page).await?;

        tokio::time::sleep(self.config.settle_delay).await;
        wait_for_network_idle(page, IDLE_WAIT).await;

        let cookies = page
            .get_cookies()
            .await
            .context("Failed to read cookies from browser")?;

        let mut session = SessionData::new();
        session.captured_at = Some(Utc::now().timestamp());
        for cookie in cookies {
            session = session.with_cookie(cookie.name, cookie.value, cookie.domain);
        }

        if session.cookies.is_empty() {
            return Err(LoginError::Browser(anyhow!(
                "login produced no cookies; session not established"
            )));
        }

        Ok(session)
    }

    async fn capture_screenshot(&self, page: &Page, attempt: u32) {
        let path = self
            .config
            .screenshot_dir
            .join(format!("login_failure_attempt_{attempt}.png"));

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        match page.save_screenshot(params, &path).await {
            Ok(_) => info!(path = %path.display(), "saved diagnostic screenshot"),
            Err(err) => warn!(error = %err, "failed to capture diagnostic screenshot"),
        }
    }
}

#[async_trait::async_trait]
impl SessionAcquirer for BrowserLogin {
    async fn acquire(&self, attempt: u32) -> Result<SessionData, LoginError> {
        let (mut browser, handler_task) = self.launch().await?;

        let result = async {
            let page = browser
                .new_page("about:blank")
                .await
                .context("Failed to open page")?;
            self.run_attempt(&page, attempt).await
        }
        .await;

        // The browser never survives an attempt, even a successful one.
        if let Err(err) = browser.close().await {
            debug!(error = %err, "browser close reported an error");
        }
        handler_task.abort();

        result
    }
}

/// Poll for any of `selectors` in the main document, then in every
/// same-origin iframe, focusing the first match. Returns false on timeout.
async fn wait_and_focus(page: &Page, selectors: &[&str], timeout: Duration) -> Result<bool> {
    let selector_list = serde_json::to_string(selectors).context("selector list is valid JSON")?;
    let js = format!(
        r#"(() => {{
            const selectors = {selector_list};
            const docs = [document];
            for (const frame of Array.from(document.querySelectorAll('iframe'))) {{
                try {{
                    if (frame.contentDocument) docs.push(frame.contentDocument);
                }} catch (_) {{ /* cross-origin */ }}
            }}
            for (const doc of docs) {{
                for (const sel of selectors) {{
                    const el = doc.querySelector(sel);
                    if (el) {{
                        el.focus();
                        return sel;
                    }}
                }}
            }}
            return null;
        }})()"#
    );

    let start = std::time::Instant::now();
    loop {
        let matched: Option<String> = page
            .evaluate(js.clone())
            .await
            .context("field scan failed")?
            .into_value()
            .unwrap_or(None);

        if let Some(sel) = matched {
            debug!(selector = %sel, "focused credential field");
            return Ok(true);
        }

        if start.elapsed() >= timeout {
            return Ok(false);
        }
        tokio::time::sleep(FIELD_POLL).await;
    }
}

/// Type into the focused element one character at a time, mimicking human
/// input; some portals ignore values set faster than a person could type.
async fn type_text(page: &Page, text: &str, delay: Duration) -> Result<()> {
    for c in text.chars() {
        let params = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text(c.to_string())
            .build()
            .map_err(|e| anyhow!("Failed to build key event: {e}"))?;
        page.execute(params).await.context("keystroke failed")?;
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

/// Click a submit-typed button if one exists, otherwise press Enter.
async fn submit_form(page: &Page) -> Result<()> {
    let clicked: bool = page
        .evaluate(
            r#"(() => {
                const docs = [document];
                for (const frame of Array.from(document.querySelectorAll('iframe'))) {
                    try {
                        if (frame.contentDocument) docs.push(frame.contentDocument);
                    } catch (_) {}
                }
                for (const doc of docs) {
                    const button = doc.querySelector('button[type="submit"]');
                    if (button) {
                        button.click();
                        return true;
                    }
                }
                return false;
            })()"#,
        )
        .await
        .context("submit button scan failed")?
        .into_value()
        .unwrap_or(false);

    if clicked {
        return Ok(());
    }

    let down = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyDown)
        .key("Enter")
        .text("\r")
        .build()
        .map_err(|e| anyhow!("Failed to build key event: {e}"))?;
    page.execute(down).await.context("Enter keydown failed")?;

    let up = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyUp)
        .key("Enter")
        .build()
        .map_err(|e| anyhow!("Failed to build key event: {e}"))?;
    page.execute(up).await.context("Enter keyup failed")?;

    Ok(())
}

/// Wait until the page's resource count stops changing, or the timeout
/// passes. Best effort; a failed evaluation just means we proceed.
async fn wait_for_network_idle(page: &Page, timeout: Duration) {
    let timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
    let js = format!(
        r#"(async () => {{
            const timeoutMs = {timeout_ms};
            const idleMs = 1000;
            const interval = 250;

            const start = Date.now();
            let lastCount = 0;
            let stableMs = 0;

            try {{ lastCount = performance.getEntriesByType('resource').length; }} catch (_) {{}}

            while (Date.now() - start < timeoutMs) {{
                await new Promise(r => setTimeout(r, interval));
                let curCount = lastCount;
                try {{ curCount = performance.getEntriesByType('resource').length; }} catch (_) {{}}

                if (document.readyState === 'complete' && curCount === lastCount) {{
                    stableMs += interval;
                    if (stableMs >= idleMs) return true;
                }} else {{
                    stableMs = 0;
                }}
                lastCount = curCount;
            }}
            return false;
        }})()"#
    );

    match page.evaluate(js).await {
        Ok(val) => {
            let idle: bool = val.into_value().unwrap_or(false);
            if !idle {
                debug!("network-idle heuristic timed out; continuing anyway");
            }
        }
        Err(err) => debug!(error = %err, "network-idle heuristic failed"),
    }
}

/// Find a Chrome/Chromium executable.
fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "chromium"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/app/.chrome-for-testing/chrome-linux64/chrome",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}
