//! OTP extraction from free-form message text.

use std::sync::LazyLock;

use regex::Regex;

/// First run of 4-8 decimal digits bounded by word boundaries.
static OTP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4,8})\b").expect("OTP regex is valid"));

/// Extract the first OTP-looking token from `text`.
///
/// Returns the first maximal run of 4 to 8 decimal digits, scanning left to
/// right, or `None` if no such run exists. Longer digit runs (phone numbers,
/// order ids) never match because their interior positions are not word
/// boundaries.
pub fn extract_otp(text: &str) -> Option<&str> {
    OTP_RE.captures(text).map(|c| {
        c.get(1)
            .expect("OTP regex has one capture group")
            .as_str()
    })
}
