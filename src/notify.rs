//! Message formatting and Telegram delivery.

use anyhow::Result;
use teloxide::payloads::SendMessageSetters;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, ParseMode};
use teloxide::Bot;
use tracing::{error, info};

use crate::otp::extract_otp;

/// Build the relay message for a raw SMS text.
///
/// The raw text is embedded verbatim exactly once; the OTP line shows `N/A`
/// when no token could be extracted.
pub fn format_otp_message(raw_sms: &str) -> String {
    let otp = extract_otp(raw_sms).unwrap_or("N/A");
    format!(
        "🔐 *NEW OTP RECEIVED*\n\
         ━━━━━━━━━━━━━━━━━━\n\n\
         🔢 *OTP:* `{otp}`\n\n\
         📩 *FULL MESSAGE:*\n\
         ```{raw_sms}```\n\n\
         ⚠️ *Do not share this OTP with anyone*"
    )
}

/// Delivery seam for the relay loop; the real implementation talks to the
/// Telegram bot API, tests substitute a recorder.
#[async_trait::async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, raw_sms: &str) -> Result<()>;
}

/// Sends formatted OTP messages to a set of Telegram chats.
pub struct TelegramNotifier {
    bot: Bot,
    chat_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, chat_ids: Vec<i64>) -> Self {
        Self { bot, chat_ids }
    }
}

#[async_trait::async_trait]
impl Notify for TelegramNotifier {
    /// Deliver to every configured chat sequentially. Destinations are
    /// fault-isolated: a failed send is logged and the rest are still
    /// attempted.
    async fn notify(&self, raw_sms: &str) -> Result<()> {
        let message = format_otp_message(raw_sms);

        for &chat_id in &self.chat_ids {
            match self
                .bot
                .send_message(ChatId(chat_id), &message)
                .parse_mode(ParseMode::Markdown)
                .await
            {
                Ok(_) => info!(chat_id, "OTP message delivered"),
                Err(err) => error!(chat_id, error = %err, "failed to deliver OTP message"),
            }
        }

        Ok(())
    }
}
