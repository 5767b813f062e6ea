//! Bounce (Delivery Status Notification) generation per RFC 3464
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── Part 1: text/plain (human-readable explanation)
//! ├── Part 2: message/delivery-status (machine-readable status)
//! └── Part 3: text/rfc822-headers (original message headers)
//! ```
//!
//! The bounce is a fresh queued message from the null sender to the original
//! sender, so it goes through the normal delivery cycle.

use std::{fmt::Write as _, time::SystemTime};

use chrono::{DateTime, Utc};
use postern_common::is_null_sender;
use postern_store::{NewMessage, QueuedMessage};
use serde::{Deserialize, Serialize};

/// Null reverse-path used as the envelope sender of every bounce
pub const NULL_SENDER: &str = "<>";

const MAX_ORIGINAL_HEADERS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceConfig {
    /// When disabled, messages that would be bounced are removed silently
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// FQDN of this MTA, for the Reporting-MTA field
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,
    #[serde(default = "default_postmaster")]
    pub postmaster: String,
}

const fn default_enabled() -> bool {
    true
}

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

fn default_postmaster() -> String {
    "postmaster@localhost".to_string()
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            reporting_mta: default_reporting_mta(),
            postmaster: default_postmaster(),
        }
    }
}

/// Whether a bounce should be sent for `original`
///
/// Mail from the null sender is never bounced, which prevents bounce loops.
#[must_use]
pub fn should_bounce(original: &QueuedMessage, config: &BounceConfig) -> bool {
    config.enabled && !is_null_sender(&original.mail_from)
}

/// Build the bounce for `original`, or `None` when none should be sent
#[must_use]
pub fn generate_bounce(
    original: &QueuedMessage,
    config: &BounceConfig,
    now: SystemTime,
) -> Option<NewMessage> {
    if !should_bounce(original, config) {
        return None;
    }

    let boundary = format!("----=_Bounce_{}_{}", original.id, timestamp_micros(now));
    let reason = original
        .last_error
        .as_deref()
        .unwrap_or("Bounced by the mail administrator");

    let body = format!(
        "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
        MIME-Version: 1.0\r\n\
        Date: {date}\r\n\
        From: Mail Delivery System <{postmaster}>\r\n\
        To: {sender}\r\n\
        Subject: Delivery Status Notification (Failure)\r\n\
        Auto-Submitted: auto-replied\r\n\
        \r\n\
        This is a multi-part message in MIME format.\r\n\
        \r\n\
        --{boundary}\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {human_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: message/delivery-status\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {machine_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: text/rfc822-headers\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {original_headers}\r\n\
        --{boundary}--\r\n",
        date = rfc2822(now),
        postmaster = config.postmaster,
        sender = original.mail_from,
        human_readable = human_readable_part(original, config, reason),
        machine_readable = machine_readable_part(original, config, reason),
        original_headers = original_headers(&original.data),
    );

    Some(NewMessage::new(NULL_SENDER, original.mail_from.clone(), body.into_bytes()).added_at(now))
}

fn human_readable_part(original: &QueuedMessage, config: &BounceConfig, reason: &str) -> String {
    format!(
        "This is the mail system at host {mta}.\r\n\
        \r\n\
        I'm sorry to have to inform you that your message could not\r\n\
        be delivered to one or more recipients. Its headers are attached below.\r\n\
        \r\n\
        For further assistance, please contact <{postmaster}>.\r\n\
        \r\n\
        {recipient}: {reason}\r\n\
        \r\n\
        Delivery attempts: {attempts}\r\n",
        mta = config.reporting_mta,
        postmaster = config.postmaster,
        recipient = original.rcpt_to,
        attempts = original.attempts,
    )
}

/// Temporary failures that ran out of retries report a 4.x.x status
fn status_code(reason: &str) -> &'static str {
    if reason.starts_with("Temporary failure") {
        "4.0.0"
    } else {
        "5.0.0"
    }
}

fn machine_readable_part(original: &QueuedMessage, config: &BounceConfig, reason: &str) -> String {
    let mut dsn = format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta);
    let _ = write!(dsn, "Arrival-Date: {}\r\n", rfc2822(original.added_at));

    dsn.push_str("\r\n");
    let _ = write!(dsn, "Final-Recipient: rfc822; {}\r\n", original.rcpt_to);
    dsn.push_str("Action: failed\r\n");
    let _ = write!(dsn, "Status: {}\r\n", status_code(reason));
    let _ = write!(dsn, "Diagnostic-Code: smtp; {reason}\r\n");

    dsn
}

/// The original header block, limited to the first 1KB
fn original_headers(data: &[u8]) -> String {
    if data.is_empty() {
        return String::from("(No message data available)");
    }

    let end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(data.len())
        .min(MAX_ORIGINAL_HEADERS);

    String::from_utf8_lossy(&data[..end]).to_string()
}

fn timestamp_micros(time: SystemTime) -> u128 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

fn rfc2822(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc2822()
}
