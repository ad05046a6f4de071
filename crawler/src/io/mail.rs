//! Mail-retrieval seam used for OTP and verification-link actions.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static OTP_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\b(\d{4,8})\b"));
static URL_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#));

const LINK_HINTS: &[&str] = &["verify", "confirm", "activate", "token"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub subject: String,
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
}

pub trait MailClient: Send + Sync {
    /// Newest message in the test inbox, if any.
    fn latest_message(&self) -> Result<Option<MailMessage>>;
}

fn compiled(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex> {
    re.as_ref().map_err(|e| anyhow!("compile regex: {e}"))
}

/// First standalone 4-8 digit code, subject before body.
pub fn extract_otp(message: &MailMessage) -> Result<Option<String>> {
    let re = compiled(&OTP_RE)?;
    Ok([&message.subject, &message.body]
        .into_iter()
        .find_map(|text| re.captures(text).map(|caps| caps[1].to_string())))
}

/// First link that looks like a verification link, else the first link.
pub fn extract_verification_link(message: &MailMessage) -> Result<Option<String>> {
    let re = compiled(&URL_RE)?;
    let links: Vec<&str> = re
        .find_iter(&message.body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']))
        .collect();
    let preferred = links.iter().find(|link| {
        let lowered = link.to_lowercase();
        LINK_HINTS.iter().any(|hint| lowered.contains(hint))
    });
    Ok(preferred.or(links.first()).map(|link| (*link).to_string()))
}
