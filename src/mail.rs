//! Disposable-mailbox client for one-time codes.
//!
//! Registration flows confirm the identifier with a code mailed out of
//! band. This is a plain polling HTTP client against Guerrilla Mail's
//! inbox page; the flow machine only sees the [`CodeMailbox`] trait.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

const INBOX_URL: &str = "https://www.guerrillamail.com/inbox";

/// Out-of-band source of a registration one-time code.
#[async_trait]
pub trait CodeMailbox: Send + Sync {
    /// A fresh disposable address to register with.
    async fn create_address(&self) -> Result<String>;
    /// The 6-digit code mailed to `address`, polling until it arrives.
    async fn fetch_code(&self, address: &str) -> Result<String>;
}

/// Guerrilla Mail implementation. The inbox page embeds the assigned
/// address and the current message list as inline script data, so both
/// are scraped with regular expressions rather than a JSON API.
pub struct GuerrillaMailbox {
    client: reqwest::Client,
    sender_filter: String,
    poll_attempts: u32,
    poll_backoff: Duration,
    address_re: Regex,
    result_re: Regex,
    code_re: Regex,
}

impl GuerrillaMailbox {
    /// `proxy` routes inbox polling through the same egress as the
    /// browser; `sender_filter` is the from-address carrying the code.
    pub fn new(proxy: Option<&str>, sender_filter: impl Into<String>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| EngineError::Mailbox(format!("bad proxy: {}", e)))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Mailbox(e.to_string()))?;

        Ok(Self {
            client,
            sender_filter: sender_filter.into(),
            poll_attempts: 20,
            poll_backoff: Duration::from_secs(3),
            address_re: Regex::new(r"Email: ([a-zA-Z]+@sharklasers\.com)")
                .map_err(|e| EngineError::Mailbox(e.to_string()))?,
            result_re: Regex::new(r"result: (\{.+\}),")
                .map_err(|e| EngineError::Mailbox(e.to_string()))?,
            code_re: Regex::new(r"[0-9]{6}").map_err(|e| EngineError::Mailbox(e.to_string()))?,
        })
    }

    async fn inbox_page(&self) -> Result<String> {
        let response = self
            .client
            .get(INBOX_URL)
            .send()
            .await
            .map_err(|e| EngineError::Mailbox(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Mailbox(format!(
                "inbox returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| EngineError::Mailbox(e.to_string()))
    }

    fn extract_address(&self, page: &str) -> Option<String> {
        self.address_re
            .captures(page)
            .map(|c| c[1].to_string())
    }

    /// Pulls the code out of one inbox page, if a matching message has
    /// arrived yet.
    fn extract_code(&self, page: &str) -> Result<Option<String>> {
        let Some(captures) = self.result_re.captures(page) else {
            return Ok(None);
        };

        let inbox: serde_json::Value = serde_json::from_str(&captures[1])
            .map_err(|e| EngineError::Mailbox(format!("inbox payload: {}", e)))?;
        if inbox["count"].as_str() == Some("0") {
            return Ok(None);
        }

        let Some(list) = inbox["list"].as_array() else {
            return Ok(None);
        };
        for message in list {
            if message["mail_from"].as_str() != Some(self.sender_filter.as_str()) {
                continue;
            }
            let excerpt = message["mail_excerpt"].as_str().ok_or_else(|| {
                EngineError::Mailbox("message has no excerpt".to_string())
            })?;
            return match self.code_re.find(excerpt) {
                Some(m) => Ok(Some(m.as_str().to_string())),
                None => Err(EngineError::Mailbox(
                    "no code in message excerpt".to_string(),
                )),
            };
        }
        Ok(None)
    }
}

#[async_trait]
impl CodeMailbox for GuerrillaMailbox {
    async fn create_address(&self) -> Result<String> {
        let page = self.inbox_page().await?;
        self.extract_address(&page)
            .ok_or_else(|| EngineError::Mailbox("no address on inbox page".to_string()))
    }

    async fn fetch_code(&self, address: &str) -> Result<String> {
        if !address.contains('@') {
            return Err(EngineError::Mailbox(format!(
                "not a mail address: {}",
                address
            )));
        }

        for attempt in 1..=self.poll_attempts {
            let page = self.inbox_page().await?;
            match self.extract_code(&page)? {
                Some(code) => return Ok(code),
                None => {
                    log::debug!(
                        "no code yet for {} (attempt {}/{})",
                        address,
                        attempt,
                        self.poll_attempts
                    );
                }
            }
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_backoff).await;
            }
        }
        Err(EngineError::Mailbox("code never arrived".to_string()))
    }
}
