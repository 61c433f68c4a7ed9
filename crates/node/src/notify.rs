//! Push notifications through a bot-style messaging endpoint.
//!
//! The body is `chat_id=<id>&text=<encoded>` sent as
//! `application/x-www-form-urlencoded`, with the text escaped by
//! [`url_encode`].

use tracing::{info, warn};

use crate::config::MessagingSection;
use crate::error::NotifyError;
use crate::http::{build_url, Transport};

/// Percent-encode message text. ASCII letters and digits pass through,
/// space is `%20`, newline is `%0A`, every other byte is `%XX`.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' => out.push(b as char),
            b' ' => out.push_str("%20"),
            b'\n' => out.push_str("%0A"),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Where alert and summary text goes.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

pub struct Messenger<T> {
    transport: T,
    bot_url: String,
    token: String,
    chat_id: String,
}

impl<T: Transport> Messenger<T> {
    pub fn new(transport: T, messaging: &MessagingSection) -> Self {
        let m = Self {
            transport,
            bot_url: messaging.bot_url.trim_end_matches('/').to_string(),
            token: messaging.bot_token.clone(),
            chat_id: messaging.chat_id.clone(),
        };
        if !m.enabled() {
            warn!("messaging disabled: bot token or chat id missing");
        }
        m
    }

    pub fn enabled(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }
}

impl<T: Transport> Notifier for Messenger<T> {
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        if !self.enabled() {
            return Err(NotifyError::Disabled);
        }
        if text.trim().is_empty() {
            return Err(NotifyError::EmptyMessage);
        }

        let url = build_url(&format!("{}/bot{}/sendMessage", self.bot_url, self.token), &[])?;
        let body = format!("chat_id={}&text={}", self.chat_id, url_encode(text));

        let resp = self.transport.post_form(&url, body).await?;
        info!(bytes = resp.len(), "message delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording notifier for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct RecordingNotifier {
        sent: Rc<RefCell<Vec<String>>>,
    }

    impl RecordingNotifier {
        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.borrow().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        async fn notify(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.borrow_mut().push(text.to_string());
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
