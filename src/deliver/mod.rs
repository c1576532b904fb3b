//! Clip delivery.
//!
//! Runs in its own process and shares nothing with the recorder except the output
//! directory. The recorder publishes clips by rename, so any file with a clip
//! extension and a visible name is complete and safe to send.

mod telegram;
mod watch;

use anyhow::Result;
use chrono::{DateTime, Local};
use std::path::Path;

pub use telegram::{TelegramSink, DEFAULT_API_BASE};
pub use watch::{DirectoryWatcher, PollOutcome};

/// Outcome of handing one clip to a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Sent. The watcher removes the file.
    Sent,
    /// Not sent and not an error. The file stays in place.
    Skipped,
}

/// Destination for finished clips.
pub trait ClipSink {
    fn name(&self) -> &'static str;

    /// Send one clip. An error leaves the file in place for a later retry.
    fn deliver(&mut self, path: &Path, caption: &str) -> Result<Delivery>;
}

impl<S: ClipSink + ?Sized> ClipSink for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn deliver(&mut self, path: &Path, caption: &str) -> Result<Delivery> {
        (**self).deliver(path, caption)
    }
}

/// Sink used when delivery is not configured. Leaves every clip on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledSink;

impl ClipSink for DisabledSink {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn deliver(&mut self, _path: &Path, _caption: &str) -> Result<Delivery> {
        Ok(Delivery::Skipped)
    }
}

/// Telegram sink from optional credentials.
///
/// Missing credentials are reported once and yield a `DisabledSink`.
pub fn telegram_sink(
    token: Option<String>,
    chat_id: Option<String>,
    api_base: &str,
) -> Box<dyn ClipSink> {
    let token = token.filter(|t| !t.trim().is_empty());
    let chat_id = chat_id.filter(|c| !c.trim().is_empty());
    match (token, chat_id) {
        (Some(token), Some(chat_id)) => Box::new(TelegramSink::new(api_base, token, chat_id)),
        (token, chat_id) => {
            let mut missing = Vec::new();
            if token.is_none() {
                missing.push("TELEGRAM_TOKEN");
            }
            if chat_id.is_none() {
                missing.push("TELEGRAM_CHAT_ID");
            }
            log::error!(
                "telegram delivery disabled: {} not configured; clips will stay on disk",
                missing.join(" and ")
            );
            Box::new(DisabledSink)
        }
    }
}

/// Message sent alongside a clip.
pub fn caption_at(at: DateTime<Local>) -> String {
    format!(
        "Detection of person/vehicle at {}",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}
