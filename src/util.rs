//! Utility functions and helpers.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

/// Send a value through a channel, logging a warning if it fails.
///
/// Returns `false` once the receiver is gone, so producers can stop:
/// ```ignore
/// if !send_or_log(&events, event, "live event").await {
///     return;
/// }
/// ```
pub async fn send_or_log<T>(tx: &mpsc::Sender<T>, value: T, context: &str) -> bool {
    match tx.send(value).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to send {}: {}", context, e);
            false
        }
    }
}

// Rich-text tags such as <color=#fff> or </b>
static MARKUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("valid regex"));

/// Strip `<tag>` markup from display strings
pub fn strip_markup(text: &str) -> String {
    MARKUP_RE.replace_all(text, "").trim().to_string()
}
