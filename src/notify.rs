// =============================================================================
// Notifier — fire-and-forget user-facing messaging
// =============================================================================
//
// Strategies spawn a detached task to call `send_message` and never await
// its result — a slow or down notification backend must never stall the
// trading loop.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    PlainText,
    Markdown,
    Html,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, user_id: i64, text: &str, parse_mode: ParseMode);
}

/// Logs notifications instead of delivering them. Sufficient until a real
/// channel (Telegram, email, push) is wired in; the trait boundary is what
/// matters for the strategy code that calls it.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_message(&self, user_id: i64, text: &str, parse_mode: ParseMode) {
        debug!(user_id, ?parse_mode, "notification: {text}");
    }
}

/// Spawn a detached notification send. Call sites use this helper rather
/// than awaiting `Notifier::send_message` directly.
pub fn notify_fire_and_forget(
    notifier: std::sync::Arc<dyn Notifier>,
    user_id: i64,
    text: String,
    parse_mode: ParseMode,
) {
    tokio::spawn(async move {
        notifier.send_message(user_id, &text, parse_mode).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_notifier_does_not_panic() {
        let notifier = LoggingNotifier;
        notifier.send_message(1, "hello", ParseMode::PlainText).await;
    }
}
