//! Channel Lifecycle shim (C8): the abstract send/edit/typing surface the
//! orchestrator consumes from whatever platform adapter is wired in.
//!
//! Grounded in the teacher's Slack client's public surface
//! (`post_message`/`update_message`) generalized to a trait so the
//! orchestrator can be tested against a recording double instead of a real
//! platform connection.

use async_trait::async_trait;

use crate::Result;

/// Result of a successful [`Channel::send_message`] or
/// [`Channel::edit_message`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// The id of the message sent or edited.
    pub message_id: String,
    /// Additional message ids created when an edit grew past the
    /// platform's hard cap and had to split into more messages.
    pub overflow_message_ids: Vec<String>,
}

impl SendOutcome {
    /// A send/edit that produced exactly one message with no overflow.
    #[must_use]
    pub fn single(message_id: impl Into<String>) -> Self {
        Self { message_id: message_id.into(), overflow_message_ids: Vec::new() }
    }
}

/// The platform-facing surface the orchestrator depends on (§6 "Platform
/// Channel contract"). Implementations own their own connection lifecycle;
/// `start`/`stop` bracket the orchestrator's own `running` window.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a new message to `channel`, optionally as a reply to
    /// `reply_to`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Coalescer`] on a platform send failure.
    async fn send_message(&self, channel: &str, text: &str, reply_to: Option<&str>) -> Result<SendOutcome>;

    /// Edit a previously sent message to read `text`. Required for
    /// streaming platforms; may split into overflow messages if `text`
    /// grew past the platform's hard cap since the original send.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Coalescer`] on a platform edit failure.
    async fn edit_message(&self, channel: &str, message_id: &str, text: &str) -> Result<SendOutcome>;

    /// Start a typing indicator loop for `channel`, anchored to
    /// `message_id` if the platform supports per-message typing context.
    /// Best-effort: failures never propagate to the caller.
    async fn start_typing_loop(&self, channel: &str, message_id: &str);

    /// Stop any typing indicator loop running for `channel`. Best-effort.
    async fn stop_typing_loop(&self, channel: &str);

    /// Bring the platform connection up.
    ///
    /// # Errors
    ///
    /// Returns an implementation-defined error if the connection cannot
    /// be established.
    async fn start(&self) -> Result<()>;

    /// Tear the platform connection down. Best-effort; should not block
    /// indefinitely.
    async fn stop(&self);

    /// Whether this channel supports incremental message editing
    /// (`true` → the orchestrator uses [`crate::streaming::StreamCoalescer`];
    /// `false` → [`crate::streaming::BufferedCoalescer`]).
    fn supports_streaming(&self) -> bool;
}

/// A `Channel` that discards everything, for components that don't need
/// platform output (spawn-only tests, headless checks).
pub struct NullChannel {
    streaming: bool,
}

impl NullChannel {
    /// Build a null channel reporting `streaming` from
    /// [`Channel::supports_streaming`].
    #[must_use]
    pub fn new(streaming: bool) -> Self {
        Self { streaming }
    }
}

#[async_trait]
impl Channel for NullChannel {
    async fn send_message(&self, _channel: &str, _text: &str, _reply_to: Option<&str>) -> Result<SendOutcome> {
        Ok(SendOutcome::single("null-message"))
    }

    async fn edit_message(&self, _channel: &str, message_id: &str, _text: &str) -> Result<SendOutcome> {
        Ok(SendOutcome::single(message_id))
    }

    async fn start_typing_loop(&self, _channel: &str, _message_id: &str) {}

    async fn stop_typing_loop(&self, _channel: &str) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}

#[cfg(test)]
pub mod test_support {
    use super::{Channel, Result, SendOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// One recorded call against a [`RecordingChannel`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedCall {
        /// A [`Channel::send_message`] call.
        Send { channel: String, text: String, reply_to: Option<String> },
        /// A [`Channel::edit_message`] call.
        Edit { channel: String, message_id: String, text: String },
        /// A [`Channel::start_typing_loop`] call.
        TypingStart { channel: String },
        /// A [`Channel::stop_typing_loop`] call.
        TypingStop { channel: String },
    }

    /// Test double that records every call it receives and hands back
    /// deterministic, incrementing message ids.
    pub struct RecordingChannel {
        pub calls: Mutex<Vec<RecordedCall>>,
        next_id: AtomicU64,
        streaming: bool,
    }

    impl RecordingChannel {
        #[must_use]
        pub fn new(streaming: bool) -> Self {
            Self { calls: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), streaming }
        }

        fn next_message_id(&self) -> String {
            format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn send_message(&self, channel: &str, text: &str, reply_to: Option<&str>) -> Result<SendOutcome> {
            self.calls.lock().await.push(RecordedCall::Send {
                channel: channel.to_owned(),
                text: text.to_owned(),
                reply_to: reply_to.map(str::to_owned),
            });
            Ok(SendOutcome::single(self.next_message_id()))
        }

        async fn edit_message(&self, channel: &str, message_id: &str, text: &str) -> Result<SendOutcome> {
            self.calls.lock().await.push(RecordedCall::Edit {
                channel: channel.to_owned(),
                message_id: message_id.to_owned(),
                text: text.to_owned(),
            });
            Ok(SendOutcome::single(message_id))
        }

        async fn start_typing_loop(&self, channel: &str, _message_id: &str) {
            self.calls.lock().await.push(RecordedCall::TypingStart { channel: channel.to_owned() });
        }

        async fn stop_typing_loop(&self, channel: &str) {
            self.calls.lock().await.push(RecordedCall::TypingStop { channel: channel.to_owned() });
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        fn supports_streaming(&self) -> bool {
            self.streaming
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingChannel;
    use super::*;

    #[tokio::test]
    async fn null_channel_reports_configured_streaming_support() {
        let streaming = NullChannel::new(true);
        assert!(streaming.supports_streaming());
        let buffered = NullChannel::new(false);
        assert!(!buffered.supports_streaming());
    }

    #[tokio::test]
    async fn recording_channel_assigns_incrementing_ids() {
        let channel = RecordingChannel::new(true);
        let first = channel.send_message("c1", "hi", Some("m1")).await.unwrap();
        let second = channel.send_message("c1", "again", None).await.unwrap();
        assert_ne!(first.message_id, second.message_id);
        assert_eq!(channel.calls.lock().await.len(), 2);
    }
}
