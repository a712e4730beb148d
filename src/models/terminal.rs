//! Terminal session state, owned by the Agent Lifecycle (C3) for the
//! duration of an ACP `terminal/*` handler sequence.

use tokio::process::Child;
use tokio::sync::oneshot;

/// Default cap on accumulated terminal output before truncation.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Exit status reported to `terminal/wait_for_exit` callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatus {
    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if applicable (unix only).
    pub signal: Option<i32>,
}

/// One terminal the agent has created via `terminal/create`.
///
/// Output is merged stdout+stderr, appended until `max_output_size` is
/// reached; once `truncated` is set, no further bytes are accumulated.
/// `getTerminalOutput` drains `buffer` (see
/// [`TerminalSession::drain_output`]), leaving it empty for the next read.
pub struct TerminalSession {
    /// Synthetic terminal id, unique within the owning lifecycle.
    pub id: String,
    /// The running child process, if still alive.
    pub process: Option<Child>,
    /// Accumulated output not yet drained by a `getTerminalOutput` call.
    buffer: Vec<u8>,
    /// Maximum total bytes ever accumulated (across drains).
    max_output_size: usize,
    /// Running total of bytes ever written, to detect the truncation edge.
    total_written: usize,
    /// Set once `max_output_size` has been reached; no more bytes accrue.
    pub truncated: bool,
    /// Set once the process has exited.
    pub exited: bool,
    /// Populated once `exited` is true.
    pub exit_status: ExitStatus,
    /// Waiters for `terminal/wait_for_exit`, resolved once on exit.
    exit_waiters: Vec<oneshot::Sender<ExitStatus>>,
}

impl TerminalSession {
    /// Construct a new, empty terminal session tracking `process`.
    #[must_use]
    pub fn new(id: String, process: Child) -> Self {
        Self {
            id,
            process: Some(process),
            buffer: Vec::new(),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            total_written: 0,
            truncated: false,
            exited: false,
            exit_status: ExitStatus::default(),
            exit_waiters: Vec::new(),
        }
    }

    /// Append bytes to the output buffer, honoring the truncation cap.
    pub fn append_output(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.max_output_size.saturating_sub(self.total_written);
        let take = bytes.len().min(remaining);
        self.buffer.extend_from_slice(&bytes[..take]);
        self.total_written += take;
        if take < bytes.len() {
            self.truncated = true;
        }
    }

    /// Drain and return all output accumulated since the last drain.
    pub fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Register a waiter to be resolved the moment [`Self::mark_exited`]
    /// runs. If the process has already exited, resolves immediately.
    pub fn wait_for_exit(&mut self, tx: oneshot::Sender<ExitStatus>) {
        if self.exited {
            let _ = tx.send(self.exit_status);
        } else {
            self.exit_waiters.push(tx);
        }
    }

    /// Record that the process exited and resolve all pending waiters.
    pub fn mark_exited(&mut self, status: ExitStatus) {
        self.exited = true;
        self.exit_status = status;
        for waiter in self.exit_waiters.drain(..) {
            let _ = waiter.send(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_only(max: usize) -> TerminalSessionBufferFixture {
        TerminalSessionBufferFixture::new(max)
    }

    /// Exercises just the buffer/truncation logic without a real child
    /// process, since `TerminalSession` otherwise requires a spawned one.
    struct TerminalSessionBufferFixture {
        buffer: Vec<u8>,
        max_output_size: usize,
        total_written: usize,
        truncated: bool,
    }

    impl TerminalSessionBufferFixture {
        fn new(max_output_size: usize) -> Self {
            Self { buffer: Vec::new(), max_output_size, total_written: 0, truncated: false }
        }

        fn append(&mut self, bytes: &[u8]) {
            if self.truncated {
                return;
            }
            let remaining = self.max_output_size.saturating_sub(self.total_written);
            let take = bytes.len().min(remaining);
            self.buffer.extend_from_slice(&bytes[..take]);
            self.total_written += take;
            if take < bytes.len() {
                self.truncated = true;
            }
        }
    }

    #[test]
    fn appends_until_cap_then_truncates() {
        let mut fixture = buffer_only(8);
        fixture.append(b"hello");
        fixture.append(b"world");
        assert!(fixture.truncated);
        assert_eq!(fixture.buffer.len(), 8);
        assert_eq!(&fixture.buffer, b"hellowor");
    }

    #[test]
    fn further_appends_after_truncation_are_dropped() {
        let mut fixture = buffer_only(4);
        fixture.append(b"abcd");
        assert!(!fixture.truncated);
        fixture.append(b"e");
        assert!(fixture.truncated);
        fixture.append(b"more");
        assert_eq!(fixture.buffer.len(), 4);
    }
}
