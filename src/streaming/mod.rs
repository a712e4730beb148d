//! Streaming Output Assembly (C6): incremental coalescing of an agent's
//! `agent_message_chunk` stream into platform sends/edits, plus Discord's
//! code-fence-aware message-splitting rules (spec.md §4.6).
//!
//! Built fresh in the idiom of the teacher's `slack/client.rs` queue
//! worker (background task woken by a notify/timer, not a direct-call
//! API) — this corpus has no direct analog for incremental message
//! editing since the teacher always posts whole messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{AppError, Result};

/// Default size trigger: flush once the buffer has grown by this many
/// characters since the last flush.
pub const DEFAULT_MIN_CHARS: usize = 1500;
/// Default idle trigger: flush if nothing has been pushed for this long.
pub const DEFAULT_IDLE: Duration = Duration::from_millis(1000);
/// Discord's hard message-length limit.
pub const DEFAULT_HARD_CAP: usize = 2000;
/// Split decision soft threshold, below the hard cap.
pub const DEFAULT_SOFT_CAP: usize = 1800;
/// Embed description cap, used by [`format_embed_parts`].
pub const DEFAULT_EMBED_CAP: usize = 4096;
/// Marker appended when a forced split has no better boundary to cut on.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// The platform-facing half of a coalescer: turns accumulated snapshots
/// into an actual send/edit on the target platform.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// A flush: `snapshot` is the full accumulated text so far. The
    /// platform side edits the previously sent message to equal it, it
    /// does not append.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Coalescer`] on a platform send/edit failure.
    async fn on_chunk(&self, snapshot: &str) -> Result<()>;

    /// The stream has ended; `full_text` is the complete accumulated text.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Coalescer`] on a platform send/edit failure.
    async fn on_complete(&self, full_text: &str) -> Result<()>;

    /// The platform message id currently being edited, if any — lets a
    /// caller anchor widget updates (tool-call cards) to the message the
    /// user is watching. `None` for sinks with no open message yet, or
    /// that don't track one (buffered platforms).
    async fn current_message_id(&self) -> Option<String> {
        None
    }
}

/// Abstract coalescing contract both concrete variants implement.
#[async_trait]
pub trait Coalescer: Send + Sync {
    /// Push a chunk of text. An empty string is a no-op (block-boundary
    /// signaling happens one layer up, in the orchestrator's update
    /// handling — empty `agent_message_chunk`s are never forwarded here).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Coalescer`] if a prior flush already failed, or
    /// if this push triggers a flush that fails.
    async fn push(&self, text: &str) -> Result<()>;

    /// Flush any remaining content and finalize.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Coalescer`] if the final flush/complete
    /// callback fails.
    async fn complete(&self) -> Result<()>;

    /// Discard buffered content; no further callbacks fire.
    async fn abort(&self);
}

/// Accumulates all pushes and invokes `on_complete` exactly once, for
/// platforms without incremental edit.
pub struct BufferedCoalescer {
    sink: Arc<dyn ChunkSink>,
    buffer: Mutex<String>,
    aborted: AtomicBool,
}

impl BufferedCoalescer {
    /// Build a coalescer over `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn ChunkSink>) -> Self {
        Self { sink, buffer: Mutex::new(String::new()), aborted: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Coalescer for BufferedCoalescer {
    async fn push(&self, text: &str) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) || text.is_empty() {
            return Ok(());
        }
        self.buffer.lock().await.push_str(text);
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let full = self.buffer.lock().await.clone();
        self.sink.on_complete(&full).await
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

struct StreamCoalescerInner {
    buffer: String,
    last_flushed_len: usize,
}

/// Incremental coalescer for platforms with edit support: flushes on size
/// or idle, calling [`ChunkSink::on_chunk`] with the authoritative
/// accumulated snapshot each time.
pub struct StreamCoalescer {
    sink: Arc<dyn ChunkSink>,
    min_chars: usize,
    idle: Duration,
    inner: Mutex<StreamCoalescerInner>,
    notify: Notify,
    aborted: AtomicBool,
    completed: AtomicBool,
    last_error: Mutex<Option<AppError>>,
}

impl StreamCoalescer {
    /// Build a coalescer over `sink` with the §5 defaults (1500 chars /
    /// 1000 ms) and start its idle-flush background task.
    #[must_use]
    pub fn new(sink: Arc<dyn ChunkSink>) -> Arc<Self> {
        Self::with_thresholds(sink, DEFAULT_MIN_CHARS, DEFAULT_IDLE)
    }

    /// Build a coalescer with explicit thresholds, for tests.
    #[must_use]
    pub fn with_thresholds(sink: Arc<dyn ChunkSink>, min_chars: usize, idle: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            sink,
            min_chars,
            idle,
            inner: Mutex::new(StreamCoalescerInner { buffer: String::new(), last_flushed_len: 0 }),
            notify: Notify::new(),
            aborted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        let watcher = Arc::clone(&this);
        tokio::spawn(async move { watcher.idle_loop().await });

        this
    }

    fn done(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.completed.load(Ordering::SeqCst)
    }

    async fn idle_loop(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            if self.done() {
                return;
            }

            loop {
                let deadline = tokio::time::Instant::now() + self.idle;
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        let _ = self.flush().await;
                        break;
                    }
                    () = self.notify.notified() => {
                        if self.done() {
                            return;
                        }
                    }
                }
            }

            if self.done() {
                return;
            }
        }
    }

    async fn fail(&self, err: AppError) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        *self.last_error.lock().await = Some(err.clone());
        Err(err)
    }

    async fn flush(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(AppError::Coalescer("coalescer already aborted".into()));
        }

        let snapshot = {
            let mut inner = self.inner.lock().await;
            if inner.buffer.len() == inner.last_flushed_len {
                return Ok(());
            }
            inner.last_flushed_len = inner.buffer.len();
            inner.buffer.clone()
        };

        match self.sink.on_chunk(&snapshot).await {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err).await,
        }
    }
}

#[async_trait]
impl Coalescer for StreamCoalescer {
    async fn push(&self, text: &str) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(AppError::Coalescer("coalescer already aborted".into()));
        }
        if text.is_empty() {
            // Block-boundary signal: flush whatever is pending now rather
            // than waiting for the next size/idle trigger.
            return self.flush().await;
        }

        let should_flush = {
            let mut inner = self.inner.lock().await;
            inner.buffer.push_str(text);
            inner.buffer.len() - inner.last_flushed_len >= self.min_chars
        };

        if should_flush {
            self.flush().await
        } else {
            self.notify.notify_one();
            Ok(())
        }
    }

    async fn complete(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(AppError::Coalescer("coalescer already aborted".into()));
        }

        self.completed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        self.flush().await?;

        let full = self.inner.lock().await.buffer.clone();
        self.sink.on_complete(&full).await
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Decision [`StreamingSplitTracker::decide`] returns for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitAction {
    /// Keep editing the current message.
    Continue,
    /// Hold off editing; we're inside an unbalanced fence near the cap.
    Buffer,
    /// The content must become one or more message boundaries. The first
    /// chunk replaces the current message; the rest become new messages.
    Split(Vec<String>),
}

/// Discord-flavored split decision over progressive snapshots, aware of
/// open code fences so a fence is never torn across messages without
/// being closed and reopened.
pub struct StreamingSplitTracker {
    soft_cap: usize,
    hard_cap: usize,
}

impl StreamingSplitTracker {
    /// Build a tracker with explicit caps.
    #[must_use]
    pub fn new(soft_cap: usize, hard_cap: usize) -> Self {
        Self { soft_cap, hard_cap }
    }

    /// Decide what to do with `snapshot`, the full accumulated text so far.
    #[must_use]
    pub fn decide(&self, snapshot: &str) -> SplitAction {
        let len = snapshot.len();

        if len >= self.hard_cap {
            return self.forced_split(snapshot);
        }

        if len >= self.soft_cap {
            if let Some(start) = last_open_fence_start(snapshot) {
                if ends_with_freshly_opened_fence(snapshot) {
                    let before = snapshot[..start].trim_end();
                    if !before.is_empty() {
                        return SplitAction::Split(vec![before.to_owned(), snapshot[start..].to_owned()]);
                    }
                }
                return SplitAction::Buffer;
            }
        }

        SplitAction::Continue
    }

    fn forced_split(&self, snapshot: &str) -> SplitAction {
        let mut chunks = Vec::new();
        let mut cursor = 0usize;
        let mut carry_lang: Option<String> = None;

        loop {
            let prefix = carry_lang.as_ref().map_or_else(String::new, |lang| format!("```{lang}\n"));
            let remaining = &snapshot[cursor..];

            if prefix.len() + remaining.len() <= self.hard_cap {
                chunks.push(format!("{prefix}{remaining}"));
                break;
            }

            let closing_reserve = "\n```".len();
            let budget = self.hard_cap.saturating_sub(prefix.len()).saturating_sub(closing_reserve).max(1);
            let window_end = floor_char_boundary(remaining, budget.min(remaining.len()));
            let window = &remaining[..window_end];

            let (cut, hard_cut) = find_split_boundary(window, budget);
            let mut piece = remaining[..cut].to_owned();
            if hard_cut {
                piece.push_str(TRUNCATION_MARKER);
            }

            let piece_with_prefix = format!("{prefix}{piece}");
            let (open, lang) = fence_state(&piece_with_prefix);

            let mut chunk = piece_with_prefix;
            if open {
                chunk.push_str("\n```");
                carry_lang = lang;
            } else {
                carry_lang = None;
            }

            chunks.push(chunk);
            cursor += cut;

            if cursor >= snapshot.len() {
                break;
            }
        }

        SplitAction::Split(chunks)
    }
}

impl Default for StreamingSplitTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SOFT_CAP, DEFAULT_HARD_CAP)
    }
}

/// Find the byte index to cut `window` at, preferring (in order): a blank
/// line, a newline within the last 20% of the window, a space, or a hard
/// cut that reserves room for [`TRUNCATION_MARKER`]. Returns
/// `(cut_index, used_hard_cut)`.
fn find_split_boundary(window: &str, cap: usize) -> (usize, bool) {
    if let Some(idx) = window.rfind("\n\n") {
        return (idx + 2, false);
    }

    let tail_start = floor_char_boundary(window, window.len() * 4 / 5);
    if let Some(idx) = window[tail_start..].rfind('\n') {
        return (tail_start + idx + 1, false);
    }

    if let Some(idx) = window.rfind(' ') {
        return (idx + 1, false);
    }

    let cut = floor_char_boundary(window, cap.saturating_sub(TRUNCATION_MARKER.len()).min(window.len()));
    (cut, true)
}

/// Step backwards from `idx` to the nearest UTF-8 char boundary.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Whether `text`, scanned line by line, ends inside an unbalanced code
/// fence, and if so the language tag declared on the opening line.
fn fence_state(text: &str) -> (bool, Option<String>) {
    let mut open = false;
    let mut lang = None;

    for line in text.split('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if open {
                open = false;
                lang = None;
            } else {
                open = true;
                let tag = trimmed[3..].trim();
                lang = if tag.is_empty() { None } else { Some(tag.to_owned()) };
            }
        }
    }

    (open, lang)
}

/// Returns `true` when `text` ends inside an open fence whose opening
/// marker line is also the very last line of `text` — i.e. nothing has
/// been written inside the fence yet.
fn ends_with_freshly_opened_fence(text: &str) -> bool {
    let (open, _) = fence_state(text);
    if !open {
        return false;
    }
    match text.trim_end_matches('\n').rsplit('\n').next() {
        Some(last_line) => last_line.trim_start().starts_with("```"),
        None => false,
    }
}

/// Byte offset where the last still-open code fence begins (the start of
/// its opening marker's line), or `None` if there is no unbalanced fence.
fn last_open_fence_start(text: &str) -> Option<usize> {
    let mut offset = 0usize;
    let mut open = false;
    let mut open_start = None;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n').trim_start();
        if trimmed.starts_with("```") {
            if open {
                open = false;
                open_start = None;
            } else {
                open = true;
                open_start = Some(offset);
            }
        }
        offset += line.len();
    }

    if open {
        open_start
    } else {
        None
    }
}

/// One part of a multi-part embed send, for the embed-alternative render
/// path (§4.6 "Embed alternative").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedPart {
    /// Embed description text, capped at [`DEFAULT_EMBED_CAP`].
    pub description: String,
    /// `Part i of N` footer, present whenever more than one part exists.
    pub footer: Option<String>,
}

/// Split `full_text` into embed-sized parts (cap 4096), attaching a
/// `Part i of N` footer whenever more than one part results. Same
/// fence-integrity rules as message splitting apply via
/// [`StreamingSplitTracker`].
#[must_use]
pub fn format_embed_parts(full_text: &str) -> Vec<EmbedPart> {
    let tracker = StreamingSplitTracker::new(DEFAULT_EMBED_CAP, DEFAULT_EMBED_CAP);
    let pieces = match tracker.decide(full_text) {
        SplitAction::Split(chunks) => chunks,
        _ => vec![full_text.to_owned()],
    };

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, description)| EmbedPart {
            description,
            footer: if total > 1 { Some(format!("Part {} of {total}", i + 1)) } else { None },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        chunks: StdMutex<Vec<String>>,
        completes: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { chunks: StdMutex::new(vec![]), completes: StdMutex::new(vec![]) })
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn on_chunk(&self, snapshot: &str) -> Result<()> {
            self.chunks.lock().unwrap().push(snapshot.to_owned());
            Ok(())
        }

        async fn on_complete(&self, full_text: &str) -> Result<()> {
            self.completes.lock().unwrap().push(full_text.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffered_coalescer_completes_once_with_full_text() {
        let sink = RecordingSink::new();
        let coalescer = BufferedCoalescer::new(sink.clone());

        coalescer.push("He").await.unwrap();
        coalescer.push("llo").await.unwrap();
        coalescer.push("").await.unwrap();
        coalescer.push(", user!").await.unwrap();
        coalescer.complete().await.unwrap();

        assert_eq!(sink.completes.lock().unwrap().as_slice(), ["Hello, user!"]);
        assert!(sink.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_coalescer_flushes_on_size_threshold() {
        let sink = RecordingSink::new();
        let coalescer = StreamCoalescer::with_thresholds(sink.clone(), 5, Duration::from_secs(60));

        coalescer.push("hello world").await.unwrap();
        coalescer.complete().await.unwrap();

        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.last().map(String::as_str), Some("hello world"));
        assert_eq!(sink.completes.lock().unwrap().as_slice(), ["hello world"]);
    }

    #[tokio::test]
    async fn stream_coalescer_flushes_on_idle() {
        let sink = RecordingSink::new();
        let coalescer = StreamCoalescer::with_thresholds(sink.clone(), 1000, Duration::from_millis(20));

        coalescer.push("short").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(sink.chunks.lock().unwrap().as_slice(), ["short"]);
        coalescer.complete().await.unwrap();
    }

    #[tokio::test]
    async fn abort_suppresses_further_callbacks() {
        let sink = RecordingSink::new();
        let coalescer = StreamCoalescer::with_thresholds(sink.clone(), 5, Duration::from_secs(60));
        coalescer.push("hello").await.unwrap();
        coalescer.abort().await;
        assert!(coalescer.complete().await.is_err());
    }

    #[test]
    fn split_tracker_continues_below_soft_cap() {
        let tracker = StreamingSplitTracker::default();
        assert_eq!(tracker.decide("short text"), SplitAction::Continue);
    }

    #[test]
    fn split_tracker_forces_split_at_hard_cap_no_newlines() {
        let tracker = StreamingSplitTracker::default();
        let text = "x".repeat(2500);

        let action = tracker.decide(&text);
        match action {
            SplitAction::Split(chunks) => {
                assert!(chunks.len() >= 2);
                assert!(chunks[0].len() <= DEFAULT_HARD_CAP);
                assert!(chunks[0].ends_with(TRUNCATION_MARKER));
                let rejoined: String = chunks.iter().map(|c| c.trim_end_matches(TRUNCATION_MARKER)).collect();
                assert_eq!(rejoined.chars().filter(|c| *c == 'x').count(), 2500);
            }
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn split_tracker_preserves_fence_across_boundary() {
        let tracker = StreamingSplitTracker::default();
        let body = "x".repeat(1900);
        let text = format!("```javascript\n{body}\nconsole.log('end');\n```");

        match tracker.decide(&text) {
            SplitAction::Continue => {
                assert!(text.len() <= DEFAULT_HARD_CAP);
            }
            SplitAction::Split(chunks) => {
                assert!(chunks[0].ends_with("```"));
                assert!(chunks[1].starts_with("```javascript"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn split_tracker_buffers_inside_open_fence_below_hard_cap() {
        let tracker = StreamingSplitTracker::default();
        let body = "x".repeat(1850);
        let text = format!("```\n{body}");
        assert!(text.len() < DEFAULT_HARD_CAP);
        assert_eq!(tracker.decide(&text), SplitAction::Buffer);
    }

    #[test]
    fn split_tracker_preemptively_splits_freshly_opened_fence() {
        let tracker = StreamingSplitTracker::default();
        let prose = "y".repeat(1850);
        let text = format!("{prose}\n```python\n");

        match tracker.decide(&text) {
            SplitAction::Split(chunks) => {
                assert_eq!(chunks.len(), 2);
                assert!(chunks[1].starts_with("```python"));
            }
            other => panic!("expected preemptive split, got {other:?}"),
        }
    }

    #[test]
    fn embed_parts_carry_part_footer_when_multiple() {
        let text = "z".repeat(9000);
        let parts = format_embed_parts(&text);
        assert!(parts.len() >= 2);
        assert_eq!(parts[0].footer.as_deref(), Some("Part 1 of 2"));
    }

    #[test]
    fn embed_parts_have_no_footer_when_single() {
        let parts = format_embed_parts("short");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].footer, None);
    }
}
