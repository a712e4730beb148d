//! Context-usage sampling: the subordinate helper behind C5's rotation
//! decision (spec.md §4.5, §9 open question).
//!
//! The exact shape of an agent's stderr usage report is not specified by
//! the wire protocol, so the parser is pluggable: [`ContextUsageParser`]
//! is a trait, [`RegexContextUsageParser`] one conforming implementation
//! that tolerates agents that never print a usage line at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{broadcast, Mutex};

use crate::models::session::ContextUsage;
use crate::Result;

/// A source of an agent's raw stderr lines. Satisfied by
/// [`crate::lifecycle::AgentLifecycle::subscribe_stderr`]; kept as a trait
/// so the tracker can be tested without a real subprocess.
#[async_trait]
pub trait StderrProvider: Send + Sync {
    /// Wait for the next stderr line, or `None` if the source is closed.
    async fn next_line(&self) -> Option<String>;
}

/// Adapts a [`broadcast::Receiver`] of stderr lines into a [`StderrProvider`].
pub struct BroadcastStderrProvider {
    rx: Mutex<broadcast::Receiver<String>>,
}

impl BroadcastStderrProvider {
    /// Wrap a subscription handle.
    #[must_use]
    pub fn new(rx: broadcast::Receiver<String>) -> Self {
        Self { rx: Mutex::new(rx) }
    }
}

#[async_trait]
impl StderrProvider for BroadcastStderrProvider {
    async fn next_line(&self) -> Option<String> {
        loop {
            match self.rx.lock().await.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Parses one stderr line into a [`ContextUsage`] sample, or `None` if the
/// line doesn't carry a usage report.
pub trait ContextUsageParser: Send + Sync {
    /// Attempt to extract a usage sample from `line`.
    fn parse(&self, line: &str) -> Option<ContextUsage>;
}

/// Default parser: matches a `/context`-style report of the shape
/// `context usage: 72% (model: claude-sonnet)`, case-insensitively, with
/// the model clause optional.
pub struct RegexContextUsageParser {
    pattern: Regex,
}

impl RegexContextUsageParser {
    /// Build the parser. The pattern is fixed at construction so it is
    /// compiled once, not per line.
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::unwrap_used)]
        let pattern =
            Regex::new(r"(?i)context\s+usage:\s*([0-9]+(?:\.[0-9]+)?)\s*%(?:\s*\(model:\s*([^)]+)\))?").unwrap();
        Self { pattern }
    }
}

impl Default for RegexContextUsageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextUsageParser for RegexContextUsageParser {
    fn parse(&self, line: &str) -> Option<ContextUsage> {
        let caps = self.pattern.captures(line)?;
        let percentage: f64 = caps.get(1)?.as_str().parse().ok()?;
        let model_id = caps.get(2).map(|m| m.as_str().trim().to_owned());
        Some(ContextUsage { percentage: percentage / 100.0, model_id })
    }
}

/// Debounced, timed-out sampler: reads from a [`StderrProvider`] at most
/// once per `debounce` interval per session, and gives up after `timeout`
/// if nothing parseable arrives.
pub struct ContextUsageTracker {
    parser: Arc<dyn ContextUsageParser>,
    debounce: Duration,
    timeout: Duration,
    last_sampled: Mutex<HashMap<String, Instant>>,
}

impl ContextUsageTracker {
    /// Build a tracker with the §5 defaults (30s debounce, 10s timeout).
    #[must_use]
    pub fn new(parser: Arc<dyn ContextUsageParser>) -> Self {
        Self {
            parser,
            debounce: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            last_sampled: Mutex::new(HashMap::new()),
        }
    }

    /// Sample `session_id`'s context usage from `stderr`, if the debounce
    /// window has elapsed. Returns `Ok(None)` when skipped by debounce or
    /// when no parseable line arrived within the timeout — both are
    /// expected, non-fatal outcomes per §4.5 ("errors are non-fatal").
    ///
    /// # Errors
    ///
    /// Never returns an error in the current implementation; kept
    /// fallible so a future stricter `StderrProvider` can surface I/O
    /// failures without changing the call site.
    pub async fn sample(
        &self,
        session_id: &str,
        stderr: &dyn StderrProvider,
    ) -> Result<Option<ContextUsage>> {
        {
            let mut last = self.last_sampled.lock().await;
            if let Some(prev) = last.get(session_id) {
                if prev.elapsed() < self.debounce {
                    return Ok(None);
                }
            }
            last.insert(session_id.to_owned(), Instant::now());
        }

        let outcome = tokio::time::timeout(self.timeout, async {
            loop {
                match stderr.next_line().await {
                    Some(line) => {
                        if let Some(usage) = self.parser.parse(&line) {
                            return Some(usage);
                        }
                    }
                    None => return None,
                }
            }
        })
        .await;

        match outcome {
            Ok(usage) => Ok(usage),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        lines: Vec<&'static str>,
        idx: AtomicUsize,
    }

    #[async_trait]
    impl StderrProvider for ScriptedProvider {
        async fn next_line(&self) -> Option<String> {
            let i = self.idx.fetch_add(1, Ordering::SeqCst);
            self.lines.get(i).map(|s| (*s).to_owned())
        }
    }

    #[test]
    fn parses_percentage_and_model() {
        let parser = RegexContextUsageParser::new();
        let usage = parser.parse("context usage: 72% (model: claude-sonnet-4)").expect("should parse");
        assert!((usage.percentage - 0.72).abs() < f64::EPSILON);
        assert_eq!(usage.model_id.as_deref(), Some("claude-sonnet-4"));
    }

    #[test]
    fn ignores_unrelated_lines() {
        let parser = RegexContextUsageParser::new();
        assert!(parser.parse("some unrelated stderr noise").is_none());
    }

    #[tokio::test]
    async fn samples_first_matching_line() {
        let tracker = ContextUsageTracker::new(Arc::new(RegexContextUsageParser::new()));
        let provider = ScriptedProvider { lines: vec!["noise", "context usage: 50%"], idx: AtomicUsize::new(0) };

        let sample = tracker.sample("s1", &provider).await.unwrap();
        assert_eq!(sample.map(|u| u.percentage), Some(0.5));
    }

    #[tokio::test]
    async fn debounce_skips_rapid_resample() {
        let tracker = ContextUsageTracker::new(Arc::new(RegexContextUsageParser::new()));
        let provider = ScriptedProvider { lines: vec!["context usage: 10%", "context usage: 90%"], idx: AtomicUsize::new(0) };

        let first = tracker.sample("s1", &provider).await.unwrap();
        assert_eq!(first.map(|u| u.percentage), Some(0.1));

        let second = tracker.sample("s1", &provider).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn closed_provider_yields_none_without_erroring() {
        let tracker = ContextUsageTracker::new(Arc::new(RegexContextUsageParser::new()));
        let provider = ScriptedProvider { lines: vec![], idx: AtomicUsize::new(0) };
        let result = tracker.sample("s1", &provider).await.unwrap();
        assert_eq!(result, None);
    }
}
