//! Output plumbing between an execution context and its worker.
//!
//! Backends push decoded text into an [`OutputChannel`]; the worker drains it
//! from `poll` without blocking. Each context launch gets a fresh epoch and
//! each submitted cell a fresh generation, so late writes from a context that
//! was already torn down never leak into a newer execution.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::LimitKind;

pub(crate) const EXITED_NOTICE: &str = "\n[worker process exited unexpectedly]\n";
pub(crate) const TRUNCATED_NOTICE: &str = "\n[output truncated: size limit reached]\n";

#[derive(Debug, Default)]
struct ChannelState {
    epoch: u64,
    generation: u64,
    running: bool,
    finished: bool,
    pending: String,
    cumulative: String,
    ready: bool,
    exited: bool,
    breach: Option<LimitKind>,
    truncated: bool,
}

impl ChannelState {
    fn append(&mut self, text: &str) {
        self.pending.push_str(text);
        self.cumulative.push_str(text);
    }
}

/// Output consumed by one drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drained {
    pub fresh: String,
    pub cumulative: String,
    pub finished: bool,
    pub exited: bool,
    pub breach: Option<LimitKind>,
}

#[derive(Debug)]
pub struct OutputChannel {
    state: Mutex<ChannelState>,
    changed: Notify,
    max_bytes: usize,
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl OutputChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max_bytes` of output per execution, then a truncation notice
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            changed: Notify::new(),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // Nothing panics while holding the lock; recover rather than poison the worker.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a new context incarnation and returns its epoch
    pub fn attach(&self) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        state.ready = false;
        state.exited = false;
        state.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Starts a new execution and returns its generation
    pub fn begin(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.running = true;
        state.finished = false;
        state.pending.clear();
        state.cumulative.clear();
        state.breach = None;
        state.truncated = false;
        state.generation
    }

    /// Appends text from the context. Dropped when stale, when no execution
    /// is running, or once the execution's output reached the size limit.
    pub fn push(&self, epoch: u64, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let mut state = self.lock();
        if state.epoch != epoch || !state.running || state.truncated {
            return false;
        }
        let room = self.max_bytes.saturating_sub(state.cumulative.len());
        if text.len() <= room {
            state.append(text);
        } else {
            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            state.append(&text[..cut]);
            state.append(TRUNCATED_NOTICE);
            state.truncated = true;
        }
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// The context reported that the current execution completed
    pub fn finish(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch || !state.running {
            return;
        }
        state.running = false;
        state.finished = true;
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn mark_ready(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.ready = true;
        drop(state);
        self.changed.notify_waiters();
    }

    /// The context's output stream ended. A running execution is finished with a notice.
    pub fn close(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.exited = true;
        if state.running {
            state.append(EXITED_NOTICE);
            state.running = false;
            state.finished = true;
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Records a limit breach against `generation`. Returns false if that
    /// execution already finished or was replaced.
    pub fn breach(&self, generation: u64, kind: LimitKind) -> bool {
        let mut state = self.lock();
        if state.generation != generation || !state.running {
            return false;
        }
        let notice = format!("\n[terminated: {} limit exceeded]\n", kind);
        state.append(&notice);
        state.breach = Some(kind);
        state.running = false;
        state.finished = true;
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Finishes the current execution on the worker's behalf, appending `notice`.
    pub fn abort(&self, notice: &str) -> bool {
        let mut state = self.lock();
        if !state.running {
            return false;
        }
        state.append(notice);
        state.running = false;
        state.finished = true;
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Takes output produced since the previous drain
    pub fn drain(&self) -> Drained {
        let mut state = self.lock();
        Drained {
            fresh: std::mem::take(&mut state.pending),
            cumulative: state.cumulative.clone(),
            finished: state.finished,
            exited: state.exited,
            breach: state.breach,
        }
    }

    /// Cumulative output without consuming anything
    pub fn peek_cumulative(&self) -> String {
        self.lock().cumulative.clone()
    }

    /// Forgets a finished execution once its output has been delivered
    pub fn settle(&self) {
        let mut state = self.lock();
        state.running = false;
        state.finished = false;
        state.pending.clear();
        state.cumulative.clear();
        state.breach = None;
        state.truncated = false;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// True while `generation` is the execution in flight
    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.running && state.generation == generation
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }

    /// Waits until the context reports ready. False on timeout or if it exits first.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.ready || s.exited).await;
        self.is_ready()
    }

    /// Waits until no execution is running. False on timeout.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| !s.running).await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&ChannelState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(&*self.lock()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done(&*self.lock());
            }
        }
    }
}

/// Something found in a context's raw output stream
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Text(String),
    Marker(usize),
}

/// Splits a byte stream into text and in-band markers.
///
/// Bytes that might be the start of a marker, or of a UTF-8 sequence, are
/// held back until the next chunk settles them.
#[derive(Debug)]
pub struct MarkerScanner {
    markers: Vec<Vec<u8>>,
    buf: Vec<u8>,
}

impl MarkerScanner {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(|m| m.into().into_bytes()).collect(),
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ScanEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((pos, idx)) = self.earliest_marker() {
            if pos > 0 {
                events.push(ScanEvent::Text(
                    String::from_utf8_lossy(&self.buf[..pos]).into_owned(),
                ));
            }
            events.push(ScanEvent::Marker(idx));
            self.buf.drain(..pos + self.markers[idx].len());
        }

        let held = self.partial_marker_len();
        let emit = utf8_boundary(&self.buf[..self.buf.len() - held]);
        if emit > 0 {
            let text: Vec<u8> = self.buf.drain(..emit).collect();
            events.push(ScanEvent::Text(String::from_utf8_lossy(&text).into_owned()));
        }
        events
    }

    /// Releases whatever is still held back
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(text)
    }

    fn earliest_marker(&self) -> Option<(usize, usize)> {
        self.markers
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_empty())
            .filter_map(|(idx, m)| {
                self.buf
                    .windows(m.len())
                    .position(|w| w == m.as_slice())
                    .map(|pos| (pos, idx))
            })
            .min()
    }

    fn partial_marker_len(&self) -> usize {
        let longest = self.markers.iter().map(Vec::len).max().unwrap_or(0);
        let upper = longest.saturating_sub(1).min(self.buf.len());
        (1..=upper)
            .rev()
            .find(|&k| {
                let tail = &self.buf[self.buf.len() - k..];
                self.markers.iter().any(|m| m.starts_with(tail))
            })
            .unwrap_or(0)
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: &str = "\u{1e}ready-1\u{1e}";
    const DONE: &str = "\u{1e}done-1\u{1e}";

    fn text_of(events: &[ScanEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Text(t) => Some(t.as_str()),
                ScanEvent::Marker(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_scanner_splits_markers_from_text() {
        let mut scanner = MarkerScanner::new([READY, DONE]);
        let events = scanner.feed(format!("{READY}hello\n{DONE}after").as_bytes());
        assert_eq!(
            events,
            vec![
                ScanEvent::Marker(0),
                ScanEvent::Text("hello\n".into()),
                ScanEvent::Marker(1),
                ScanEvent::Text("after".into()),
            ]
        );
    }

    #[test]
    fn test_scanner_holds_back_split_marker() {
        let mut scanner = MarkerScanner::new([READY, DONE]);
        let bytes = format!("4\n{DONE}");
        let (head, tail) = bytes.as_bytes().split_at(5);

        let first = scanner.feed(head);
        assert_eq!(text_of(&first), "4\n");
        assert!(!first.contains(&ScanEvent::Marker(1)));

        let second = scanner.feed(tail);
        assert_eq!(second, vec![ScanEvent::Marker(1)]);
        assert_eq!(scanner.flush(), None);
    }

    #[test]
    fn test_scanner_releases_false_marker_prefix() {
        let mut scanner = MarkerScanner::new([DONE]);
        let first = scanner.feed("a\u{1e}do".as_bytes());
        assert_eq!(text_of(&first), "a");
        let second = scanner.feed(b"ne? no");
        assert_eq!(text_of(&second), "\u{1e}done? no");
    }

    #[test]
    fn test_scanner_holds_back_partial_utf8() {
        let mut scanner = MarkerScanner::new([DONE]);
        let bytes = "é!".as_bytes();
        assert!(scanner.feed(&bytes[..1]).is_empty());
        assert_eq!(text_of(&scanner.feed(&bytes[1..])), "é!");
    }

    #[test]
    fn test_scanner_flush_returns_remainder() {
        let mut scanner = MarkerScanner::new([DONE]);
        scanner.feed("tail\u{1e}d".as_bytes());
        assert_eq!(scanner.flush().as_deref(), Some("\u{1e}d"));
    }

    #[test]
    fn test_channel_fresh_and_cumulative() {
        let channel = OutputChannel::new();
        let epoch = channel.attach();
        channel.begin();

        assert!(channel.push(epoch, "a"));
        let first = channel.drain();
        assert_eq!(first.fresh, "a");
        assert_eq!(first.cumulative, "a");
        assert!(!first.finished);

        channel.push(epoch, "b");
        channel.finish(epoch);
        let second = channel.drain();
        assert_eq!(second.fresh, "b");
        assert_eq!(second.cumulative, "ab");
        assert!(second.finished);
    }

    #[test]
    fn test_channel_caps_output_per_execution() {
        let channel = OutputChannel::with_limit(10);
        let epoch = channel.attach();
        channel.begin();

        let mut fresh = String::new();
        assert!(channel.push(epoch, "12345"));
        fresh.push_str(&channel.drain().fresh);
        assert!(channel.push(epoch, "678é90"));
        assert!(!channel.push(epoch, "dropped"));
        channel.finish(epoch);
        let last = channel.drain();
        fresh.push_str(&last.fresh);

        // é straddles the limit, so the cut falls before it
        assert_eq!(last.cumulative, format!("12345678{TRUNCATED_NOTICE}"));
        assert_eq!(fresh, last.cumulative);
        assert_eq!(last.cumulative.matches("truncated").count(), 1);

        channel.settle();
        channel.begin();
        assert!(channel.push(epoch, "fresh"));
        assert_eq!(channel.drain().cumulative, "fresh");
    }

    #[test]
    fn test_channel_notices_follow_truncation() {
        let channel = OutputChannel::with_limit(4);
        let epoch = channel.attach();
        channel.begin();
        channel.push(epoch, "abcdefgh");
        channel.close(epoch);
        assert_eq!(
            channel.drain().cumulative,
            format!("abcd{TRUNCATED_NOTICE}{EXITED_NOTICE}")
        );
    }

    #[test]
    fn test_channel_ignores_stale_epoch() {
        let channel = OutputChannel::new();
        let old = channel.attach();
        channel.begin();
        let current = channel.attach();

        assert!(!channel.push(old, "late"));
        channel.finish(old);
        channel.close(old);
        assert!(channel.is_running());
        assert!(!channel.has_exited());

        assert!(channel.push(current, "ok"));
        assert_eq!(channel.drain().fresh, "ok");
    }

    #[test]
    fn test_channel_drops_output_after_finish() {
        let channel = OutputChannel::new();
        let epoch = channel.attach();
        channel.begin();
        channel.finish(epoch);
        assert!(!channel.push(epoch, "late"));
        assert_eq!(channel.drain().cumulative, "");
    }

    #[test]
    fn test_channel_close_finishes_running_execution() {
        let channel = OutputChannel::new();
        let epoch = channel.attach();
        channel.begin();
        channel.push(epoch, "partial");
        channel.close(epoch);

        let drained = channel.drain();
        assert!(drained.finished);
        assert!(drained.exited);
        assert_eq!(drained.cumulative, format!("partial{EXITED_NOTICE}"));
    }

    #[test]
    fn test_channel_breach_only_hits_current_generation() {
        let channel = OutputChannel::new();
        channel.attach();
        let first = channel.begin();
        let second = channel.begin();

        assert!(!channel.breach(first, LimitKind::WallTime));
        assert!(channel.breach(second, LimitKind::WallTime));
        assert!(!channel.breach(second, LimitKind::CpuTime));

        let drained = channel.drain();
        assert_eq!(drained.breach, Some(LimitKind::WallTime));
        assert!(drained.cumulative.contains("wall time limit exceeded"));
    }

    #[test]
    fn test_channel_settle_resets_accumulation() {
        let channel = OutputChannel::new();
        let epoch = channel.attach();
        channel.begin();
        channel.push(epoch, "x");
        channel.finish(epoch);
        channel.settle();

        let drained = channel.drain();
        assert_eq!(drained, Drained::default());
    }

    #[tokio::test]
    async fn test_wait_finished_wakes_on_finish() {
        let channel = std::sync::Arc::new(OutputChannel::new());
        let epoch = channel.attach();
        channel.begin();

        let finisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finisher.finish(epoch);
        });

        assert!(channel.wait_finished(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let channel = OutputChannel::new();
        channel.attach();
        assert!(!channel.wait_ready(Duration::from_millis(20)).await);
    }
}
