//! Bounded capture of the agent's stdout and stderr
//!
//! Every launch gets its own buffer holding at most `max_lines` lines; once full
//! the oldest line is evicted. Starting a new launch rotates the current buffer
//! into a history of at most `history` previous launches.
//!
//! Writers never wait on readers: buffer access is a short critical section that
//! is independent of the supervisor's lifecycle lock, and live subscribers are fed
//! through a broadcast channel that drops lines for receivers that fall behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uros_core::config::LogConfig;

const MAX_SUBSCRIBER_BACKLOG: usize = 1024;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One captured line of agent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Position within its launch, starting at 1
    pub seq: u64,
    pub launch_id: u64,
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Retained output of one launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchLog {
    pub launch_id: u64,
    pub lines: Vec<LogLine>,
    /// Lines evicted from the head of this launch's buffer
    pub dropped: u64,
}

/// Result of a cursor-based read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    pub launch_id: u64,
    pub lines: Vec<LogLine>,
    /// Pass back as `cursor` to continue after the last returned line
    pub next_cursor: u64,
}

#[derive(Debug)]
struct LogBuffer {
    launch_id: u64,
    next_seq: u64,
    dropped: u64,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    fn new(launch_id: u64) -> Self {
        Self {
            launch_id,
            next_seq: 1,
            dropped: 0,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, stream: LogStream, text: String, max_lines: usize) -> LogLine {
        let line = LogLine {
            seq: self.next_seq,
            launch_id: self.launch_id,
            stream,
            timestamp: Utc::now(),
            text,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        line
    }

    fn snapshot(&self) -> LaunchLog {
        LaunchLog {
            launch_id: self.launch_id,
            lines: self.lines.iter().cloned().collect(),
            dropped: self.dropped,
        }
    }
}

#[derive(Debug)]
struct CaptureState {
    current: LogBuffer,
    history: VecDeque<LogBuffer>,
}

/// Log buffers for the supervised agent
#[derive(Debug)]
pub struct LogCapture {
    max_lines: usize,
    max_line_bytes: usize,
    history: usize,
    state: Mutex<CaptureState>,
    events: broadcast::Sender<LogLine>,
}

impl LogCapture {
    pub fn new(config: &LogConfig) -> Self {
        let max_lines = config.max_lines.max(1);
        let (events, _) = broadcast::channel(max_lines.min(MAX_SUBSCRIBER_BACKLOG));
        Self {
            max_lines,
            max_line_bytes: config.max_line_bytes.max(1),
            history: config.history,
            state: Mutex::new(CaptureState {
                current: LogBuffer::new(0),
                history: VecDeque::new(),
            }),
            events,
        }
    }

    /// Retention bound per launch
    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Launch whose output is currently captured (0 before the first launch)
    pub fn current_launch(&self) -> u64 {
        self.lock().current.launch_id
    }

    /// Start capturing a new launch, moving the current buffer into history.
    pub fn rotate(&self, launch_id: u64) {
        let mut state = self.lock();
        let previous = std::mem::replace(&mut state.current, LogBuffer::new(launch_id));
        if previous.launch_id != 0 || !previous.lines.is_empty() {
            state.history.push_back(previous);
        }
        while state.history.len() > self.history {
            state.history.pop_front();
        }
        debug!("Log capture rotated to launch {}", launch_id);
    }

    /// Append a line to the buffer of `launch_id`.
    ///
    /// Lines for launches that are no longer retained are discarded.
    pub fn push(&self, launch_id: u64, stream: LogStream, mut text: String) {
        truncate_at_char_boundary(&mut text, self.max_line_bytes);

        let line = {
            let mut state = self.lock();
            let max_lines = self.max_lines;
            if state.current.launch_id == launch_id {
                state.current.push(stream, text, max_lines)
            } else if let Some(buffer) = state
                .history
                .iter_mut()
                .find(|b| b.launch_id == launch_id)
            {
                buffer.push(stream, text, max_lines)
            } else {
                return;
            }
        };

        // No receivers is not an error
        let _ = self.events.send(line);
    }

    /// Last `n` lines of the current launch, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let state = self.lock();
        let lines = &state.current.lines;
        lines.iter().skip(lines.len().saturating_sub(n)).cloned().collect()
    }

    /// Up to `limit` lines of the current launch with `seq > cursor`.
    ///
    /// `launch_id` is the launch the cursor was issued for. A cursor from an
    /// earlier launch restarts at the first line of the current one.
    pub fn since(&self, launch_id: Option<u64>, cursor: u64, limit: usize) -> LogPage {
        let state = self.lock();
        let cursor = match launch_id {
            Some(id) if id != state.current.launch_id => 0,
            _ => cursor,
        };
        let lines: Vec<LogLine> = state
            .current
            .lines
            .iter()
            .filter(|line| line.seq > cursor)
            .take(limit)
            .cloned()
            .collect();
        let next_cursor = lines.last().map(|line| line.seq).unwrap_or(cursor);
        LogPage {
            launch_id: state.current.launch_id,
            lines,
            next_cursor,
        }
    }

    /// Full retained output of the current launch
    pub fn current(&self) -> LaunchLog {
        self.lock().current.snapshot()
    }

    /// Most recently rotated launch, if any is retained
    pub fn previous(&self) -> Option<LaunchLog> {
        self.lock().history.back().map(LogBuffer::snapshot)
    }

    /// Live feed of newly captured lines
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

// Detach a UTF-8 sequence left unfinished at the end of `buf`
fn split_incomplete_char(buf: &mut Vec<u8>) -> Vec<u8> {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        if needed > back {
            return buf.split_off(len - back);
        }
        break;
    }
    Vec::new()
}

/// Drain `reader` into `capture` until EOF.
///
/// Reads in chunks of at most `max_line_bytes`, so an endless line is split
/// instead of buffered, and invalid UTF-8 is replaced rather than ending the
/// pump. The pipe is always drained, whatever happens to the lines.
pub(crate) fn spawn_pump<R>(
    capture: Arc<LogCapture>,
    launch_id: u64,
    stream: LogStream,
    reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let limit = capture.max_line_bytes as u64;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        // Start of a character cut off by the chunk limit
        let mut carry = Vec::new();

        loop {
            buf.clear();
            buf.append(&mut carry);
            match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    if !buf.is_empty() {
                        let text = String::from_utf8_lossy(&buf).into_owned();
                        capture.push(launch_id, stream, text);
                    }
                    break;
                }
                Ok(_) => {
                    if buf.last() != Some(&b'\n') {
                        carry = split_incomplete_char(&mut buf);
                        if buf.is_empty() {
                            continue;
                        }
                    }
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    capture.push(launch_id, stream, text);
                }
                Err(e) => {
                    warn!("Log capture for launch {} ({:?}) stopped: {}", launch_id, stream, e);
                    break;
                }
            }
        }

        debug!("Log capture for launch {} ({:?}) reached EOF", launch_id, stream);
    })
}
