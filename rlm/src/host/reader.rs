//! Background threads that drain the worker's output streams.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::hygiene::tail;

/// Items pushed by the stdout reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Line(String),
    /// The stream closed or failed; nothing follows.
    Eof,
}

/// Spawn the thread that turns worker stdout into [`ReaderEvent`]s.
///
/// The thread exits on end of stream, on a read error, or once the receiver is
/// dropped.
pub fn spawn_line_reader(stdout: Box<dyn Read + Send>) -> Result<Receiver<ReaderEvent>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("rlm-worker-reader".to_string())
        .spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(ReaderEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "worker stdout read failed");
                        break;
                    }
                }
            }
            let _ = tx.send(ReaderEvent::Eof);
        })
        .context("spawn worker stdout reader")?;
    Ok(rx)
}

/// Bounded tail of the worker's stderr, filled by a drain thread.
pub struct StderrTail {
    buffer: Arc<Mutex<String>>,
    handle: Option<JoinHandle<()>>,
}

impl StderrTail {
    /// A tail with no stream behind it.
    pub fn empty() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(String::new())),
            handle: None,
        }
    }

    /// Spawn a thread that keeps roughly the last `max_bytes` of `stderr`.
    pub fn spawn(stderr: Box<dyn Read + Send>, max_bytes: usize) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buffer);
        let handle = thread::Builder::new()
            .name("rlm-worker-stderr".to_string())
            .spawn(move || drain(stderr, &sink, max_bytes))
            .context("spawn worker stderr drain")?;
        Ok(Self {
            buffer,
            handle: Some(handle),
        })
    }

    /// Current tail, after giving the drain thread up to `settle` to catch up
    /// with a stream that is closing.
    pub fn snapshot(&self, settle: Duration) -> String {
        if let Some(handle) = &self.handle {
            let deadline = Instant::now() + settle;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn drain(mut stderr: Box<dyn Read + Send>, sink: &Mutex<String>, max_bytes: usize) {
    let mut chunk = [0_u8; 4096];
    loop {
        match stderr.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                let mut buffer = sink.lock().unwrap_or_else(PoisonError::into_inner);
                buffer.push_str(&text);
                if buffer.len() > max_bytes.saturating_mul(2) {
                    let kept = tail(&buffer, max_bytes).to_string();
                    *buffer = kept;
                }
            }
            Err(err) => {
                debug!(error = %err, "worker stderr read failed");
                return;
            }
        }
    }
}
