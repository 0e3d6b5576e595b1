//! Test doubles: in-memory pipes, in-process and scripted workers, fake
//! reasoning backends and a scripted planner.

use std::cell::{Cell, RefCell};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::host::transport::{WorkerHandle, WorkerLauncher, WorkerStreams};
use crate::io::backend::ReasoningBackend;
use crate::stream::{ChatMessage, EventStream, FrameworkEvent, PlannerBackend};
use crate::worker::WorkerLoop;
use crate::worker::storage::StorageRoot;

/// Write sink whose contents stay readable after a consumer takes ownership.
#[derive(Clone, Default)]
pub struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl SharedSink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking in-memory byte pipe. The reader sees end of stream once every
/// writer is dropped.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Handle for a worker running on a thread. Threads cannot be killed; they
/// end once their stdin pipe closes.
struct ThreadHandle {
    thread: JoinHandle<()>,
    terminated: bool,
}

impl WorkerHandle for ThreadHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        !self.terminated && !self.thread.is_finished()
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Runs a real [`WorkerLoop`] on a thread, connected through in-memory pipes.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    storage_root: Option<PathBuf>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self) -> Result<WorkerStreams> {
        let (stdin_writer, stdin_reader) = pipe();
        let (stdout_writer, stdout_reader) = pipe();
        let storage_root = self.storage_root.clone();
        let thread = thread::Builder::new()
            .name("rlm-test-worker".to_string())
            .spawn(move || {
                let storage = match storage_root.map(|root| StorageRoot::open(&root)).transpose() {
                    Ok(storage) => storage,
                    Err(err) => {
                        debug!(error = %format!("{err:#}"), "in-process worker failed to start");
                        return;
                    }
                };
                // Built on this thread: the loop is not `Send`.
                let mut worker = WorkerLoop::new(BufReader::new(stdin_reader), stdout_writer, storage);
                if let Err(err) = worker.run() {
                    debug!(error = %format!("{err:#}"), "in-process worker stopped");
                }
            })
            .context("spawn in-process worker")?;
        Ok(WorkerStreams {
            stdin: Box::new(stdin_writer),
            stdout: Box::new(stdout_reader),
            stderr: None,
            handle: Box::new(ThreadHandle {
                thread,
                terminated: false,
            }),
        })
    }

    fn describe(&self) -> String {
        "in-process worker".to_string()
    }
}

/// The worker end of a [`ScriptedLauncher`].
pub struct ScriptedWorker {
    input: BufReader<PipeReader>,
    output: PipeWriter,
    stderr: PipeWriter,
}

impl ScriptedWorker {
    /// Next line from the host without its terminator; `None` once stdin closes.
    pub fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_string()),
        }
    }

    pub fn write_line(&mut self, line: &str) {
        let _ = self.output.write_all(format!("{line}\n").as_bytes());
    }

    pub fn write_stderr(&mut self, text: &str) {
        let _ = self.stderr.write_all(text.as_bytes());
    }
}

type Script = Arc<dyn Fn(&mut ScriptedWorker) + Send + Sync>;

/// Launches a fake worker whose behaviour is a closure. The worker's streams
/// close when the closure returns.
#[derive(Clone)]
pub struct ScriptedLauncher {
    script: Script,
}

impl ScriptedLauncher {
    pub fn new(script: impl Fn(&mut ScriptedWorker) + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
        }
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self) -> Result<WorkerStreams> {
        let (stdin_writer, stdin_reader) = pipe();
        let (stdout_writer, stdout_reader) = pipe();
        let (stderr_writer, stderr_reader) = pipe();
        let script = Arc::clone(&self.script);
        let thread = thread::Builder::new()
            .name("rlm-scripted-worker".to_string())
            .spawn(move || {
                let mut worker = ScriptedWorker {
                    input: BufReader::new(stdin_reader),
                    output: stdout_writer,
                    stderr: stderr_writer,
                };
                script(&mut worker);
            })
            .context("spawn scripted worker")?;
        Ok(WorkerStreams {
            stdin: Box::new(stdin_writer),
            stdout: Box::new(stdout_reader),
            stderr: Some(Box::new(stderr_reader)),
            handle: Box::new(ThreadHandle {
                thread,
                terminated: false,
            }),
        })
    }
}

type Completion = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Backend answering from a closure.
pub struct FnBackend {
    complete: Completion,
}

impl FnBackend {
    pub fn new(complete: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            complete: Box::new(complete),
        }
    }
}

impl ReasoningBackend for FnBackend {
    fn complete(&self, prompt: &str) -> Result<String> {
        (self.complete)(prompt)
    }
}

/// Backend that always fails with `message`.
pub struct FailingBackend(pub String);

impl ReasoningBackend for FailingBackend {
    fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("{}", self.0))
    }
}

/// Backend that sleeps before answering.
pub struct SlowBackend {
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReasoningBackend for SlowBackend {
    fn complete(&self, _prompt: &str) -> Result<String> {
        thread::sleep(self.delay);
        Ok("slow answer".to_string())
    }
}

/// Planner replaying a fixed event list.
pub struct ScriptedPlanner {
    events: Vec<FrameworkEvent>,
    /// Raised when the stream is built.
    build_error: Option<String>,
    /// Raised after `events` have been yielded.
    stream_error: Option<String>,
    completion: Result<String, String>,
    seen_history_len: Cell<Option<usize>>,
}

impl ScriptedPlanner {
    pub fn streaming(events: Vec<FrameworkEvent>) -> Self {
        Self {
            events,
            build_error: None,
            stream_error: None,
            completion: Err("complete_turn was not expected".to_string()),
            seen_history_len: Cell::new(None),
        }
    }

    pub fn failing_stream(reason: &str, completion: Result<String, String>) -> Self {
        Self {
            build_error: Some(reason.to_string()),
            completion,
            ..Self::streaming(Vec::new())
        }
    }

    pub fn streaming_then_error(
        events: Vec<FrameworkEvent>,
        reason: &str,
        completion: Result<String, String>,
    ) -> Self {
        Self {
            stream_error: Some(reason.to_string()),
            completion,
            ..Self::streaming(events)
        }
    }

    /// History length passed to the last `stream_turn`.
    pub fn seen_history_len(&self) -> Option<usize> {
        self.seen_history_len.get()
    }
}

impl PlannerBackend for ScriptedPlanner {
    fn stream_turn(&self, history: &[ChatMessage], _message: &str) -> Result<EventStream<'_>> {
        self.seen_history_len.set(Some(history.len()));
        if let Some(reason) = &self.build_error {
            bail!("{reason}");
        }
        let tail = self.stream_error.clone().map(|reason| Err(anyhow!(reason)));
        Ok(Box::new(
            self.events.clone().into_iter().map(Ok).chain(tail),
        ))
    }

    fn complete_turn(&self, _history: &[ChatMessage], _message: &str) -> Result<String> {
        self.completion.clone().map_err(|message| anyhow!(message))
    }
}
