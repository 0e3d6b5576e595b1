//! The worker's request loop.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::protocol::{ExecuteRequest, ExecuteResponse};
use crate::worker::channel::{ToolChannel, is_blank};
use crate::worker::evaluate::{WorkerEnv, evaluate};
use crate::worker::session::SessionState;
use crate::worker::storage::StorageRoot;

/// Reads request lines, evaluates them against one [`SessionState`], and writes
/// exactly one response line per request.
///
/// Tool calls issued during evaluation share the same streams, so the loop
/// never reads the next request until the current one has been answered.
pub struct WorkerLoop {
    channel: Rc<RefCell<ToolChannel>>,
    state: SessionState,
    env: WorkerEnv,
}

impl WorkerLoop {
    pub fn new(
        input: impl BufRead + 'static,
        output: impl Write + 'static,
        storage: Option<StorageRoot>,
    ) -> Self {
        let channel = Rc::new(RefCell::new(ToolChannel::new(input, output)));
        let env = WorkerEnv {
            transport: channel.clone(),
            storage: storage.map(Rc::new),
        };
        Self {
            channel,
            state: SessionState::new(),
            env,
        }
    }

    /// Serve requests until the input stream closes.
    pub fn run(&mut self) -> Result<()> {
        let mut served = 0_usize;
        loop {
            let line = self.channel.borrow_mut().read_line()?;
            let Some(line) = line else {
                info!(served, "input closed; worker exiting");
                return Ok(());
            };
            if is_blank(&line) {
                continue;
            }
            let response = self.handle_line(&line);
            self.channel.borrow_mut().write_message(&response)?;
            served += 1;
        }
    }

    /// Evaluate one request line. Undecodable lines get an error response and
    /// leave the session untouched.
    pub fn handle_line(&mut self, line: &[u8]) -> ExecuteResponse {
        match serde_json::from_slice::<ExecuteRequest>(line) {
            Ok(request) => {
                debug!(tools = request.tool_names.len(), "request received");
                evaluate(&mut self.state, &request, &self.env).into_response()
            }
            Err(err) => {
                warn!(error = %err, "invalid request line");
                ExecuteResponse::protocol_error(format!("invalid request: {err}"))
            }
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }
}
