//! Line-oriented I/O between the worker loop and the host.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::core::protocol::{ToolCall, ToolCallMessage, ToolReply, encode_line};

/// Suspends evaluation while the host services a tool call.
pub trait ToolTransport {
    /// Send `call` and block until exactly one reply arrives.
    fn call(&mut self, call: ToolCall) -> Result<ToolReply>;
}

/// The worker's paired input/output streams.
pub struct ToolChannel {
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl ToolChannel {
    pub fn new(input: impl BufRead + 'static, output: impl Write + 'static) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    /// Read the next line as raw bytes without its terminator; `None` at end
    /// of stream. Decoding is left to the caller so invalid UTF-8 is a bad
    /// message, not a broken stream.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = self
            .input
            .read_until(b'\n', &mut line)
            .context("read input line")?;
        if n == 0 {
            return Ok(None);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Write one JSON line and flush it.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let line = encode_line(message)?;
        self.output
            .write_all(line.as_bytes())
            .context("write output line")?;
        self.output.flush().context("flush output")
    }
}

impl ToolTransport for ToolChannel {
    fn call(&mut self, call: ToolCall) -> Result<ToolReply> {
        debug!(tool = %call.name, "emitting tool call");
        self.write_message(&ToolCallMessage { tool_call: call })?;
        loop {
            let line = self
                .read_line()?
                .ok_or_else(|| anyhow!("input closed while waiting for a tool result"))?;
            if is_blank(&line) {
                continue;
            }
            return serde_json::from_slice(&line)
                .with_context(|| format!("invalid tool reply: {}", preview(&line)));
        }
    }
}

pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn preview(line: &[u8]) -> String {
    String::from_utf8_lossy(line).chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SharedSink;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn call_writes_request_and_reads_one_reply() {
        let sink = SharedSink::default();
        let input = Cursor::new(b"{\"tool_result\": 42}\n{\"code\": \"next\"}\n".to_vec());
        let mut channel = ToolChannel::new(input, sink.clone());

        let reply = channel
            .call(ToolCall {
                name: "answer".into(),
                args: vec![json!(1)],
                kwargs: Default::default(),
            })
            .expect("reply");
        assert_eq!(reply, ToolReply::Result(json!(42)));

        assert_eq!(
            sink.contents(),
            "{\"tool_call\":{\"name\":\"answer\",\"args\":[1],\"kwargs\":{}}}\n"
        );
        // The following request line is left for the loop.
        assert_eq!(
            channel.read_line().expect("read").as_deref(),
            Some(b"{\"code\": \"next\"}".as_slice())
        );
    }

    #[test]
    fn call_fails_when_input_closes() {
        let mut channel = ToolChannel::new(Cursor::new(Vec::new()), SharedSink::default());
        let err = channel
            .call(ToolCall {
                name: "answer".into(),
                args: Vec::new(),
                kwargs: Default::default(),
            })
            .expect_err("closed input");
        assert!(err.to_string().contains("input closed"));
    }

    #[test]
    fn non_utf8_tool_reply_is_an_error_not_a_dead_stream() {
        let input = Cursor::new(b"{\"tool_result\": \"\xff\"}\n{\"code\": \"1\"}\n".to_vec());
        let mut channel = ToolChannel::new(input, SharedSink::default());
        let err = channel
            .call(ToolCall {
                name: "answer".into(),
                args: Vec::new(),
                kwargs: Default::default(),
            })
            .expect_err("invalid reply");
        assert!(format!("{err:#}").contains("invalid tool reply"));
        assert!(channel.read_line().expect("read").is_some());
    }

    #[test]
    fn read_line_strips_crlf() {
        let mut channel = ToolChannel::new(Cursor::new(b"abc\r\n".to_vec()), SharedSink::default());
        assert_eq!(channel.read_line().expect("read").as_deref(), Some(b"abc".as_slice()));
        assert_eq!(channel.read_line().expect("read"), None);
    }
}
