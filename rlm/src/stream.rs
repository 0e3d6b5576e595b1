//! Translation of a planner's streaming turn into presentation events.
//!
//! Planners emit whatever their framework produces ([`FrameworkEvent`]); the
//! presentation layer only ever sees the closed [`StreamEvent`] set. A turn
//! never fails from the caller's point of view: streaming faults degrade to a
//! single non-streaming completion, and a failing completion becomes an
//! `error` event.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::hygiene::redact_secrets;

/// Suffix committed to history when a turn is cancelled mid-stream.
pub const CANCELLED_MARKER: &str = " [cancelled]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Raw events produced by a planner framework.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameworkEvent {
    Token(String),
    Reasoning(String),
    ToolStart {
        name: String,
        input: Value,
    },
    ToolEnd {
        name: String,
        output: String,
    },
    Step {
        index: usize,
        thought: String,
        tool: Option<String>,
        observation: Option<String>,
    },
    Status(String),
    /// The turn's answer. Overrides the accumulated tokens when present.
    Done(String),
}

/// Events handed to presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        message: String,
    },
    AssistantToken {
        text: String,
    },
    ReasoningStep {
        text: String,
    },
    ToolCall {
        name: String,
        input: Value,
    },
    ToolResult {
        name: String,
        output: String,
    },
    TrajectoryStep {
        index: usize,
        thought: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        observation: Option<String>,
    },
    Final {
        text: String,
    },
    Cancelled {
        partial: String,
    },
    Error {
        message: String,
    },
}

/// Presentation event for `event`; `Done` has none of its own.
fn translate(event: FrameworkEvent) -> Option<StreamEvent> {
    Some(match event {
        FrameworkEvent::Token(text) => StreamEvent::AssistantToken { text },
        FrameworkEvent::Reasoning(text) => StreamEvent::ReasoningStep { text },
        FrameworkEvent::ToolStart { name, input } => StreamEvent::ToolCall { name, input },
        FrameworkEvent::ToolEnd { name, output } => StreamEvent::ToolResult { name, output },
        FrameworkEvent::Step {
            index,
            thought,
            tool,
            observation,
        } => StreamEvent::TrajectoryStep {
            index,
            thought,
            tool,
            observation,
        },
        FrameworkEvent::Status(message) => StreamEvent::Status { message },
        FrameworkEvent::Done(_) => return None,
    })
}

pub type EventStream<'a> = Box<dyn Iterator<Item = Result<FrameworkEvent>> + 'a>;

/// An interactive planner.
///
/// `history` never includes `message`; the translator commits both after the
/// turn.
pub trait PlannerBackend {
    fn stream_turn(&self, history: &[ChatMessage], message: &str) -> Result<EventStream<'_>>;

    fn complete_turn(&self, history: &[ChatMessage], message: &str) -> Result<String>;
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(String),
    /// Streaming failed; the answer came from a single completion.
    FellBack(String),
    /// Cancelled; carries the partial text that was committed.
    Cancelled(String),
    /// Streaming and the fallback both failed.
    Failed(String),
}

/// Run one planner turn, emitting [`StreamEvent`]s into `sink`.
///
/// The user message is committed to `history` up front. The assistant reply is
/// committed when the turn completes, falls back, or is cancelled (then with
/// [`CANCELLED_MARKER`] appended). `is_cancelled` is polled before every event.
#[instrument(skip_all, fields(history_len = history.len()))]
pub fn translate_turn(
    planner: &dyn PlannerBackend,
    history: &mut Vec<ChatMessage>,
    message: &str,
    is_cancelled: &dyn Fn() -> bool,
    sink: &mut dyn FnMut(StreamEvent),
) -> TurnOutcome {
    let prior = history.clone();
    history.push(ChatMessage::user(message));

    let events = match planner.stream_turn(&prior, message) {
        Ok(events) => events,
        Err(err) => return fall_back(planner, &prior, history, message, &err, sink),
    };

    let mut partial = String::new();
    let mut answer = None;
    for event in events {
        if is_cancelled() {
            debug!(partial_len = partial.len(), "turn cancelled");
            let committed = format!("{partial}{CANCELLED_MARKER}");
            history.push(ChatMessage::assistant(committed.clone()));
            sink(StreamEvent::Cancelled { partial });
            return TurnOutcome::Cancelled(committed);
        }
        let event = match event {
            Ok(event) => event,
            Err(err) => return fall_back(planner, &prior, history, message, &err, sink),
        };
        match &event {
            FrameworkEvent::Token(text) => partial.push_str(text),
            FrameworkEvent::Done(text) => answer = Some(text.clone()),
            _ => {}
        }
        if let Some(translated) = translate(event) {
            sink(translated);
        }
    }

    let text = answer.unwrap_or(partial);
    history.push(ChatMessage::assistant(text.clone()));
    sink(StreamEvent::Final { text: text.clone() });
    TurnOutcome::Completed(text)
}

fn fall_back(
    planner: &dyn PlannerBackend,
    prior: &[ChatMessage],
    history: &mut Vec<ChatMessage>,
    message: &str,
    cause: &anyhow::Error,
    sink: &mut dyn FnMut(StreamEvent),
) -> TurnOutcome {
    let reason = redact_secrets(&format!("{cause:#}"));
    warn!(reason = %reason, "streaming failed; falling back to a single completion");
    sink(StreamEvent::Status {
        message: format!("streaming unavailable ({reason}); answered without streaming"),
    });
    match planner.complete_turn(prior, message) {
        Ok(text) => {
            history.push(ChatMessage::assistant(text.clone()));
            sink(StreamEvent::Final { text: text.clone() });
            TurnOutcome::FellBack(text)
        }
        Err(err) => {
            let message = redact_secrets(&format!("{err:#}"));
            sink(StreamEvent::Error {
                message: message.clone(),
            });
            TurnOutcome::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedPlanner;
    use serde_json::json;
    use std::cell::Cell;

    fn run(
        planner: &ScriptedPlanner,
        history: &mut Vec<ChatMessage>,
        cancel_after: Option<usize>,
    ) -> (TurnOutcome, Vec<StreamEvent>) {
        let polls = Cell::new(0_usize);
        let is_cancelled = || {
            polls.set(polls.get() + 1);
            cancel_after.is_some_and(|limit| polls.get() > limit)
        };
        let mut events = Vec::new();
        let outcome = translate_turn(planner, history, "question", &is_cancelled, &mut |event| {
            events.push(event);
        });
        (outcome, events)
    }

    #[test]
    fn tokens_are_streamed_and_committed() {
        let planner = ScriptedPlanner::streaming(vec![
            FrameworkEvent::Status("thinking".into()),
            FrameworkEvent::Token("Hel".into()),
            FrameworkEvent::Token("lo".into()),
        ]);
        let mut history = vec![ChatMessage::user("earlier")];
        let (outcome, events) = run(&planner, &mut history, None);

        assert_eq!(outcome, TurnOutcome::Completed("Hello".into()));
        assert_eq!(
            events,
            vec![
                StreamEvent::Status {
                    message: "thinking".into()
                },
                StreamEvent::AssistantToken { text: "Hel".into() },
                StreamEvent::AssistantToken { text: "lo".into() },
                StreamEvent::Final {
                    text: "Hello".into()
                },
            ]
        );
        assert_eq!(
            history,
            vec![
                ChatMessage::user("earlier"),
                ChatMessage::user("question"),
                ChatMessage::assistant("Hello"),
            ]
        );
        assert_eq!(planner.seen_history_len(), Some(1));
    }

    #[test]
    fn tool_and_trajectory_events_are_translated() {
        let planner = ScriptedPlanner::streaming(vec![
            FrameworkEvent::Reasoning("need data".into()),
            FrameworkEvent::ToolStart {
                name: "search".into(),
                input: json!({"q": "x"}),
            },
            FrameworkEvent::ToolEnd {
                name: "search".into(),
                output: "found".into(),
            },
            FrameworkEvent::Step {
                index: 0,
                thought: "look it up".into(),
                tool: Some("search".into()),
                observation: None,
            },
            FrameworkEvent::Done("answer".into()),
        ]);
        let mut history = Vec::new();
        let (outcome, events) = run(&planner, &mut history, None);
        assert_eq!(outcome, TurnOutcome::Completed("answer".into()));

        let types: Vec<String> = events
            .iter()
            .map(|event| serde_json::to_value(event).expect("json")["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            types,
            vec!["reasoning_step", "tool_call", "tool_result", "trajectory_step", "final"]
        );
        assert_eq!(
            serde_json::to_value(&events[3]).expect("json"),
            json!({"type": "trajectory_step", "index": 0, "thought": "look it up", "tool": "search"})
        );
    }

    #[test]
    fn cancellation_flushes_partial_text() {
        let planner = ScriptedPlanner::streaming(vec![
            FrameworkEvent::Token("par".into()),
            FrameworkEvent::Token("tial".into()),
            FrameworkEvent::Token(" never".into()),
        ]);
        let mut history = Vec::new();
        let (outcome, events) = run(&planner, &mut history, Some(2));

        assert_eq!(outcome, TurnOutcome::Cancelled("partial [cancelled]".into()));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Cancelled {
                partial: "partial".into()
            })
        );
        assert_eq!(history.last(), Some(&ChatMessage::assistant("partial [cancelled]")));
    }

    #[test]
    fn construction_fault_falls_back_with_redacted_status() {
        let planner = ScriptedPlanner::failing_stream("connect failed: token=abc123def", Ok("fallback answer".into()));
        let mut history = Vec::new();
        let (outcome, events) = run(&planner, &mut history, None);

        assert_eq!(outcome, TurnOutcome::FellBack("fallback answer".into()));
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Status { message } => {
                assert!(message.contains("token=[REDACTED]"), "{message}");
                assert!(!message.contains("abc123def"));
            }
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(
            events[1],
            StreamEvent::Final {
                text: "fallback answer".into()
            }
        );
        assert_eq!(history.last(), Some(&ChatMessage::assistant("fallback answer")));
    }

    #[test]
    fn mid_stream_fault_falls_back() {
        let planner = ScriptedPlanner::streaming_then_error(
            vec![FrameworkEvent::Token("half".into())],
            "stream reset",
            Ok("whole".into()),
        );
        let mut history = Vec::new();
        let (outcome, events) = run(&planner, &mut history, None);
        assert_eq!(outcome, TurnOutcome::FellBack("whole".into()));
        assert!(matches!(events[0], StreamEvent::AssistantToken { .. }));
        assert!(matches!(events[1], StreamEvent::Status { .. }));
        assert_eq!(events[2], StreamEvent::Final { text: "whole".into() });
    }

    #[test]
    fn failing_fallback_emits_error_and_keeps_user_message() {
        let planner = ScriptedPlanner::failing_stream("no stream", Err("backend down".into()));
        let mut history = Vec::new();
        let (outcome, events) = run(&planner, &mut history, None);
        assert_eq!(outcome, TurnOutcome::Failed("backend down".into()));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error {
                message: "backend down".into()
            })
        );
        assert_eq!(history, vec![ChatMessage::user("question")]);
    }
}
