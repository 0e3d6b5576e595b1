//! Evaluates one request's Rhai code against the session state; the engine
//! is rebuilt per request.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use rhai::{Array, Dynamic, Engine, EvalAltResult, INT, ImmutableString, Position};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use crate::core::final_output::{ERROR_KEY, normalize_final, normalize_implicit};
use crate::core::profile::ExecutionProfile;
use crate::core::protocol::{ExecuteRequest, ExecuteResponse, ToolCall, ToolReply};
use crate::core::registry::{
    CALL_TOOL, LLM_QUERY, LLM_QUERY_BATCHED, SUBMIT, ToolRegistry, is_bindable,
};
use crate::worker::channel::ToolTransport;
use crate::worker::helpers;
use crate::worker::session::{Scratch, SessionState};
use crate::worker::storage::StorageRoot;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Continue { stdout: String, stderr: String },
    Final {
        stdout: String,
        stderr: String,
        payload: Value,
    },
}

impl Evaluation {
    pub fn into_response(self) -> ExecuteResponse {
        match self {
            Evaluation::Continue { stdout, stderr } => ExecuteResponse {
                stdout,
                stderr,
                final_output: None,
            },
            Evaluation::Final {
                stdout,
                stderr,
                payload,
            } => ExecuteResponse {
                stdout,
                stderr,
                final_output: Some(payload),
            },
        }
    }
}

#[derive(Clone)]
pub struct WorkerEnv {
    pub transport: Rc<RefCell<dyn ToolTransport>>,
    pub storage: Option<Rc<StorageRoot>>,
}

/// Evaluate `request` against `state`.
///
/// Never fails: faults end up in `stderr`. The implicit completion variable is
/// removed from the session whatever the outcome.
#[instrument(skip_all, fields(profile = %request.profile, code_len = request.code.len()))]
pub fn evaluate(state: &mut SessionState, request: &ExecuteRequest, env: &WorkerEnv) -> Evaluation {
    let stdout = Rc::new(RefCell::new(String::new()));
    let stderr = Rc::new(RefCell::new(String::new()));
    let submitted = SubmitCell::default();

    for (name, value) in &request.variables {
        match rhai::serde::to_dynamic(value) {
            Ok(dynamic) => {
                if !state.set(name, dynamic) {
                    stderr
                        .borrow_mut()
                        .push_str(&format!("Warning: {name} is a constant and was not updated\n"));
                }
            }
            Err(err) => stderr
                .borrow_mut()
                .push_str(&format!("Warning: variable {name} could not be loaded: {err}\n")),
        }
    }

    let proxy = ToolProxy::new(env.transport.clone(), &request.tool_names);
    let helpers = HelperEnv {
        profile: request.profile,
        scratch: state.scratch(),
        storage: env.storage.clone(),
    };
    let engine = build_engine(&stdout, &stderr, &submitted, &proxy, &helpers);

    let outcome = match engine.compile(&request.code) {
        Ok(ast) => {
            let runnable = state.library().merge(&ast);
            let outcome = engine.run_ast_with_scope(state.scope_mut(), &runnable);
            state.remember_functions(&ast);
            match outcome {
                Err(err) if is_oversized_submit(&err) => {
                    submitted.reject(format!(
                        "SUBMIT() accepts at most {MAX_SUBMIT_VALUES} values"
                    ));
                    Ok(())
                }
                other => other.map_err(|err| format!("Error: {err}")),
            }
        }
        Err(err) => Err(format!("SyntaxError: {err}")),
    };

    // Always cleared so a stale signal cannot end a later request.
    let implicit = state.take_final_var();
    let explicit = submitted.take();

    let mut stderr = std::mem::take(&mut *stderr.borrow_mut());
    let stdout = std::mem::take(&mut *stdout.borrow_mut());

    if let Some(submission) = explicit {
        debug!("request submitted final output");
        let payload = match submission {
            Submission::Values(values) => normalize_final(
                values.iter().map(dynamic_to_json).collect(),
                &request.output_names,
            ),
            Submission::Rejected(message) => json!({ ERROR_KEY: message }),
        };
        return Evaluation::Final {
            stdout,
            stderr,
            payload,
        };
    }

    if let Err(message) = outcome {
        debug!(error = %message, "evaluation fault");
        stderr.push_str(&message);
        stderr.push('\n');
        return Evaluation::Continue { stdout, stderr };
    }

    match implicit {
        Some(value) => Evaluation::Final {
            stdout,
            stderr,
            payload: normalize_implicit(dynamic_to_json(&value), &request.output_names),
        },
        None => Evaluation::Continue { stdout, stderr },
    }
}

fn build_engine(
    stdout: &Rc<RefCell<String>>,
    stderr: &Rc<RefCell<String>>,
    submitted: &SubmitCell,
    proxy: &ToolProxy,
    helpers: &HelperEnv,
) -> Engine {
    let mut engine = Engine::new();

    let out = Rc::clone(stdout);
    engine.on_print(move |text| {
        let mut out = out.borrow_mut();
        out.push_str(text);
        out.push('\n');
    });
    let err = Rc::clone(stderr);
    engine.on_debug(move |text, _source, _pos| {
        let mut err = err.borrow_mut();
        err.push_str(text);
        err.push('\n');
    });

    register_submit(&mut engine, submitted);
    register_tools(&mut engine, proxy);
    register_helpers(&mut engine, helpers);
    engine
}

enum Submission {
    Values(Vec<Dynamic>),
    Rejected(String),
}

/// Set at most once per request.
#[derive(Clone, Default)]
struct SubmitCell(Rc<RefCell<Option<Submission>>>);

impl SubmitCell {
    /// Record `values` and stop evaluation.
    fn submit(&self, values: Vec<Dynamic>) -> ScriptResult<()> {
        self.0.borrow_mut().get_or_insert(Submission::Values(values));
        Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into())
    }

    fn reject(&self, message: String) {
        self.0.borrow_mut().get_or_insert(Submission::Rejected(message));
    }

    fn take(&self) -> Option<Submission> {
        self.0.borrow_mut().take()
    }
}

/// Most positional values `SUBMIT` accepts.
const MAX_SUBMIT_VALUES: usize = 16;

#[allow(deprecated)] // `register_raw_fn` is flagged volatile, not removed.
fn register_submit(engine: &mut Engine, cell: &SubmitCell) {
    for arity in 0..=MAX_SUBMIT_VALUES {
        let c = cell.clone();
        engine.register_raw_fn(
            SUBMIT,
            vec![TypeId::of::<Dynamic>(); arity],
            move |_context, args| c.submit(args.iter_mut().map(|arg| arg.take()).collect()),
        );
    }
}

/// `SUBMIT` called with more values than it accepts.
fn is_oversized_submit(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorFunctionNotFound(signature, _) => {
            signature.starts_with(&format!("{SUBMIT} ("))
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_oversized_submit(inner),
        _ => false,
    }
}

/// Forwards tool invocations from evaluated code to the host.
#[derive(Clone)]
struct ToolProxy {
    transport: Rc<RefCell<dyn ToolTransport>>,
    tools: Rc<ToolRegistry<()>>,
}

impl ToolProxy {
    fn new(transport: Rc<RefCell<dyn ToolTransport>>, tool_names: &[String]) -> Self {
        let mut tools = ToolRegistry::new();
        for name in tool_names {
            let registration = tools.register(name, ());
            if !registration.is_active() {
                debug!(tool = %name, ?registration, "tool name not registered");
            }
        }
        Self {
            transport,
            tools: Rc::new(tools),
        }
    }

    fn bindable_names(&self) -> BTreeSet<String> {
        self.tools
            .names()
            .into_iter()
            .filter(|name| {
                let bindable = is_bindable(name);
                if !bindable {
                    debug!(tool = %name, "tool reachable through call_tool only");
                }
                bindable
            })
            .collect()
    }

    /// Call a caller-registered tool through the generic indirection.
    fn call_named(&self, name: &str, args: Array, kwargs: rhai::Map) -> ScriptResult<Dynamic> {
        if !(self.tools.contains(name) || name == LLM_QUERY || name == LLM_QUERY_BATCHED) {
            let available = self.tools.names();
            return Err(format!(
                "unknown tool {name:?}; available tools: {}",
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            )
            .into());
        }
        self.invoke(name, args, kwargs)
    }

    fn invoke(&self, name: &str, args: Array, kwargs: rhai::Map) -> ScriptResult<Dynamic> {
        let call = ToolCall {
            name: name.to_string(),
            args: args.iter().map(dynamic_to_json).collect(),
            kwargs: kwargs
                .iter()
                .map(|(key, value)| (key.to_string(), dynamic_to_json(value)))
                .collect::<Map<String, Value>>(),
        };
        let reply = self
            .transport
            .try_borrow_mut()
            .map_err(|_| format!("{name}: tool transport is busy"))?
            .call(call)
            .map_err(|err| format!("{name}: {err:#}"))?;
        match reply {
            ToolReply::Result(value) => rhai::serde::to_dynamic(&value),
            ToolReply::Error(message) => Err(format!("{name}: {message}").into()),
        }
    }
}

fn register_tools(engine: &mut Engine, proxy: &ToolProxy) {
    let p = proxy.clone();
    engine.register_fn(LLM_QUERY, move |prompt: ImmutableString| {
        p.invoke(LLM_QUERY, vec![Dynamic::from(prompt)], rhai::Map::new())
    });
    let p = proxy.clone();
    engine.register_fn(LLM_QUERY_BATCHED, move |prompts: Array| {
        p.invoke(
            LLM_QUERY_BATCHED,
            vec![Dynamic::from_array(prompts)],
            rhai::Map::new(),
        )
    });

    let p = proxy.clone();
    engine.register_fn(CALL_TOOL, move |name: ImmutableString, args: Array| {
        p.call_named(&name, args, rhai::Map::new())
    });
    let p = proxy.clone();
    engine.register_fn(
        CALL_TOOL,
        move |name: ImmutableString, args: Array, kwargs: rhai::Map| {
            p.call_named(&name, args, kwargs)
        },
    );

    for name in proxy.bindable_names() {
        bind_tool(engine, &name, proxy);
    }
}

/// Expose `name` as a script function taking zero to four positional values.
fn bind_tool(engine: &mut Engine, name: &str, proxy: &ToolProxy) {
    let (p, n) = (proxy.clone(), name.to_string());
    engine.register_fn(name, move || p.invoke(&n, Vec::new(), rhai::Map::new()));
    let (p, n) = (proxy.clone(), name.to_string());
    engine.register_fn(name, move |a: Dynamic| {
        p.invoke(&n, vec![a], rhai::Map::new())
    });
    let (p, n) = (proxy.clone(), name.to_string());
    engine.register_fn(name, move |a: Dynamic, b: Dynamic| {
        p.invoke(&n, vec![a, b], rhai::Map::new())
    });
    let (p, n) = (proxy.clone(), name.to_string());
    engine.register_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic| {
        p.invoke(&n, vec![a, b, c], rhai::Map::new())
    });
    let (p, n) = (proxy.clone(), name.to_string());
    engine.register_fn(
        name,
        move |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
            p.invoke(&n, vec![a, b, c, d], rhai::Map::new())
        },
    );
}

/// State shared by the profile-gated helpers.
#[derive(Clone)]
struct HelperEnv {
    profile: ExecutionProfile,
    scratch: Rc<RefCell<Scratch>>,
    storage: Option<Rc<StorageRoot>>,
}

impl HelperEnv {
    fn gate(&self, helper: &str) -> ScriptResult<()> {
        if self.profile.allows_helpers() {
            return Ok(());
        }
        Err(self.profile.helper_denied_message(helper).into())
    }

    fn storage(&self, helper: &str) -> ScriptResult<Rc<StorageRoot>> {
        self.gate(helper)?;
        self.storage.clone().ok_or_else(|| {
            format!("{helper}() requires a storage root (start the worker with --storage-root)")
                .into()
        })
    }
}

fn register_helpers(engine: &mut Engine, env: &HelperEnv) {
    let h = env.clone();
    engine.register_fn(
        "peek",
        move |text: ImmutableString, start: INT, len: INT| -> ScriptResult<String> {
            h.gate("peek")?;
            Ok(helpers::peek(&text, to_usize(start), to_usize(len)))
        },
    );

    let h = env.clone();
    engine.register_fn(
        "grep",
        move |text: ImmutableString, pattern: ImmutableString| -> ScriptResult<Array> {
            h.gate("grep")?;
            helpers::grep(&text, &pattern, 0)
                .map(strings_to_array)
                .map_err(script_error)
        },
    );
    let h = env.clone();
    engine.register_fn(
        "grep",
        move |text: ImmutableString, pattern: ImmutableString, context: INT| -> ScriptResult<Array> {
            h.gate("grep")?;
            helpers::grep(&text, &pattern, to_usize(context))
                .map(strings_to_array)
                .map_err(script_error)
        },
    );

    let h = env.clone();
    engine.register_fn(
        "split_text",
        move |text: ImmutableString, max_chars: INT| -> ScriptResult<Array> {
            h.gate("split_text")?;
            helpers::split_text(&text, to_usize(max_chars), 0)
                .map(strings_to_array)
                .map_err(script_error)
        },
    );
    let h = env.clone();
    engine.register_fn(
        "split_text",
        move |text: ImmutableString, max_chars: INT, overlap: INT| -> ScriptResult<Array> {
            h.gate("split_text")?;
            helpers::split_text(&text, to_usize(max_chars), to_usize(overlap))
                .map(strings_to_array)
                .map_err(script_error)
        },
    );

    let h = env.clone();
    engine.register_fn(
        "buffer_append",
        move |name: ImmutableString, text: Dynamic| -> ScriptResult<INT> {
            h.gate("buffer_append")?;
            let mut scratch = h.scratch.borrow_mut();
            let buffer = scratch.buffers.entry(name.to_string()).or_default();
            buffer.push_str(&text_of(&text));
            Ok(INT::try_from(buffer.chars().count()).unwrap_or(INT::MAX))
        },
    );
    let h = env.clone();
    engine.register_fn(
        "buffer_read",
        move |name: ImmutableString| -> ScriptResult<String> {
            h.gate("buffer_read")?;
            Ok(h
                .scratch
                .borrow()
                .buffers
                .get(name.as_str())
                .cloned()
                .unwrap_or_default())
        },
    );
    let h = env.clone();
    engine.register_fn("buffer_clear", move |name: ImmutableString| -> ScriptResult<()> {
        h.gate("buffer_clear")?;
        h.scratch.borrow_mut().buffers.remove(name.as_str());
        Ok(())
    });

    let h = env.clone();
    engine.register_fn("storage_read", move |path: ImmutableString| -> ScriptResult<String> {
        h.storage("storage_read")?
            .read(&path)
            .map_err(script_error)
    });
    let h = env.clone();
    engine.register_fn(
        "storage_write",
        move |path: ImmutableString, text: Dynamic| -> ScriptResult<INT> {
            let written = h
                .storage("storage_write")?
                .write(&path, &text_of(&text))
                .map_err(script_error)?;
            Ok(INT::try_from(written).unwrap_or(INT::MAX))
        },
    );

    let h = env.clone();
    engine.register_fn("log_history", move |entry: Dynamic| -> ScriptResult<INT> {
        h.gate("log_history")?;
        let mut scratch = h.scratch.borrow_mut();
        scratch.history.push(text_of(&entry));
        Ok(INT::try_from(scratch.history.len()).unwrap_or(INT::MAX))
    });
    let h = env.clone();
    engine.register_fn("history", move || -> ScriptResult<Array> {
        h.gate("history")?;
        Ok(strings_to_array(h.scratch.borrow().history.clone()))
    });
}

/// Convert a script value to JSON, stringifying what has no JSON form.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn text_of(value: &Dynamic) -> String {
    value
        .clone()
        .into_string()
        .unwrap_or_else(|_| value.to_string())
}

fn strings_to_array(items: Vec<String>) -> Array {
    items.into_iter().map(Dynamic::from).collect()
}

fn to_usize(value: INT) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn script_error(err: anyhow::Error) -> Box<EvalAltResult> {
    format!("{err:#}").into()
}
