//! Worker side of the sandbox: evaluates one Rhai script at a time and turns
//! every capability reference into a blocking round trip to the host.
//!
//! Scripts see `args`, `body`, `query`, `params` and `user` as constants,
//! `repos.<table>` as repository stubs, and the static modules `helpers` and
//! `errors`. None of these execute anything locally: each call becomes a
//! [`WorkerMessage::Call`] and the script resumes once the matching
//! [`HostMessage::CallResult`] arrives.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Map, Module, Position, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use super::protocol::{read_frame, write_frame, HostMessage, ScriptContext, WorkerMessage};

type EvalResult<T> = Result<T, Box<EvalAltResult>>;

/// Resource ceilings applied to every evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Interpreter operations before the script is aborted.
    pub max_operations: u64,
    /// Maximum function call nesting.
    pub max_call_levels: usize,
    /// Longest string a script may build, in bytes.
    pub max_string_size: usize,
    /// Largest array a script may build.
    pub max_array_size: usize,
    /// Largest object map a script may build.
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_string_size: 1 << 20,
            max_array_size: 100_000,
            max_map_size: 100_000,
        }
    }
}

/// Blocking message channel from the worker's point of view.
pub trait Link {
    /// Sends one message to the host.
    fn send(&mut self, message: WorkerMessage) -> io::Result<()>;

    /// Waits for the next host message; `None` once the host hung up.
    fn recv(&mut self) -> io::Result<Option<HostMessage>>;
}

/// In-process link used by thread workers.
pub struct ChannelLink {
    inbound: UnboundedReceiver<HostMessage>,
    outbound: UnboundedSender<WorkerMessage>,
}

impl ChannelLink {
    /// Wraps the worker ends of the two channels.
    pub fn new(inbound: UnboundedReceiver<HostMessage>, outbound: UnboundedSender<WorkerMessage>) -> Self {
        Self { inbound, outbound }
    }
}

impl Link for ChannelLink {
    fn send(&mut self, message: WorkerMessage) -> io::Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host dropped the worker"))
    }

    fn recv(&mut self) -> io::Result<Option<HostMessage>> {
        Ok(self.inbound.blocking_recv())
    }
}

/// Length-prefixed JSON over a byte stream pair.
pub struct FramedLink<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> FramedLink<R, W> {
    /// Link reading host frames from `reader` and writing to `writer`.
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read, W: Write> Link for FramedLink<R, W> {
    fn send(&mut self, message: WorkerMessage) -> io::Result<()> {
        let bytes = serde_json::to_vec(&message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_frame(&mut self.writer, &bytes)
    }

    fn recv(&mut self) -> io::Result<Option<HostMessage>> {
        match read_frame(&mut self.reader)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            None => Ok(None),
        }
    }
}

/// Serves the framed protocol on this process's stdin and stdout.
pub fn serve_stdio() -> io::Result<()> {
    let link = FramedLink::new(io::stdin().lock(), io::stdout().lock());
    serve(Box::new(link), None)
}

/// Runs the worker loop until the host hangs up or asks it to stop.
///
/// `kill` is polled from the interpreter's progress hook; once set, the
/// running script is aborted and the loop exits without replying.
pub fn serve(link: Box<dyn Link>, kill: Option<Arc<AtomicBool>>) -> io::Result<()> {
    let bridge = Rc::new(Bridge::new(link));
    bridge.send(WorkerMessage::Ready {
        pid: std::process::id(),
    })?;
    let killed = || kill.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed));
    loop {
        let Some(message) = bridge.recv()? else {
            return Ok(());
        };
        match message {
            HostMessage::Execute {
                execution_id,
                script,
                context,
                limits,
            } => {
                bridge.begin(execution_id);
                let outcome = evaluate(&bridge, &script, &context, &limits, kill.clone());
                if bridge.broken.get() || killed() {
                    debug!(execution_id, "worker abandoning execution");
                    return Ok(());
                }
                let reply = match outcome {
                    Ok(data) => WorkerMessage::Done { execution_id, data },
                    Err(failure) => WorkerMessage::Error {
                        execution_id,
                        message: failure.message,
                        stack: failure.stack,
                        status_code: failure.status_code,
                    },
                };
                bridge.send(reply)?;
            }
            HostMessage::CallResult {
                execution_id,
                call_id,
                ..
            } => debug!(execution_id, call_id, "dropping call result with no pending call"),
            HostMessage::Shutdown => return Ok(()),
        }
    }
}

struct Bridge {
    link: RefCell<Box<dyn Link>>,
    execution_id: Cell<u64>,
    next_call: Cell<u64>,
    broken: Cell<bool>,
}

impl Bridge {
    fn new(link: Box<dyn Link>) -> Self {
        Self {
            link: RefCell::new(link),
            execution_id: Cell::new(0),
            next_call: Cell::new(0),
            broken: Cell::new(false),
        }
    }

    fn begin(&self, execution_id: u64) {
        self.execution_id.set(execution_id);
        self.next_call.set(0);
    }

    fn send(&self, message: WorkerMessage) -> io::Result<()> {
        self.link.borrow_mut().send(message)
    }

    fn recv(&self) -> io::Result<Option<HostMessage>> {
        self.link.borrow_mut().recv()
    }

    /// One remote call; blocks the script until the host answers.
    fn call(&self, path: String, args: &[Dynamic]) -> EvalResult<Dynamic> {
        let args = args
            .iter()
            .map(from_dynamic::<Json>)
            .collect::<EvalResult<Vec<_>>>()?;
        let execution_id = self.execution_id.get();
        let call_id = self.next_call.get() + 1;
        self.next_call.set(call_id);

        let mut link = self.link.borrow_mut();
        if let Err(err) = link.send(WorkerMessage::Call {
            execution_id,
            call_id,
            path,
            args,
        }) {
            return Err(self.transport(err.to_string()));
        }
        match link.recv() {
            Ok(Some(HostMessage::CallResult {
                execution_id: answered_execution,
                call_id: answered_call,
                result,
                error,
            })) if answered_execution == execution_id && answered_call == call_id => match error {
                Some(error) => Err(script_error(error.status_code, error.message)),
                None => to_dynamic(result.unwrap_or(Json::Null)),
            },
            Ok(Some(_)) => Err(self.transport(format!("unexpected message while awaiting call {call_id}"))),
            Ok(None) => Err(self.transport("host closed the channel".into())),
            Err(err) => Err(self.transport(err.to_string())),
        }
    }

    fn transport(&self, message: String) -> Box<EvalAltResult> {
        self.broken.set(true);
        EvalAltResult::ErrorTerminated(message.into(), Position::NONE).into()
    }
}

/// Script error carrying an HTTP-style status the host maps to an error kind.
fn script_error(status_code: Option<u16>, message: String) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert("message".into(), message.into());
    if let Some(code) = status_code {
        map.insert("statusCode".into(), Dynamic::from_int(i64::from(code)));
    }
    EvalAltResult::ErrorRuntime(map.into(), Position::NONE).into()
}

#[derive(Clone)]
struct RepoStub {
    table: String,
}

struct Failure {
    message: String,
    stack: Option<String>,
    status_code: Option<u16>,
}

impl Failure {
    fn from_eval(err: &EvalAltResult) -> Self {
        let (message, status_code) = match innermost(err) {
            EvalAltResult::ErrorRuntime(value, _) => match value.read_lock::<Map>() {
                Some(map) => (
                    map.get("message")
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| value.to_string()),
                    map.get("statusCode")
                        .and_then(|code| code.as_int().ok())
                        .and_then(|code| u16::try_from(code).ok()),
                ),
                None => (value.to_string(), None),
            },
            other => (other.to_string(), None),
        };
        Self {
            message,
            stack: Some(err.to_string()),
            status_code,
        }
    }
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            innermost(inner)
        }
        other => other,
    }
}

fn evaluate(
    bridge: &Rc<Bridge>,
    script: &str,
    context: &ScriptContext,
    limits: &SandboxLimits,
    kill: Option<Arc<AtomicBool>>,
) -> Result<Json, Failure> {
    let engine = build_engine(bridge, context, limits, kill);
    let fail = |err: Box<EvalAltResult>| Failure::from_eval(&err);

    let mut scope = Scope::new();
    for (name, value) in [
        ("args", &context.args),
        ("body", &context.body),
        ("query", &context.query),
        ("params", &context.params),
        ("user", &context.user),
    ] {
        scope.push_constant(name, to_dynamic(value).map_err(fail)?);
    }
    let mut repos = Map::new();
    for table in &context.tables {
        repos.insert(table.as_str().into(), Dynamic::from(RepoStub { table: table.clone() }));
    }
    if context.main_table.is_some() {
        repos.insert("main".into(), Dynamic::from(RepoStub { table: "main".into() }));
    }
    scope.push_constant("repos", repos);

    let value = engine
        .eval_with_scope::<Dynamic>(&mut scope, script)
        .map_err(fail)?;
    from_dynamic::<Json>(&value).map_err(fail)
}

fn build_engine(
    bridge: &Rc<Bridge>,
    context: &ScriptContext,
    limits: &SandboxLimits,
    kill: Option<Arc<AtomicBool>>,
) -> Engine {
    let mut engine = Engine::new();
    engine
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size);
    engine.disable_symbol("eval");
    // stdout may be the protocol channel.
    engine.on_print(|text| info!(target: "dyncore::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "dyncore::script", source = source.unwrap_or(""), %pos, "{text}")
    });
    if let Some(flag) = kill {
        engine.on_progress(move |_| {
            flag.load(Ordering::Relaxed)
                .then(|| Dynamic::from("worker killed".to_string()))
        });
    }

    engine.register_type_with_name::<RepoStub>("Repo");
    let repo_call = |bridge: &Rc<Bridge>, method: &'static str| {
        let bridge = Rc::clone(bridge);
        move |stub: &RepoStub, args: &[Dynamic]| bridge.call(format!("repos.{}.{method}", stub.table), args)
    };
    let find = repo_call(bridge, "find");
    engine.register_fn("find", move |stub: RepoStub| find(&stub, &[]));
    let find = repo_call(bridge, "find");
    engine.register_fn("find", move |stub: RepoStub, request: Dynamic| find(&stub, &[request]));
    let find_one = repo_call(bridge, "find_one");
    engine.register_fn("find_one", move |stub: RepoStub, id: Dynamic| find_one(&stub, &[id]));
    let create = repo_call(bridge, "create");
    engine.register_fn("create", move |stub: RepoStub, payload: Dynamic| create(&stub, &[payload]));
    let update = repo_call(bridge, "update");
    engine.register_fn("update", move |stub: RepoStub, id: Dynamic, payload: Dynamic| {
        update(&stub, &[id, payload])
    });
    let delete = repo_call(bridge, "delete");
    engine.register_fn("delete", move |stub: RepoStub, id: Dynamic| delete(&stub, &[id]));

    let mut helpers = Module::new();
    for name in &context.helpers {
        let path = format!("helpers.{name}");
        let (b, p) = (Rc::clone(bridge), path.clone());
        helpers.set_native_fn(name.as_str(), move || b.call(p.clone(), &[]));
        let (b, p) = (Rc::clone(bridge), path.clone());
        helpers.set_native_fn(name.as_str(), move |a: Dynamic| b.call(p.clone(), &[a]));
        let (b, p) = (Rc::clone(bridge), path.clone());
        helpers.set_native_fn(name.as_str(), move |a: Dynamic, c: Dynamic| b.call(p.clone(), &[a, c]));
        let (b, p) = (Rc::clone(bridge), path);
        helpers.set_native_fn(name.as_str(), move |a: Dynamic, c: Dynamic, d: Dynamic| {
            b.call(p.clone(), &[a, c, d])
        });
    }
    engine.register_static_module("helpers", helpers.into());

    let mut errors = Module::new();
    for status in ["throw400", "throw401", "throw403"] {
        let b = Rc::clone(bridge);
        let path = format!("errors.{status}");
        errors.set_native_fn(status, move |message: Dynamic| b.call(path.clone(), &[message]));
    }
    engine.register_static_module("errors", errors.into());

    engine
}
