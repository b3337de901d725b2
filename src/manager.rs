//! Per-connection RPC state: registered methods, pending sessions, and the
//! message-kind handlers that tie the wire to the deferred engine.
//!
//! An [`EpcManager`] owns one connection. Both peers hold one; the protocol
//! is symmetric, so "client" and "server" only describe who connected.
//! Outbound calls allocate a uid from a process-wide monotonic counter and
//! park a deferred in the session table; the peer's reply resolves it.
//! Inbound calls are dispatched against the method registry and answered
//! with `return`/`return-error`/`epc-error`.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel::EventChannel;
use crate::deferred::{Deferred, Step};
use crate::error::EpcError;
use crate::framing::{FrameReader, FrameWriter};
use crate::runtime;
use crate::sexp::Sexp;
use crate::wire::{events, Message};

/// Process-wide call uid counter. Uids are never recycled.
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Connection name counter, for log readability only.
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// How long `stop` lets the writer drain already-queued frames.
const PENDING_OUTPUT_GRACE: Duration = Duration::from_millis(150);

/// Which side of the connection this manager is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed out.
    Initiator,
    /// We accepted the socket.
    Acceptor,
}

/// What a task hands back to the dispatcher.
pub enum MethodOutcome {
    /// Reply with `return` immediately.
    Value(Sexp),
    /// Reply once this deferred resolves.
    Deferred(Deferred),
}

impl From<Sexp> for MethodOutcome {
    fn from(value: Sexp) -> MethodOutcome {
        MethodOutcome::Value(value)
    }
}

type Task = Rc<dyn Fn(Vec<Sexp>) -> Result<MethodOutcome, String>>;

/// A callable registered with [`EpcManager::define_method`].
pub struct Method {
    name: String,
    task: Task,
    arg_specs: Option<String>,
    docstring: Option<String>,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        task: impl Fn(Vec<Sexp>) -> Result<MethodOutcome, String> + 'static,
    ) -> Method {
        Method {
            name: name.into(),
            task: Rc::new(task),
            arg_specs: None,
            docstring: None,
        }
    }

    /// Argument description shown in `methods` introspection replies.
    pub fn with_arg_specs(mut self, arg_specs: impl Into<String>) -> Method {
        self.arg_specs = Some(arg_specs.into());
        self
    }

    /// Documentation shown in `methods` introspection replies.
    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Method {
        self.docstring = Some(docstring.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> Sexp {
        let opt = |text: &Option<String>| match text {
            Some(text) => Sexp::string(text.clone()),
            None => Sexp::Nil,
        };
        Sexp::list(vec![
            Sexp::symbol(self.name.clone()),
            opt(&self.arg_specs),
            opt(&self.docstring),
        ])
    }
}

struct ManagerInner {
    name: String,
    role: Role,
    methods: RefCell<Vec<Method>>,
    /// Pending outbound calls, scanned linearly by uid.
    sessions: RefCell<Vec<(u64, Deferred)>>,
    channel: Rc<EventChannel>,
    outgoing: UnboundedSender<Message>,
    live: Cell<bool>,
    closed: Notify,
    stop_writer: Rc<Notify>,
    reader: RefCell<Option<JoinHandle<()>>>,
    writer: RefCell<Option<JoinHandle<()>>>,
    /// Peer subprocess launched by [`EpcManager::start_process`], if any.
    child: RefCell<Option<Child>>,
}

/// Handle to one connection's RPC state. Cloning shares the connection.
#[derive(Clone)]
pub struct EpcManager {
    inner: Rc<ManagerInner>,
}

impl std::fmt::Debug for EpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpcManager")
            .field("name", &self.inner.name)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl EpcManager {
    /// Dial a peer and wrap the connection (initiator role).
    ///
    /// Must be called inside a `LocalSet` (see [`crate::runtime`]).
    pub async fn connect(addr: &str) -> io::Result<EpcManager> {
        let stream = TcpStream::connect(addr).await?;
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Ok(Self::from_stream(
            format!("epc:con:{n}"),
            Role::Initiator,
            stream,
        ))
    }

    /// Wrap an accepted socket (acceptor role).
    pub fn accept(stream: TcpStream) -> EpcManager {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self::from_stream(format!("epc:con:{n}"), Role::Acceptor, stream)
    }

    /// Launch a peer process and connect to it.
    ///
    /// The child must print its listening port as the first line on stdout.
    /// The child is tracked and terminated by [`EpcManager::stop`].
    pub async fn start_process(program: &str, args: &[&str]) -> io::Result<EpcManager> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not captured")
        })?;
        let line = BufReader::new(stdout).lines().next_line().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "child exited before announcing a port",
            )
        })?;
        let port: u16 = line.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("child announced a bad port: {line:?}"),
            )
        })?;
        let manager = Self::connect(&format!("127.0.0.1:{port}")).await?;
        manager.inner.child.borrow_mut().replace(child);
        Ok(manager)
    }

    /// Wrap any byte stream. Tests use `tokio::io::duplex` pipes here.
    ///
    /// Spawns the connection's reader and writer tasks, wires the five
    /// message-kind handlers, and registers the manager in the live set.
    pub fn from_stream<S>(name: impl Into<String>, role: Role, stream: S) -> EpcManager
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let stop_writer = Rc::new(Notify::new());

        let inner = Rc::new(ManagerInner {
            name: name.clone(),
            role,
            methods: RefCell::new(Vec::new()),
            sessions: RefCell::new(Vec::new()),
            channel: Rc::new(EventChannel::new(name)),
            outgoing,
            live: Cell::new(true),
            closed: Notify::new(),
            stop_writer: stop_writer.clone(),
            reader: RefCell::new(None),
            writer: RefCell::new(None),
            child: RefCell::new(None),
        });

        init_handlers(&inner);

        let reader = runtime::spawn(reader_task(
            FrameReader::new(read_half),
            inner.channel.clone(),
            Rc::downgrade(&inner),
        ));
        let writer = runtime::spawn(writer_task(
            FrameWriter::new(write_half),
            outgoing_rx,
            stop_writer,
        ));
        inner.reader.borrow_mut().replace(reader);
        inner.writer.borrow_mut().replace(writer);

        let manager = EpcManager { inner };
        live::register(&manager);
        manager
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Register a method. Later definitions shadow earlier ones of the same
    /// name.
    pub fn define_method(&self, method: Method) {
        self.inner.methods.borrow_mut().insert(0, method);
    }

    /// Call a method on the peer; the returned deferred resolves with the
    /// reply value or fails with the peer's error.
    pub fn call(&self, method: &str, args: Vec<Sexp>) -> Deferred {
        let d = Deferred::new();
        if !self.inner.live.get() {
            d.post_reject(EpcError::Closed);
            return d;
        }
        let uid = next_uid();
        self.inner.sessions.borrow_mut().push((uid, d.clone()));
        enqueue(
            &self.inner,
            Message::Call {
                uid,
                method: method.to_owned(),
                args,
            },
        );
        d
    }

    /// Call and wait for the reply.
    pub async fn call_sync(&self, method: &str, args: Vec<Sexp>) -> Result<Sexp, EpcError> {
        self.call(method, args).wait().await
    }

    /// Ask the peer for its method table: a list of
    /// `(NAME ARG-SPECS DOCSTRING)` entries.
    pub fn query_methods(&self) -> Deferred {
        let d = Deferred::new();
        if !self.inner.live.get() {
            d.post_reject(EpcError::Closed);
            return d;
        }
        let uid = next_uid();
        self.inner.sessions.borrow_mut().push((uid, d.clone()));
        enqueue(&self.inner, Message::Methods { uid });
        d
    }

    /// True while the connection tasks are running.
    pub fn is_live(&self) -> bool {
        self.inner.live.get()
    }

    /// Shut the connection down. Idempotent.
    ///
    /// Aborts the reader, gives the writer up to 150 ms to flush frames that
    /// are already queued, and drops the socket halves. Pending sessions are
    /// left unresolved; callers notice via [`EpcManager::is_live`].
    pub fn stop(&self) {
        if !self.inner.live.replace(false) {
            return;
        }
        tracing::debug!(name = %self.inner.name, "stopping epc connection");
        live::unregister(self);
        if let Some(reader) = self.inner.reader.borrow_mut().take() {
            reader.abort();
        }
        self.inner.stop_writer.notify_one();
        self.inner.writer.borrow_mut().take();
        if let Some(mut child) = self.inner.child.borrow_mut().take() {
            let _ = child.start_kill();
        }
        self.inner.closed.notify_waiters();
    }

    /// Resolves once the manager has stopped (locally or by peer disconnect).
    pub async fn closed(&self) {
        while self.inner.live.get() {
            self.inner.closed.notified().await;
        }
    }

    /// Pending outbound calls still waiting for a reply.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    pub fn method_count(&self) -> usize {
        self.inner.methods.borrow().len()
    }
}

fn enqueue(inner: &ManagerInner, message: Message) {
    if inner.outgoing.send(message).is_err() {
        tracing::debug!(name = %inner.name, "dropping message for closed writer");
    }
}

/// Read frames, route them to the event channel, and stop the manager when
/// the socket reaches a terminal state.
async fn reader_task<R>(
    mut reader: FrameReader<R>,
    channel: Rc<EventChannel>,
    inner: Weak<ManagerInner>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => match message.as_list().and_then(|items| {
                items
                    .first()
                    .and_then(Sexp::as_sym)
                    .map(|head| (head.to_owned(), items[1..].to_vec()))
            }) {
                Some((event, args)) => {
                    if channel.send(&event, args) == 0 {
                        tracing::warn!(channel = channel.name(), %event, "unhandled event");
                    }
                }
                None => {
                    tracing::warn!(channel = channel.name(), "ignoring non-event payload");
                }
            },
            Ok(None) => break,
            Err(e) if e.is_fatal() => {
                tracing::warn!(channel = channel.name(), error = %e, "closing connection on framing error");
                break;
            }
            Err(e) => {
                tracing::warn!(channel = channel.name(), error = %e, "skipping malformed frame");
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        EpcManager { inner }.stop();
    }
}

/// Drain the outgoing queue onto the socket; on stop, flush what is already
/// queued within the grace period.
async fn writer_task<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: UnboundedReceiver<Message>,
    stop: Rc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = writer.write_message(&message).await {
                        tracing::warn!(error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = stop.notified() => {
                outgoing.close();
                let drain = async {
                    while let Some(message) = outgoing.recv().await {
                        if writer.write_message(&message).await.is_err() {
                            break;
                        }
                    }
                };
                let _ = tokio::time::timeout(PENDING_OUTPUT_GRACE, drain).await;
                break;
            }
        }
    }
}

/// Wire the five message-kind handlers onto the channel.
///
/// Handlers hold a weak reference back to the manager: the channel lives
/// inside the manager, so a strong reference here would leak the pair.
fn init_handlers(inner: &Rc<ManagerInner>) {
    let kinds: [(&str, fn(&Rc<ManagerInner>, Message)); 5] = [
        (events::CALL, handle_call),
        (events::RETURN, handle_return),
        (events::RETURN_ERROR, handle_return_error),
        (events::EPC_ERROR, handle_epc_error),
        (events::METHODS, handle_methods),
    ];
    for (event, handler) in kinds {
        let weak = Rc::downgrade(inner);
        inner.channel.connect_with(event, move |payload| {
            if let Some(inner) = weak.upgrade() {
                match Message::from_sexp(&payload) {
                    Ok(message) => handler(&inner, message),
                    Err(e) => {
                        tracing::warn!(name = %inner.name, error = %e, "dropping malformed message")
                    }
                }
            }
            Ok(Step::Value(Sexp::Nil))
        });
    }
}

fn handle_call(inner: &Rc<ManagerInner>, message: Message) {
    let Message::Call { uid, method, args } = message else {
        return;
    };
    let task = inner
        .methods
        .borrow()
        .iter()
        .find(|m| m.name == method)
        .map(|m| m.task.clone());
    let Some(task) = task else {
        tracing::warn!(name = %inner.name, %method, "call for unknown method");
        enqueue(
            inner,
            Message::EpcError {
                uid,
                error: Sexp::string(format!("EPC-ERROR: No such method : {method}")),
            },
        );
        return;
    };

    match task(args.clone()) {
        Ok(MethodOutcome::Value(value)) => enqueue(inner, Message::Return { uid, value }),
        Ok(MethodOutcome::Deferred(deferred)) => {
            let tail = {
                let weak = Rc::downgrade(inner);
                deferred.then(move |value| {
                    if let Some(inner) = weak.upgrade() {
                        enqueue(&inner, Message::Return { uid, value });
                    }
                    Ok(Step::Value(Sexp::Nil))
                })
            };
            let weak = Rc::downgrade(inner);
            tail.catch(move |error| {
                if let Some(inner) = weak.upgrade() {
                    enqueue(
                        &inner,
                        Message::ReturnError {
                            uid,
                            error: Sexp::string(task_failure(&method, &args, &error.to_string())),
                        },
                    );
                }
                Ok(Step::Value(Sexp::Nil))
            });
        }
        Err(error) => enqueue(
            inner,
            Message::ReturnError {
                uid,
                error: Sexp::string(task_failure(&method, &args, &error)),
            },
        ),
    }
}

fn task_failure(method: &str, args: &[Sexp], error: &str) -> String {
    format!(
        "FAILED in {method}: {} with ERROR: {}",
        Sexp::list(args.to_vec()),
        Sexp::string(error)
    )
}

fn handle_return(inner: &Rc<ManagerInner>, message: Message) {
    let Message::Return { uid, value } = message else {
        return;
    };
    if let Some(deferred) = claim_session(inner, uid, events::RETURN) {
        deferred.post_resolve(value);
    }
}

fn handle_return_error(inner: &Rc<ManagerInner>, message: Message) {
    let Message::ReturnError { uid, error } = message else {
        return;
    };
    if let Some(deferred) = claim_session(inner, uid, events::RETURN_ERROR) {
        deferred.post_reject(EpcError::Application(render_error(&error)));
    }
}

fn handle_epc_error(inner: &Rc<ManagerInner>, message: Message) {
    let Message::EpcError { uid, error } = message else {
        return;
    };
    if let Some(deferred) = claim_session(inner, uid, events::EPC_ERROR) {
        deferred.post_reject(EpcError::Protocol(render_error(&error)));
    }
}

fn handle_methods(inner: &Rc<ManagerInner>, message: Message) {
    let Message::Methods { uid } = message else {
        return;
    };
    let value = Sexp::list(
        inner
            .methods
            .borrow()
            .iter()
            .map(Method::describe)
            .collect(),
    );
    enqueue(inner, Message::Return { uid, value });
}

/// Look up and remove the session a reply belongs to.
///
/// A reply with no session (a late answer to a cancelled-and-reaped or
/// unknown call) and a reply whose session was cancelled are both logged and
/// discarded; the cancelled entry stays in the table until its reply arrives,
/// which is what reaps it.
fn claim_session(inner: &ManagerInner, uid: u64, event: &str) -> Option<Deferred> {
    match take_session(inner, uid) {
        None => {
            tracing::warn!(name = %inner.name, uid, event, "reply for unknown session");
            None
        }
        Some(deferred) if deferred.is_cancelled() => {
            tracing::warn!(name = %inner.name, uid, event, "reply for cancelled session");
            None
        }
        Some(deferred) => Some(deferred),
    }
}

fn take_session(inner: &ManagerInner, uid: u64) -> Option<Deferred> {
    let mut sessions = inner.sessions.borrow_mut();
    let index = sessions.iter().position(|(id, _)| *id == uid)?;
    Some(sessions.remove(index).1)
}

/// A string payload renders as its contents; anything else as printed text.
fn render_error(error: &Sexp) -> String {
    match error {
        Sexp::Str(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Thread-local registry of live managers, mirroring the connection list the
/// tooling around this protocol traditionally exposes.
mod live {
    use super::EpcManager;
    use std::cell::RefCell;
    use std::rc::Rc;

    thread_local! {
        static LIVE: RefCell<Vec<EpcManager>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn register(manager: &EpcManager) {
        LIVE.with(|live| live.borrow_mut().push(manager.clone()));
    }

    pub(super) fn unregister(manager: &EpcManager) {
        LIVE.with(|live| {
            live.borrow_mut()
                .retain(|m| !Rc::ptr_eq(&m.inner, &manager.inner))
        });
    }

    /// All managers that have been started and not yet stopped.
    pub fn live_managers() -> Vec<EpcManager> {
        LIVE.with(|live| live.borrow().clone())
    }
}

pub use live::live_managers;
