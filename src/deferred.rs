//! Deferred chains and the tick worker.
//!
//! A [`Deferred`] is a single-assignment continuation cell with separate
//! success (`ok`) and failure (`ng`) paths. Chains are built with
//! [`Deferred::then`] and [`Deferred::catch`]; each node holds at most one
//! forward link. A transform may return [`Step::Nested`] to splice another
//! deferred in front of the rest of the chain.
//!
//! Execution is cooperative: when a node with a transform produces a value
//! for its successor, the hand-off goes through a thread-local FIFO queue
//! drained by the tick worker, one entry per tick. That keeps long chains
//! from building deep call stacks and isolates each step's failure. A node
//! *without* a transform forwards its signal to the successor immediately,
//! on the same path it arrived on.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::error::EpcError;
use crate::runtime;
use crate::sexp::Sexp;

/// Delay between tick worker steps.
pub const TICK: Duration = Duration::from_millis(1);

/// Upper bound on one wait-loop iteration in [`Deferred::wait`].
const WAIT_POLL: Duration = Duration::from_millis(150);

/// What a transform hands to the rest of the chain.
pub enum Step {
    /// A plain value, passed to the next node.
    Value(Sexp),
    /// A nested deferred; the chain tail re-attaches behind it and continues
    /// once it resolves.
    Nested(Deferred),
}

impl From<Sexp> for Step {
    fn from(value: Sexp) -> Step {
        Step::Value(value)
    }
}

type OkTransform = Rc<dyn Fn(Sexp) -> Result<Step, EpcError>>;
type NgTransform = Rc<dyn Fn(EpcError) -> Result<Step, EpcError>>;

#[derive(Clone)]
enum Signal {
    Ok(Sexp),
    Ng(EpcError),
}

struct Node {
    on_ok: Option<OkTransform>,
    on_ng: Option<NgTransform>,
    next: Option<Deferred>,
    settled: Option<Signal>,
    cancelled: bool,
}

/// A continuation cell. Cloning clones the handle, not the node.
#[derive(Clone)]
pub struct Deferred {
    cell: Rc<RefCell<Node>>,
}

impl Default for Deferred {
    fn default() -> Self {
        Deferred::new()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.cell.borrow();
        let status = match &node.settled {
            None => "pending",
            Some(Signal::Ok(_)) => "ok",
            Some(Signal::Ng(_)) => "ng",
        };
        f.debug_struct("Deferred")
            .field("status", &status)
            .field("chained", &node.next.is_some())
            .finish()
    }
}

impl Deferred {
    /// A cell with no transforms: signals pass straight through.
    pub fn new() -> Deferred {
        Deferred::build(None, None)
    }

    /// A cell with a success transform.
    pub fn with_callback(f: impl Fn(Sexp) -> Result<Step, EpcError> + 'static) -> Deferred {
        Deferred::build(Some(Rc::new(f)), None)
    }

    /// A cell with a failure transform.
    pub fn with_errorback(f: impl Fn(EpcError) -> Result<Step, EpcError> + 'static) -> Deferred {
        Deferred::build(None, Some(Rc::new(f)))
    }

    fn build(on_ok: Option<OkTransform>, on_ng: Option<NgTransform>) -> Deferred {
        Deferred {
            cell: Rc::new(RefCell::new(Node {
                on_ok,
                on_ng,
                next: None,
                settled: None,
                cancelled: false,
            })),
        }
    }

    /// Chain a success transform; returns the new tail.
    ///
    /// Installing a continuation replaces any previously installed one; a
    /// node holds at most one forward link. Attaching to an already-settled
    /// node replays the stored outcome into the new tail.
    pub fn then(&self, f: impl Fn(Sexp) -> Result<Step, EpcError> + 'static) -> Deferred {
        let tail = Deferred::with_callback(f);
        set_next(self, &tail);
        tail
    }

    /// Chain a failure transform; returns the new tail.
    ///
    /// The transform may recover by returning a `Step`, or re-fail by
    /// returning `Err`. Success values pass through it untouched.
    pub fn catch(&self, f: impl Fn(EpcError) -> Result<Step, EpcError> + 'static) -> Deferred {
        let tail = Deferred::with_errorback(f);
        set_next(self, &tail);
        tail
    }

    /// Run the ok path now, synchronously.
    pub fn resolve(&self, value: Sexp) {
        exec(self, Signal::Ok(value));
    }

    /// Run the ng path now, synchronously.
    pub fn reject(&self, error: EpcError) {
        exec(self, Signal::Ng(error));
    }

    /// Queue the ok path for the tick worker.
    pub fn post_resolve(&self, value: Sexp) {
        post(self.clone(), Signal::Ok(value));
    }

    /// Queue the ng path for the tick worker.
    pub fn post_reject(&self, error: EpcError) {
        post(self.clone(), Signal::Ng(error));
    }

    /// Drop transforms and the forward link; signals pass through to nobody.
    ///
    /// Also marks the cell cancelled, which the connection layer uses to
    /// discard a late reply addressed to it.
    pub fn cancel(&self) {
        let mut node = self.cell.borrow_mut();
        node.on_ok = None;
        node.on_ng = None;
        node.next = None;
        node.cancelled = true;
    }

    /// True once [`Deferred::cancel`] has run.
    pub fn is_cancelled(&self) -> bool {
        self.cell.borrow().cancelled
    }

    /// The stored outcome, if this node settled with no continuation.
    pub fn settled(&self) -> Option<Result<Sexp, EpcError>> {
        match &self.cell.borrow().settled {
            None => None,
            Some(Signal::Ok(value)) => Some(Ok(value.clone())),
            Some(Signal::Ng(error)) => Some(Err(error.clone())),
        }
    }

    /// Await the chain's outcome.
    ///
    /// Installs a terminal observer behind this node (replacing any other
    /// continuation) and waits cooperatively, re-checking at least every
    /// 150 ms. The observer absorbs the error path, so a failure surfaces
    /// here and nowhere else.
    pub async fn wait(&self) -> Result<Sexp, EpcError> {
        let outcome: Rc<RefCell<Option<Result<Sexp, EpcError>>>> = Rc::new(RefCell::new(None));
        let ready = Rc::new(Notify::new());

        let tail = {
            let outcome = outcome.clone();
            let ready = ready.clone();
            self.then(move |value| {
                *outcome.borrow_mut() = Some(Ok(value.clone()));
                ready.notify_one();
                Ok(Step::Value(value))
            })
        };
        {
            let outcome = outcome.clone();
            let ready = ready.clone();
            tail.catch(move |error| {
                *outcome.borrow_mut() = Some(Err(error));
                ready.notify_one();
                Ok(Step::Value(Sexp::Nil))
            });
        }

        loop {
            if let Some(result) = outcome.borrow_mut().take() {
                return result;
            }
            let _ = timeout(WAIT_POLL, ready.notified()).await;
        }
    }
}

/// Link `next` behind `prev`. If `prev` already settled, clear the stored
/// outcome and replay it into `next` immediately.
pub(crate) fn set_next(prev: &Deferred, next: &Deferred) {
    let replay = {
        let mut node = prev.cell.borrow_mut();
        node.next = Some(next.clone());
        node.settled.take()
    };
    if let Some(signal) = replay {
        exec(next, signal);
    }
}

/// The execution rule: run `d`'s transform for the signal's path, then route
/// the result.
fn exec(d: &Deferred, signal: Signal) {
    match signal {
        Signal::Ok(value) => {
            let transform = d.cell.borrow().on_ok.clone();
            match transform {
                Some(f) => route(d, f(value)),
                None => pass_through(d, Signal::Ok(value)),
            }
        }
        Signal::Ng(error) => {
            let transform = d.cell.borrow().on_ng.clone();
            match transform {
                Some(f) => route(d, f(error)),
                None => pass_through(d, Signal::Ng(error)),
            }
        }
    }
}

/// No transform on this edge: forward the signal unchanged, immediately.
fn pass_through(d: &Deferred, signal: Signal) {
    let next = d.cell.borrow().next.clone();
    match next {
        Some(next) => exec(&next, signal),
        None => record(d, signal),
    }
}

/// Route a transform's result onward. Plain values and errors are *posted*
/// to the successor rather than executed inline; a nested deferred takes
/// over the chain tail and leaves this node unsettled.
fn route(d: &Deferred, result: Result<Step, EpcError>) {
    match result {
        Ok(Step::Nested(nested)) => {
            let next = d.cell.borrow().next.clone();
            if let Some(next) = next {
                set_next(&nested, &next);
            }
        }
        Ok(Step::Value(value)) => {
            let next = d.cell.borrow().next.clone();
            match next {
                Some(next) => post(next, Signal::Ok(value)),
                None => record(d, Signal::Ok(value)),
            }
        }
        Err(error) => {
            let next = d.cell.borrow().next.clone();
            match next {
                Some(next) => post(next, Signal::Ng(error)),
                None => record(d, Signal::Ng(error)),
            }
        }
    }
}

/// Terminal: store the outcome on the node. An unobserved failure is logged,
/// never re-raised out of the worker.
fn record(d: &Deferred, signal: Signal) {
    if let Signal::Ng(error) = &signal {
        tracing::error!(%error, "deferred error");
    }
    d.cell.borrow_mut().settled = Some(signal);
}

struct Queue {
    entries: VecDeque<(Deferred, Signal)>,
    worker_armed: bool,
}

thread_local! {
    static QUEUE: RefCell<Queue> = RefCell::new(Queue {
        entries: VecDeque::new(),
        worker_armed: false,
    });
}

fn post(d: Deferred, signal: Signal) {
    let arm = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.entries.push_back((d, signal));
        !std::mem::replace(&mut queue.worker_armed, true)
    });
    if arm {
        runtime::spawn(worker());
    }
}

/// Disarm on drop so an aborted runtime leaves the queue schedulable.
struct Disarm;

impl Drop for Disarm {
    fn drop(&mut self) {
        let _ = QUEUE.try_with(|queue| queue.borrow_mut().worker_armed = false);
    }
}

/// One queue entry per tick; re-arms while entries remain.
async fn worker() {
    let _disarm = Disarm;
    loop {
        sleep(TICK).await;
        let entry = QUEUE.with(|queue| queue.borrow_mut().entries.pop_front());
        if let Some((d, signal)) = entry {
            exec(&d, signal);
        }
        let drained = QUEUE.with(|queue| queue.borrow().entries.is_empty());
        if drained {
            break;
        }
    }
}
