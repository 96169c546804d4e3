//! Promises and the cooperative scheduler
//!
//! Host promises mirror what module code expects from a promise-shaped
//! value: pending until settled, settled exactly once, continuations run as
//! microtasks in FIFO order, never inline with the settle.
//!
//! The scheduler owns the microtask queue and the pool of pending host
//! tasks (helper futures). Everything runs on one logical turn sequence:
//! entry points drain microtasks, and only suspend while awaiting the next
//! host task completion.

use crate::error::BridgeError;
use crate::value::{HostError, HostFunction, Value};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, Stream};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Poll;

/// A queued unit of continuation work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct SchedulerInner {
    microtasks: Mutex<VecDeque<Job>>,
    host_tasks: Mutex<FuturesUnordered<BoxFuture<'static, ()>>>,
}

/// Microtask queue plus pending host-task pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                microtasks: Mutex::new(VecDeque::new()),
                host_tasks: Mutex::new(FuturesUnordered::new()),
            }),
        }
    }

    /// Queue a job behind all currently queued jobs.
    pub fn enqueue_microtask(&self, job: Job) {
        self.inner
            .microtasks
            .lock()
            .expect("microtask queue lock poisoned")
            .push_back(job);
    }

    /// Hand a host future (helper work) to the scheduler. It is polled by
    /// whichever entry point is currently driving.
    pub fn spawn_host_task(&self, task: BoxFuture<'static, ()>) {
        self.inner
            .host_tasks
            .lock()
            .expect("host task pool lock poisoned")
            .push(task);
    }

    /// Run queued microtasks to exhaustion, including ones queued while
    /// draining. Returns the number of jobs run.
    pub fn run_microtasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self
                .inner
                .microtasks
                .lock()
                .expect("microtask queue lock poisoned")
                .pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending_host_tasks(&self) -> usize {
        self.inner
            .host_tasks
            .lock()
            .expect("host task pool lock poisoned")
            .len()
    }

    /// Await the next host task completion. Returns false when the pool is
    /// empty, meaning nothing external is outstanding.
    async fn next_host_task(&self) -> bool {
        futures_util::future::poll_fn(|cx| {
            let mut pool = self
                .inner
                .host_tasks
                .lock()
                .expect("host task pool lock poisoned");
            match Pin::new(&mut *pool).poll_next(cx) {
                Poll::Ready(Some(())) => Poll::Ready(true),
                Poll::Ready(None) => Poll::Ready(false),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    /// Drive until `promise` settles: drain microtasks, then await host
    /// task completions that unblock further microtasks.
    ///
    /// A pending promise with no queued microtasks and no outstanding host
    /// tasks can never settle; that is reported as `BridgeError::Stalled`
    /// instead of hanging.
    pub async fn drive(&self, promise: &Promise) -> Result<Settled, BridgeError> {
        loop {
            self.run_microtasks();
            match promise.state() {
                PromiseState::Resolved(value) => return Ok(Settled::Resolved(value)),
                PromiseState::Rejected(error) => return Ok(Settled::Rejected(error)),
                PromiseState::Pending => {}
            }
            if !self.next_host_task().await {
                return Err(BridgeError::Stalled(
                    "result promise is pending with no outstanding host work".to_string(),
                ));
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scheduler(host_tasks={})", self.pending_host_tasks())
    }
}

/// Observable promise state.
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Resolved(Value),
    Rejected(Value),
}

/// A settled outcome, as returned by `Scheduler::drive`.
#[derive(Debug, Clone)]
pub enum Settled {
    Resolved(Value),
    Rejected(Value),
}

struct Reaction {
    on_resolved: Option<HostFunction>,
    on_rejected: Option<HostFunction>,
    next: Promise,
}

struct PromiseInner {
    state: PromiseState,
    reactions: Vec<Reaction>,
}

/// A promise-shaped host value.
///
/// Clones share state. Settling is exactly-once: the second resolve or
/// reject has no observable effect.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<PromiseInner>>,
    scheduler: Scheduler,
}

impl Promise {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner {
                state: PromiseState::Pending,
                reactions: Vec::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    pub fn resolved(scheduler: &Scheduler, value: Value) -> Self {
        let promise = Self::new(scheduler);
        promise.resolve(value);
        promise
    }

    pub fn rejected(scheduler: &Scheduler, error: Value) -> Self {
        let promise = Self::new(scheduler);
        promise.reject(error);
        promise
    }

    /// Promise-resolution of an arbitrary value: promises pass through,
    /// everything else becomes an already-resolved promise.
    pub fn from_value(scheduler: &Scheduler, value: Value) -> Self {
        match value {
            Value::Promise(p) => p,
            other => Self::resolved(scheduler, other),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> PromiseState {
        self.inner.lock().expect("promise lock poisoned").state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state(), PromiseState::Pending)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve with a value. Resolving with another promise adopts its
    /// eventual outcome. No-op once settled.
    pub fn resolve(&self, value: Value) {
        if let Value::Promise(other) = &value {
            if other.ptr_eq(self) {
                self.reject(Value::error("TypeError", "promise resolved with itself"));
                return;
            }
            other.push_reaction(Reaction {
                on_resolved: None,
                on_rejected: None,
                next: self.clone(),
            });
            return;
        }
        self.settle(Settled::Resolved(value));
    }

    /// Reject with an error value. No-op once settled.
    pub fn reject(&self, error: Value) {
        self.settle(Settled::Rejected(error));
    }

    /// Register continuations, returning the chained promise.
    pub fn then(
        &self,
        on_resolved: Option<HostFunction>,
        on_rejected: Option<HostFunction>,
    ) -> Promise {
        let next = Promise::new(&self.scheduler);
        self.push_reaction(Reaction {
            on_resolved,
            on_rejected,
            next: next.clone(),
        });
        next
    }

    fn settle(&self, outcome: Settled) {
        let reactions = {
            let mut inner = self.inner.lock().expect("promise lock poisoned");
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = match &outcome {
                Settled::Resolved(v) => PromiseState::Resolved(v.clone()),
                Settled::Rejected(e) => PromiseState::Rejected(e.clone()),
            };
            std::mem::take(&mut inner.reactions)
        };
        for reaction in reactions {
            self.schedule_reaction(reaction, outcome.clone());
        }
    }

    fn push_reaction(&self, reaction: Reaction) {
        let settled = {
            let mut inner = self.inner.lock().expect("promise lock poisoned");
            match &inner.state {
                PromiseState::Pending => {
                    inner.reactions.push(reaction);
                    return;
                }
                PromiseState::Resolved(v) => Settled::Resolved(v.clone()),
                PromiseState::Rejected(e) => Settled::Rejected(e.clone()),
            }
        };
        self.schedule_reaction(reaction, settled);
    }

    fn schedule_reaction(&self, reaction: Reaction, outcome: Settled) {
        self.scheduler.enqueue_microtask(Box::new(move || {
            let (handler, value, next) = match outcome {
                Settled::Resolved(value) => (reaction.on_resolved, value, reaction.next),
                Settled::Rejected(error) => {
                    match reaction.on_rejected {
                        Some(handler) => (Some(handler), error, reaction.next),
                        // No rejection handler: the error propagates.
                        None => {
                            reaction.next.reject(error);
                            return;
                        }
                    }
                }
            };
            match handler {
                Some(handler) => match handler.call(&[value]) {
                    Ok(result) => next.resolve(result),
                    Err(HostError::Exception(error)) => next.reject(error),
                    Err(HostError::Trap(trap)) => {
                        next.reject(Value::error("ModuleTrap", trap.message))
                    }
                },
                None => next.resolve(value),
            }
        }));
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state() {
            PromiseState::Pending => "pending",
            PromiseState::Resolved(_) => "resolved",
            PromiseState::Rejected(_) => "rejected",
        };
        write!(f, "Promise({state})")
    }
}
