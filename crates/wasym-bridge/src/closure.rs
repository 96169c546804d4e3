//! Closure adapter
//!
//! Module closures are identified by a pair of opaque state words plus an
//! index into the module's destructor table. The adapter wraps them into
//! host-callable functions with reference-counted lifetime: the live count
//! starts at one, is held high around every invocation, and the destructor
//! runs exactly once when the count reaches zero.
//!
//! `state_a` is captured and zeroed for the duration of a call so a
//! re-entrant invocation cannot race the destructor mid-call; it is restored
//! afterwards unless the call was the last reference.
//!
//! Dropping the last host reference without an explicit release runs the
//! destructor from `Drop` as a safety net. That path is best-effort: it can
//! run late, and not at all if the bridge context is already gone. Explicit
//! release remains the primary contract.

use crate::context::BridgeContext;
use crate::engine::ModuleTrap;
use crate::value::{HostError, HostFn, HostFunction, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// How many marshalled arguments the module closure entry takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureArity {
    One,
    Two,
}

/// Lifetime state of one wrapped module closure.
pub struct ClosureState {
    state_a: Mutex<u32>,
    state_b: u32,
    destructor: u32,
    live: AtomicU32,
    dead: AtomicBool,
    context: Weak<BridgeContext>,
}

impl ClosureState {
    pub fn live_count(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Release the module's base reference (the `callback_drop` protocol).
    ///
    /// Returns true when this was the last reference: the state is marked
    /// dead, `state_a` is zeroed, and the module frees its side. With
    /// invocations still in flight this returns false and the in-flight
    /// bookkeeping runs the destructor later.
    pub(crate) fn release_reference(&self) -> bool {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.dead.store(true, Ordering::SeqCst);
            *self.state_a.lock().expect("closure state lock poisoned") = 0;
            true
        } else {
            false
        }
    }
}

impl Drop for ClosureState {
    fn drop(&mut self) {
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        // Best-effort finalizer: the module never explicitly dropped this
        // closure, so release its state now if the bridge still exists.
        if let Some(context) = self.context.upgrade() {
            if let Ok(instance) = context.instance() {
                let state_a = *self.state_a.lock().expect("closure state lock poisoned");
                tracing::trace!(
                    destructor = self.destructor,
                    "releasing undropped module closure"
                );
                let _ = instance.run_destructor(self.destructor, state_a, self.state_b);
            }
        }
    }
}

impl std::fmt::Debug for ClosureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureState")
            .field("state_b", &self.state_b)
            .field("destructor", &self.destructor)
            .field("live", &self.live_count())
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// Wrap a module closure into a host-callable function value.
pub fn make_closure(
    context: &Arc<BridgeContext>,
    state_a: u32,
    state_b: u32,
    destructor: u32,
    arity: ClosureArity,
) -> HostFunction {
    let state = Arc::new(ClosureState {
        state_a: Mutex::new(state_a),
        state_b,
        destructor,
        live: AtomicU32::new(1),
        dead: AtomicBool::new(false),
        context: Arc::downgrade(context),
    });
    let call_state = state.clone();
    let f: HostFn = Arc::new(move |args: &[Value]| invoke(&call_state, arity, args));
    HostFunction::with_origin(f, state)
}

fn invoke(
    state: &Arc<ClosureState>,
    arity: ClosureArity,
    args: &[Value],
) -> Result<Value, HostError> {
    if state.dead.load(Ordering::SeqCst) {
        return Err(HostError::Trap(ModuleTrap::new(
            "module closure invoked after destruction",
        )));
    }
    let context = state
        .context
        .upgrade()
        .ok_or_else(|| HostError::Trap(ModuleTrap::new("bridge context is gone")))?;
    let instance = context.instance().map_err(HostError::Trap)?;

    state.live.fetch_add(1, Ordering::SeqCst);
    let state_a = {
        let mut guard = state.state_a.lock().expect("closure state lock poisoned");
        std::mem::replace(&mut *guard, 0)
    };

    let result = match arity {
        ClosureArity::One => {
            let arg = context.alloc_value(args.first().cloned().unwrap_or(Value::Undefined));
            instance.invoke_closure1(state_a, state.state_b, arg.0)
        }
        ClosureArity::Two => {
            let arg0 = context.alloc_value(args.first().cloned().unwrap_or(Value::Undefined));
            let arg1 = context.alloc_value(args.get(1).cloned().unwrap_or(Value::Undefined));
            instance.invoke_closure2(state_a, state.state_b, arg0.0, arg1.0)
        }
    };

    // Runs whether the invocation succeeded or trapped.
    if state.live.fetch_sub(1, Ordering::SeqCst) == 1 {
        state.dead.store(true, Ordering::SeqCst);
        let _ = instance.run_destructor(state.destructor, state_a, state.state_b);
    } else {
        *state.state_a.lock().expect("closure state lock poisoned") = state_a;
    }

    result.map(|_| Value::Undefined).map_err(HostError::Trap)
}
