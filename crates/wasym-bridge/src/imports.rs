//! Host import surface
//!
//! The fixed catalogue of host operations the module is allowed to call,
//! wired as its import table at instantiation. Every import validates its
//! inputs and either returns a result over the abstract ABI or signals a
//! host-side exception back into the module's error channel.
//!
//! Error policy: a host exception raised while servicing an import is
//! caught, stashed in the module's exception slot by handle, and reported
//! with a sentinel return value. Host exceptions never unwind into module
//! code. Heap protocol violations and other module-side bugs trap the
//! current call instead.

use crate::closure::{make_closure, ClosureArity};
use crate::codec::CodecError;
use crate::context::BridgeContext;
use crate::engine::{AbiArgs, AbiValue, ImportTable, ModuleTrap};
use crate::helper::{CandidateInfo, FileHandle, HelperError, SymbolicationHelper};
use crate::memory::{MemoryError, MemoryView, ViewKind};
use crate::promise::Promise;
use crate::value::{HostError, HostFunction, Value};
use std::sync::Arc;

fn codec_trap(err: CodecError) -> ModuleTrap {
    match err {
        CodecError::Trap(trap) => trap,
        other => ModuleTrap::new(other.to_string()),
    }
}

fn mem_trap(err: MemoryError) -> ModuleTrap {
    ModuleTrap::new(err.to_string())
}

fn helper_exception(err: HelperError) -> HostError {
    HostError::exception("Error", err.to_string())
}

fn expect_function(value: Value) -> Result<HostFunction, HostError> {
    match value {
        Value::Function(f) => Ok(f),
        other => Err(HostError::exception(
            "TypeError",
            format!("{} is not a function", other.type_name()),
        )),
    }
}

fn expect_helper(value: Value) -> Result<Arc<dyn SymbolicationHelper>, HostError> {
    match value {
        Value::Helper(helper) => Ok(helper),
        other => Err(HostError::exception(
            "TypeError",
            format!("{} is not a helper", other.type_name()),
        )),
    }
}

fn expect_file(value: Value) -> Result<Arc<dyn FileHandle>, HostError> {
    match value {
        Value::File(file) => Ok(file),
        other => Err(HostError::exception(
            "TypeError",
            format!("{} is not a file handle", other.type_name()),
        )),
    }
}

/// Read the module-built info object into the typed helper argument.
fn candidate_info(value: Value) -> Result<CandidateInfo, HostError> {
    let Value::Object(map) = value else {
        return Err(HostError::exception(
            "TypeError",
            "candidate info must be an object",
        ));
    };
    let field = |key: &str| -> Result<String, HostError> {
        match map.with(|m| m.get(key).cloned()) {
            Some(Value::String(s)) => Ok(s.to_string()),
            _ => Err(HostError::exception(
                "TypeError",
                format!("candidate info is missing string field {key}"),
            )),
        }
    };
    Ok(CandidateInfo {
        debug_name: field("debugName")?,
        breakpad_id: field("breakpadId")?,
    })
}

fn paths_value(paths: Vec<String>) -> Value {
    Value::array(paths.into_iter().map(Value::string).collect())
}

fn probe_global(
    ctx: &Arc<BridgeContext>,
    name: &str,
    value: Option<Value>,
) -> Result<AbiValue, HostError> {
    match value {
        Some(value) => Ok(AbiValue::U32(ctx.alloc_value(value).0)),
        None => Err(HostError::exception(
            "ReferenceError",
            format!("{name} is not defined"),
        )),
    }
}

fn register(
    table: &mut ImportTable,
    context: &Arc<BridgeContext>,
    name: &'static str,
    f: impl Fn(&Arc<BridgeContext>, &[AbiValue]) -> Result<AbiValue, ModuleTrap>
        + Send
        + Sync
        + 'static,
) {
    let ctx = context.clone();
    table.register(name, move |args| f(&ctx, args));
}

/// Register an import with the catch-and-stash error protocol.
fn register_catching(
    table: &mut ImportTable,
    context: &Arc<BridgeContext>,
    name: &'static str,
    f: impl Fn(&Arc<BridgeContext>, &[AbiValue]) -> Result<AbiValue, HostError>
        + Send
        + Sync
        + 'static,
) {
    let ctx = context.clone();
    table.register(name, move |args| match f(&ctx, args) {
        Ok(value) => Ok(value),
        Err(HostError::Exception(exception)) => {
            ctx.stash_exception(exception)?;
            Ok(AbiValue::U32(0))
        }
        Err(HostError::Trap(trap)) => Err(trap),
    });
}

/// Build the full import catalogue over the given bridge state.
pub fn build_import_table(context: &Arc<BridgeContext>) -> ImportTable {
    let mut table = ImportTable::new();
    let t = &mut table;

    // Object heap protocol.
    register(t, context, "object_drop", |ctx, args| {
        ctx.take_value(args.u32_at(0)?)?;
        Ok(AbiValue::Unit)
    });
    register(t, context, "object_clone", |ctx, args| {
        Ok(AbiValue::U32(ctx.clone_value(args.u32_at(0)?)?.0))
    });
    register(t, context, "string_new", |ctx, args| {
        let accessor = ctx.accessor()?;
        let text = ctx
            .codec
            .decode(&accessor, args.u32_at(0)?, args.u32_at(1)?)
            .map_err(codec_trap)?;
        Ok(AbiValue::U32(ctx.alloc_value(Value::string(text)).0))
    });
    register(t, context, "string_get", |ctx, args| {
        let retptr = args.u32_at(0)?;
        let value = ctx.get_value(args.u32_at(1)?)?;
        let accessor = ctx.accessor()?;
        let (ptr, len) = match value {
            Value::String(s) => {
                let instance = ctx.instance()?;
                let ptr = ctx
                    .codec
                    .encode(&*instance, &accessor, &s)
                    .map_err(codec_trap)?;
                (ptr, ctx.codec.last_encoded_len())
            }
            // Pointer 0 signals "not a string" to the module.
            _ => (0, 0),
        };
        accessor.write_word(retptr, ptr).map_err(mem_trap)?;
        accessor.write_word(retptr + 4, len).map_err(mem_trap)?;
        Ok(AbiValue::Unit)
    });
    register(t, context, "is_undefined", |ctx, args| {
        Ok(AbiValue::U32(
            ctx.get_value(args.u32_at(0)?)?.is_undefined() as u32,
        ))
    });
    register(t, context, "is_function", |ctx, args| {
        Ok(AbiValue::U32(
            ctx.get_value(args.u32_at(0)?)?.is_function() as u32,
        ))
    });
    register(t, context, "callback_drop", |ctx, args| {
        let value = ctx.take_value(args.u32_at(0)?)?;
        let Value::Function(f) = value else {
            return Err(ModuleTrap::new("callback_drop on a non-function"));
        };
        let Some(state) = f.origin() else {
            return Err(ModuleTrap::new("callback_drop on a host function"));
        };
        Ok(AbiValue::U32(state.release_reference() as u32))
    });
    register(t, context, "throw", |ctx, args| {
        let accessor = ctx.accessor()?;
        let message = ctx
            .codec
            .decode(&accessor, args.u32_at(0)?, args.u32_at(1)?)
            .map_err(codec_trap)?;
        Err(ModuleTrap::new(message))
    });
    register(t, context, "memory", |ctx, _args| {
        let memory = ctx.instance()?.memory();
        Ok(AbiValue::U32(ctx.alloc_value(Value::Memory(memory)).0))
    });
    register(t, context, "buffer", |ctx, args| {
        match ctx.get_value(args.u32_at(0)?)? {
            Value::Memory(memory) => Ok(AbiValue::U32(ctx.alloc_value(Value::Memory(memory)).0)),
            other => Err(ModuleTrap::new(format!(
                "buffer of non-memory value {}",
                other.type_name()
            ))),
        }
    });

    // Environment lookup: ordered capability probes, first success wins on
    // the module side.
    register_catching(t, context, "global_self", |ctx, _args| {
        probe_global(ctx, "self", ctx.environment.self_object.clone())
    });
    register_catching(t, context, "global_window", |ctx, _args| {
        probe_global(ctx, "window", ctx.environment.window.clone())
    });
    register_catching(t, context, "global_explicit", |ctx, _args| {
        probe_global(ctx, "global", ctx.environment.explicit_global.clone())
    });
    register_catching(t, context, "global_this", |ctx, _args| {
        probe_global(ctx, "globalThis", ctx.environment.global_this.clone())
    });

    // Array construction and access.
    register(t, context, "array_of3", |ctx, args| {
        let a = ctx.get_value(args.u32_at(0)?)?;
        let b = ctx.get_value(args.u32_at(1)?)?;
        let c = ctx.get_value(args.u32_at(2)?)?;
        Ok(AbiValue::U32(ctx.alloc_value(Value::array(vec![a, b, c])).0))
    });
    register(t, context, "array_from", |ctx, args| {
        match ctx.get_value(args.u32_at(0)?)? {
            Value::Array(source) => {
                let copy = source.with(|v| v.clone());
                Ok(AbiValue::U32(ctx.alloc_value(Value::array(copy)).0))
            }
            other => Err(ModuleTrap::new(format!(
                "array_from expects an array, got {}",
                other.type_name()
            ))),
        }
    });
    register(t, context, "array_length", |ctx, args| {
        let value = ctx.get_value(args.u32_at(0)?)?;
        match value.length() {
            Some(len) => Ok(AbiValue::U32(len)),
            None => Err(ModuleTrap::new(format!(
                "length of non-array value {}",
                value.type_name()
            ))),
        }
    });
    register(t, context, "array_get", |ctx, args| {
        let index = args.u32_at(1)? as usize;
        match ctx.get_value(args.u32_at(0)?)? {
            Value::Array(source) => {
                let element = source.with(|v| v.get(index).cloned()).unwrap_or(Value::Undefined);
                Ok(AbiValue::U32(ctx.alloc_value(element).0))
            }
            other => Err(ModuleTrap::new(format!(
                "indexed access on non-array value {}",
                other.type_name()
            ))),
        }
    });

    // Typed-array views and owned copies.
    register(t, context, "byte_view_new", |ctx, args| {
        new_view(ctx, args, ViewKind::Byte)
    });
    register(t, context, "word_view_new", |ctx, args| {
        new_view(ctx, args, ViewKind::Word)
    });
    register(t, context, "byte_array_new", |ctx, args| {
        let value = match ctx.get_value(args.u32_at(0)?)? {
            Value::View(view) if view.kind() == ViewKind::Byte => {
                Value::ByteArray(crate::value::Shared::new(
                    view.snapshot_bytes().map_err(mem_trap)?,
                ))
            }
            Value::ByteArray(source) => {
                Value::ByteArray(crate::value::Shared::new(source.with(|v| v.clone())))
            }
            other => {
                return Err(ModuleTrap::new(format!(
                    "byte_array_new expects byte data, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(AbiValue::U32(ctx.alloc_value(value).0))
    });
    register(t, context, "word_array_new", |ctx, args| {
        let value = match ctx.get_value(args.u32_at(0)?)? {
            Value::View(view) if view.kind() == ViewKind::Word => {
                Value::WordArray(crate::value::Shared::new(
                    view.snapshot_words().map_err(mem_trap)?,
                ))
            }
            Value::WordArray(source) => {
                Value::WordArray(crate::value::Shared::new(source.with(|v| v.clone())))
            }
            other => {
                return Err(ModuleTrap::new(format!(
                    "word_array_new expects word data, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(AbiValue::U32(ctx.alloc_value(value).0))
    });

    // Property and call protocol.
    register(t, context, "object_new", |ctx, _args| {
        Ok(AbiValue::U32(ctx.alloc_value(Value::object()).0))
    });
    register(t, context, "object_get", |ctx, args| {
        let target = ctx.get_value(args.u32_at(0)?)?;
        let key = ctx.take_value(args.u32_at(1)?)?;
        let Value::String(key) = key else {
            return Err(ModuleTrap::new("property key must be a string"));
        };
        match target {
            Value::Object(map) => {
                let value = map.with(|m| m.get(&*key).cloned()).unwrap_or(Value::Undefined);
                Ok(AbiValue::U32(ctx.alloc_value(value).0))
            }
            other => Err(ModuleTrap::new(format!(
                "property get on non-object value {}",
                other.type_name()
            ))),
        }
    });
    register(t, context, "object_set", |ctx, args| {
        let target = ctx.get_value(args.u32_at(0)?)?;
        let key = ctx.take_value(args.u32_at(1)?)?;
        let value = ctx.take_value(args.u32_at(2)?)?;
        let Value::String(key) = key else {
            return Err(ModuleTrap::new("property key must be a string"));
        };
        match target {
            Value::Object(map) => {
                map.with_mut(|m| m.insert(key.to_string(), value));
                Ok(AbiValue::Unit)
            }
            other => Err(ModuleTrap::new(format!(
                "property set on non-object value {}",
                other.type_name()
            ))),
        }
    });
    register_catching(t, context, "call0", |ctx, args| {
        let f = expect_function(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        ctx.get_value(args.u32_at(1)?).map_err(HostError::Trap)?;
        let result = f.call(&[])?;
        Ok(AbiValue::U32(ctx.alloc_value(result).0))
    });
    register_catching(t, context, "call1", |ctx, args| {
        let f = expect_function(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        ctx.get_value(args.u32_at(1)?).map_err(HostError::Trap)?;
        let arg = ctx.get_value(args.u32_at(2)?).map_err(HostError::Trap)?;
        let result = f.call(&[arg])?;
        Ok(AbiValue::U32(ctx.alloc_value(result).0))
    });
    register_catching(t, context, "call2", |ctx, args| {
        let f = expect_function(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        ctx.get_value(args.u32_at(1)?).map_err(HostError::Trap)?;
        let arg0 = ctx.get_value(args.u32_at(2)?).map_err(HostError::Trap)?;
        let arg1 = ctx.get_value(args.u32_at(3)?).map_err(HostError::Trap)?;
        let result = f.call(&[arg0, arg1])?;
        Ok(AbiValue::U32(ctx.alloc_value(result).0))
    });

    // Promise interop.
    register(t, context, "promise_new", |ctx, args| {
        let promise = Promise::new(&ctx.scheduler);
        let resolve = {
            let p = promise.clone();
            HostFunction::new(move |args| {
                p.resolve(args.first().cloned().unwrap_or(Value::Undefined));
                Ok(Value::Undefined)
            })
        };
        let reject = {
            let p = promise.clone();
            HostFunction::new(move |args| {
                p.reject(args.first().cloned().unwrap_or(Value::Undefined));
                Ok(Value::Undefined)
            })
        };
        let resolve_handle = ctx.alloc_value(Value::Function(resolve));
        let reject_handle = ctx.alloc_value(Value::Function(reject));
        // The executor closure runs synchronously, exactly once.
        ctx.instance()?.invoke_closure2(
            args.u32_at(0)?,
            args.u32_at(1)?,
            resolve_handle.0,
            reject_handle.0,
        )?;
        Ok(AbiValue::U32(ctx.alloc_value(Value::Promise(promise)).0))
    });
    register(t, context, "promise_resolve", |ctx, args| {
        let value = ctx.get_value(args.u32_at(0)?)?;
        let promise = Promise::from_value(&ctx.scheduler, value);
        Ok(AbiValue::U32(ctx.alloc_value(Value::Promise(promise)).0))
    });
    register(t, context, "promise_then", |ctx, args| {
        let promise = expect_promise(ctx.get_value(args.u32_at(0)?)?)?;
        let on_resolved = expect_function(ctx.get_value(args.u32_at(1)?)?)
            .map_err(|_| ModuleTrap::new("then expects a callable continuation"))?;
        let chained = promise.then(Some(on_resolved), None);
        Ok(AbiValue::U32(ctx.alloc_value(Value::Promise(chained)).0))
    });
    register(t, context, "promise_then2", |ctx, args| {
        let promise = expect_promise(ctx.get_value(args.u32_at(0)?)?)?;
        let on_resolved = expect_function(ctx.get_value(args.u32_at(1)?)?)
            .map_err(|_| ModuleTrap::new("then expects a callable continuation"))?;
        let on_rejected = expect_function(ctx.get_value(args.u32_at(2)?)?)
            .map_err(|_| ModuleTrap::new("then expects a callable continuation"))?;
        let chained = promise.then(Some(on_resolved), Some(on_rejected));
        Ok(AbiValue::U32(ctx.alloc_value(Value::Promise(chained)).0))
    });

    // Closure wrapping.
    register(t, context, "closure_new", |ctx, args| {
        let f = make_closure(
            ctx,
            args.u32_at(0)?,
            args.u32_at(1)?,
            args.u32_at(2)?,
            ClosureArity::One,
        );
        Ok(AbiValue::U32(ctx.alloc_value(Value::Function(f)).0))
    });

    // Microtask scheduling.
    register(t, context, "queue_microtask", |ctx, args| {
        let f = match ctx.get_value(args.u32_at(0)?)? {
            Value::Function(f) => f,
            other => {
                return Err(ModuleTrap::new(format!(
                    "queue_microtask expects a function, got {}",
                    other.type_name()
                )))
            }
        };
        ctx.scheduler.enqueue_microtask(Box::new(move || {
            if let Err(err) = f.call(&[]) {
                tracing::debug!(?err, "queued microtask failed");
            }
        }));
        Ok(AbiValue::Unit)
    });
    register(t, context, "microtask_handler", |ctx, args| {
        // Property lookup of the host scheduling primitive on any target.
        ctx.get_value(args.u32_at(0)?)?;
        let scheduler = ctx.scheduler.clone();
        let f = HostFunction::new(move |args| {
            let Some(Value::Function(callback)) = args.first().cloned() else {
                return Err(HostError::exception(
                    "TypeError",
                    "queueMicrotask expects a function",
                ));
            };
            scheduler.enqueue_microtask(Box::new(move || {
                if let Err(err) = callback.call(&[]) {
                    tracing::debug!(?err, "queued microtask failed");
                }
            }));
            Ok(Value::Undefined)
        });
        Ok(AbiValue::U32(ctx.alloc_value(Value::Function(f)).0))
    });

    // Error introspection.
    register(t, context, "error_name", |ctx, args| {
        let value = match ctx.get_value(args.u32_at(0)?)? {
            Value::Error(e) => Value::string(e.name.clone()),
            _ => Value::Undefined,
        };
        Ok(AbiValue::U32(ctx.alloc_value(value).0))
    });
    register(t, context, "error_message", |ctx, args| {
        let value = match ctx.get_value(args.u32_at(0)?)? {
            Value::Error(e) => Value::string(e.message.clone()),
            _ => Value::Undefined,
        };
        Ok(AbiValue::U32(ctx.alloc_value(value).0))
    });

    // Domain callbacks: pass-throughs to the helper contract.
    register_catching(t, context, "candidate_paths_for_debug_file", |ctx, args| {
        let helper = expect_helper(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        let info = candidate_info(ctx.take_value(args.u32_at(1)?).map_err(HostError::Trap)?)?;
        let paths = helper
            .candidate_paths_for_debug_file(info)
            .map_err(helper_exception)?;
        Ok(AbiValue::U32(ctx.alloc_value(paths_value(paths)).0))
    });
    register_catching(t, context, "candidate_paths_for_binary", |ctx, args| {
        let helper = expect_helper(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        let info = candidate_info(ctx.take_value(args.u32_at(1)?).map_err(HostError::Trap)?)?;
        let paths = helper
            .candidate_paths_for_binary(info)
            .map_err(helper_exception)?;
        Ok(AbiValue::U32(ctx.alloc_value(paths_value(paths)).0))
    });
    register(t, context, "read_file", |ctx, args| {
        let helper = match ctx.get_value(args.u32_at(0)?)? {
            Value::Helper(helper) => helper,
            other => {
                return Err(ModuleTrap::new(format!(
                    "read_file on non-helper value {}",
                    other.type_name()
                )))
            }
        };
        let accessor = ctx.accessor()?;
        let filename = ctx
            .codec
            .decode(&accessor, args.u32_at(1)?, args.u32_at(2)?)
            .map_err(codec_trap)?;
        let promise = Promise::new(&ctx.scheduler);
        let settle = promise.clone();
        let future = helper.read_file(&filename);
        ctx.scheduler.spawn_host_task(Box::pin(async move {
            match future.await {
                Ok(file) => settle.resolve(Value::File(file)),
                Err(err) => settle.reject(Value::error("Error", err.to_string())),
            }
        }));
        Ok(AbiValue::U32(ctx.alloc_value(Value::Promise(promise)).0))
    });
    register_catching(t, context, "file_size", |ctx, args| {
        let file = expect_file(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        Ok(AbiValue::F64(file.size() as f64))
    });
    register_catching(t, context, "file_read_bytes_into", |ctx, args| {
        let file = expect_file(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        let view = match ctx.take_value(args.u32_at(1)?).map_err(HostError::Trap)? {
            Value::View(view) if view.kind() == ViewKind::Byte => view,
            other => {
                return Err(HostError::exception(
                    "TypeError",
                    format!("read target must be a byte view, got {}", other.type_name()),
                ))
            }
        };
        let offset = args.f64_at(2).map_err(HostError::Trap)? as u64;
        // The helper writes straight into module memory through the view.
        view.with_bytes_mut(|buffer| file.read_bytes_into(buffer, offset))
            .map_err(|e| HostError::Trap(mem_trap(e)))?
            .map_err(helper_exception)?;
        Ok(AbiValue::Unit)
    });
    register_catching(t, context, "file_close", |ctx, args| {
        let file = expect_file(ctx.get_value(args.u32_at(0)?).map_err(HostError::Trap)?)?;
        file.close();
        Ok(AbiValue::Unit)
    });

    // Diagnostics channel for the module.
    register(t, context, "log_string", |ctx, args| {
        let accessor = ctx.accessor()?;
        let message = ctx
            .codec
            .decode(&accessor, args.u32_at(0)?, args.u32_at(1)?)
            .map_err(codec_trap)?;
        tracing::debug!(target: "wasym_bridge::module", "{message}");
        Ok(AbiValue::Unit)
    });

    table
}

fn expect_promise(value: Value) -> Result<Promise, ModuleTrap> {
    match value {
        Value::Promise(p) => Ok(p),
        other => Err(ModuleTrap::new(format!(
            "expected a promise, got {}",
            other.type_name()
        ))),
    }
}

fn new_view(
    ctx: &Arc<BridgeContext>,
    args: &[AbiValue],
    kind: ViewKind,
) -> Result<AbiValue, ModuleTrap> {
    let buffer = ctx.get_value(args.u32_at(0)?)?;
    let byte_offset = args.u32_at(1)?;
    let len = args.u32_at(2)?;
    let Value::Memory(memory) = buffer else {
        return Err(ModuleTrap::new(format!(
            "typed view over non-memory value {}",
            buffer.type_name()
        )));
    };
    let view = MemoryView::new(memory, kind, byte_offset, len).map_err(mem_trap)?;
    Ok(AbiValue::U32(ctx.alloc_value(Value::View(view)).0))
}
