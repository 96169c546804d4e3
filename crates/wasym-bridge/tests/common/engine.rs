//! Scripted module engine
//!
//! A `ModuleInstance` test double that behaves the way the compiled
//! symbolication module does at the boundary: it owns a linear memory with
//! a bump allocator, keeps an exception slot, runs its side of the closure
//! protocol, and services the two entry points by calling back through the
//! real import catalogue. The symbol table it produces is trivial (one
//! entry spanning the file), which keeps the marshalling observable without
//! re-implementing symbolication.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasym_bridge::{
    AbiValue, CompileError, CompiledModule, Handle, ImportTable, LinearMemory, ModuleAllocator,
    ModuleEngine, ModuleInstance, ModuleTrap, SharedMemory, WasmSlice,
};

/// Index the scripted module hands out for its closure destructor table.
pub const CLOSURE_DTOR: u32 = 7;

const UNDEFINED: u32 = Handle::UNDEFINED.0;

pub struct ScriptedEngine;

impl ModuleEngine for ScriptedEngine {
    fn compile(&self, _bytes: &[u8]) -> Result<Arc<dyn CompiledModule>, CompileError> {
        Ok(Arc::new(ScriptedModule))
    }
}

pub struct ScriptedModule;

impl CompiledModule for ScriptedModule {
    fn instantiate(&self, imports: &ImportTable) -> Result<Arc<dyn ModuleInstance>, ModuleTrap> {
        Ok(Arc::new(ScriptedInstance::new(imports.clone())))
    }
}

type ExecutorSlot = Arc<Mutex<Option<(u32, u32)>>>;

#[derive(Clone)]
struct CallCtx {
    helper: u32,
    resolve: u32,
    reject: u32,
    cb_ok: u32,
    cb_err: u32,
    ok_state: u32,
    err_state: u32,
}

enum Continuation {
    Executor(ExecutorSlot),
    SymbolFileReady(CallCtx),
    QueryFileReady(CallCtx),
    Failed(CallCtx),
}

pub struct ScriptedInstance {
    memory: SharedMemory,
    imports: ImportTable,
    top: Mutex<u32>,
    next_state: Mutex<u32>,
    last_exception: Mutex<Option<u32>>,
    pending: Mutex<HashMap<u32, Continuation>>,
    pub destructor_log: Mutex<Vec<(u32, u32, u32)>>,
}

impl ScriptedInstance {
    fn new(imports: ImportTable) -> Self {
        Self {
            memory: SharedMemory::new(LinearMemory::new(4096)),
            imports,
            top: Mutex::new(16),
            next_state: Mutex::new(1),
            last_exception: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            destructor_log: Mutex::new(Vec::new()),
        }
    }

    fn alloc(&self, len: u32) -> u32 {
        let mut top = self.top.lock().unwrap();
        let ptr = *top;
        let needed = ptr as usize + len as usize;
        let size = self.memory.len();
        if needed > size {
            self.memory.with_mut(|m| m.grow(needed - size + 4096));
        }
        // Keep allocations word-aligned.
        *top = (ptr + len + 3) & !3;
        ptr
    }

    fn write_bytes(&self, ptr: u32, data: &[u8]) {
        self.memory.with_mut(|m| {
            m.bytes_mut()[ptr as usize..ptr as usize + data.len()].copy_from_slice(data);
        });
    }

    fn read_word(&self, addr: u32) -> u32 {
        self.memory.with(|m| {
            let bytes = &m.bytes()[addr as usize..addr as usize + 4];
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        })
    }

    fn write_word(&self, addr: u32, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    fn read_str(&self, slice: WasmSlice) -> Result<String, ModuleTrap> {
        let bytes = self.memory.with(|m| {
            m.bytes()[slice.ptr as usize..(slice.ptr + slice.len) as usize].to_vec()
        });
        String::from_utf8(bytes).map_err(|_| ModuleTrap::new("module read invalid utf-8"))
    }

    fn import(&self, name: &str, args: &[AbiValue]) -> Result<AbiValue, ModuleTrap> {
        self.imports.call(name, args)
    }

    fn import_u32(&self, name: &str, args: &[AbiValue]) -> Result<u32, ModuleTrap> {
        match self.import(name, args)? {
            AbiValue::U32(value) => Ok(value),
            other => Err(ModuleTrap::new(format!(
                "import {name} returned {other:?}, expected a handle"
            ))),
        }
    }

    fn drop_handle(&self, handle: u32) -> Result<(), ModuleTrap> {
        self.import("object_drop", &[AbiValue::U32(handle)])?;
        Ok(())
    }

    fn take_exception(&self) -> Option<u32> {
        self.last_exception.lock().unwrap().take()
    }

    fn new_state(&self) -> u32 {
        let mut next = self.next_state.lock().unwrap();
        let state = *next;
        *next += 1;
        state
    }

    fn string_handle(&self, text: &str) -> Result<u32, ModuleTrap> {
        let ptr = self.alloc(text.len() as u32);
        self.write_bytes(ptr, text.as_bytes());
        self.import_u32(
            "string_new",
            &[AbiValue::U32(ptr), AbiValue::U32(text.len() as u32)],
        )
    }

    fn log(&self, message: &str) -> Result<(), ModuleTrap> {
        let ptr = self.alloc(message.len() as u32);
        self.write_bytes(ptr, message.as_bytes());
        self.import(
            "log_string",
            &[AbiValue::U32(ptr), AbiValue::U32(message.len() as u32)],
        )?;
        Ok(())
    }

    fn set_string_property(&self, object: u32, key: &str, value: &str) -> Result<(), ModuleTrap> {
        let key = self.string_handle(key)?;
        let value = self.string_handle(value)?;
        self.import(
            "object_set",
            &[AbiValue::U32(object), AbiValue::U32(key), AbiValue::U32(value)],
        )?;
        Ok(())
    }

    /// Build the result promise through the executor protocol, returning
    /// (promise handle, resolve handle, reject handle).
    fn new_result_promise(&self) -> Result<(u32, u32, u32), ModuleTrap> {
        let state = self.new_state();
        let slot: ExecutorSlot = Arc::new(Mutex::new(None));
        self.pending
            .lock()
            .unwrap()
            .insert(state, Continuation::Executor(slot.clone()));
        let promise =
            self.import_u32("promise_new", &[AbiValue::U32(state), AbiValue::U32(0)])?;
        let (resolve, reject) = slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ModuleTrap::new("promise executor did not run"))?;
        Ok((promise, resolve, reject))
    }

    fn chain_file_continuations(
        &self,
        file_promise: u32,
        helper: u32,
        resolve: u32,
        reject: u32,
        symbol_table: bool,
    ) -> Result<(), ModuleTrap> {
        let ok_state = self.new_state();
        let err_state = self.new_state();
        let cb_ok = self.import_u32(
            "closure_new",
            &[
                AbiValue::U32(ok_state),
                AbiValue::U32(0),
                AbiValue::U32(CLOSURE_DTOR),
            ],
        )?;
        let cb_err = self.import_u32(
            "closure_new",
            &[
                AbiValue::U32(err_state),
                AbiValue::U32(0),
                AbiValue::U32(CLOSURE_DTOR),
            ],
        )?;
        let ctx = CallCtx {
            helper,
            resolve,
            reject,
            cb_ok,
            cb_err,
            ok_state,
            err_state,
        };
        {
            let mut pending = self.pending.lock().unwrap();
            let ready = if symbol_table {
                Continuation::SymbolFileReady(ctx.clone())
            } else {
                Continuation::QueryFileReady(ctx.clone())
            };
            pending.insert(ok_state, ready);
            pending.insert(err_state, Continuation::Failed(ctx));
        }
        let chained = self.import_u32(
            "promise_then2",
            &[
                AbiValue::U32(file_promise),
                AbiValue::U32(cb_ok),
                AbiValue::U32(cb_err),
            ],
        )?;
        self.drop_handle(chained)?;
        self.drop_handle(file_promise)?;
        Ok(())
    }

    /// Size the file, read it fully into module memory through a byte view,
    /// and close it. Returns the (pointer, size) on success or the stored
    /// exception handle when a host call failed.
    fn read_file_into_memory(&self, file: u32) -> Result<Result<(u32, u32), u32>, ModuleTrap> {
        let size = match self.import("file_size", &[AbiValue::U32(file)])? {
            AbiValue::F64(size) => size as u32,
            _ => {
                let error = self
                    .take_exception()
                    .ok_or_else(|| ModuleTrap::new("sentinel without stored exception"))?;
                return Ok(Err(error));
            }
        };
        let ptr = self.alloc(size);
        let memory = self.import_u32("memory", &[])?;
        let buffer = self.import_u32("buffer", &[AbiValue::U32(memory)])?;
        self.drop_handle(memory)?;
        let view = self.import_u32(
            "byte_view_new",
            &[AbiValue::U32(buffer), AbiValue::U32(ptr), AbiValue::U32(size)],
        )?;
        self.drop_handle(buffer)?;
        // The read consumes the view handle.
        self.import(
            "file_read_bytes_into",
            &[AbiValue::U32(file), AbiValue::U32(view), AbiValue::F64(0.0)],
        )?;
        if let Some(error) = self.take_exception() {
            return Ok(Err(error));
        }
        self.import("file_close", &[AbiValue::U32(file)])?;
        if let Some(error) = self.take_exception() {
            return Ok(Err(error));
        }
        Ok(Ok((ptr, size)))
    }

    fn copy_words(&self, buffer: u32, ptr: u32, len: u32) -> Result<u32, ModuleTrap> {
        let view = self.import_u32(
            "word_view_new",
            &[AbiValue::U32(buffer), AbiValue::U32(ptr), AbiValue::U32(len)],
        )?;
        let array = self.import_u32("word_array_new", &[AbiValue::U32(view)])?;
        self.drop_handle(view)?;
        Ok(array)
    }

    fn copy_bytes(&self, buffer: u32, ptr: u32, len: u32) -> Result<u32, ModuleTrap> {
        let view = self.import_u32(
            "byte_view_new",
            &[AbiValue::U32(buffer), AbiValue::U32(ptr), AbiValue::U32(len)],
        )?;
        let array = self.import_u32("byte_array_new", &[AbiValue::U32(view)])?;
        self.drop_handle(view)?;
        Ok(array)
    }

    fn finish_symbol_table(&self, ctx: CallCtx, file: u32) -> Result<(), ModuleTrap> {
        let (ptr, size) = match self.read_file_into_memory(file)? {
            Ok(loc) => loc,
            Err(error) => {
                self.drop_handle(file)?;
                return self.finish_rejected(ctx, error);
            }
        };
        self.drop_handle(file)?;

        // One symbol at address 0 whose name is the whole file.
        let addr_ptr = self.alloc(4);
        self.write_word(addr_ptr, 0);
        let index_ptr = self.alloc(8);
        self.write_word(index_ptr, 0);
        self.write_word(index_ptr + 4, size);

        let memory = self.import_u32("memory", &[])?;
        let buffer = self.import_u32("buffer", &[AbiValue::U32(memory)])?;
        self.drop_handle(memory)?;
        let addr = self.copy_words(buffer, addr_ptr, 1)?;
        let index = self.copy_words(buffer, index_ptr, 2)?;
        let bytes = self.copy_bytes(buffer, ptr, size)?;
        self.drop_handle(buffer)?;

        let result = self.import_u32(
            "array_of3",
            &[AbiValue::U32(addr), AbiValue::U32(index), AbiValue::U32(bytes)],
        )?;
        for handle in [addr, index, bytes] {
            self.drop_handle(handle)?;
        }
        self.finish_resolved(ctx, result)
    }

    fn finish_query(&self, ctx: CallCtx, file: u32) -> Result<(), ModuleTrap> {
        let (ptr, size) = match self.read_file_into_memory(file)? {
            Ok(loc) => loc,
            Err(error) => {
                self.drop_handle(file)?;
                return self.finish_rejected(ctx, error);
            }
        };
        self.drop_handle(file)?;
        let response = self.import_u32("string_new", &[AbiValue::U32(ptr), AbiValue::U32(size)])?;
        self.finish_resolved(ctx, response)
    }

    fn finish_resolved(&self, ctx: CallCtx, value: u32) -> Result<(), ModuleTrap> {
        let ret = self.import_u32(
            "call1",
            &[
                AbiValue::U32(ctx.resolve),
                AbiValue::U32(UNDEFINED),
                AbiValue::U32(value),
            ],
        )?;
        if ret != 0 {
            self.drop_handle(ret)?;
        } else {
            self.take_exception();
        }
        self.drop_handle(value)?;
        self.cleanup(ctx)
    }

    fn finish_rejected(&self, ctx: CallCtx, error: u32) -> Result<(), ModuleTrap> {
        let ret = self.import_u32(
            "call1",
            &[
                AbiValue::U32(ctx.reject),
                AbiValue::U32(UNDEFINED),
                AbiValue::U32(error),
            ],
        )?;
        if ret != 0 {
            self.drop_handle(ret)?;
        } else {
            self.take_exception();
        }
        self.drop_handle(error)?;
        self.cleanup(ctx)
    }

    /// Reject before any continuations exist.
    fn reject_simple(
        &self,
        helper: u32,
        resolve: u32,
        reject: u32,
        error: u32,
    ) -> Result<(), ModuleTrap> {
        let ret = self.import_u32(
            "call1",
            &[
                AbiValue::U32(reject),
                AbiValue::U32(UNDEFINED),
                AbiValue::U32(error),
            ],
        )?;
        if ret != 0 {
            self.drop_handle(ret)?;
        }
        self.drop_handle(error)?;
        self.drop_handle(resolve)?;
        self.drop_handle(reject)?;
        self.drop_handle(helper)?;
        Ok(())
    }

    fn cleanup(&self, ctx: CallCtx) -> Result<(), ModuleTrap> {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(&ctx.ok_state);
            pending.remove(&ctx.err_state);
        }
        self.drop_handle(ctx.resolve)?;
        self.drop_handle(ctx.reject)?;
        self.import("callback_drop", &[AbiValue::U32(ctx.cb_ok)])?;
        self.import("callback_drop", &[AbiValue::U32(ctx.cb_err)])?;
        self.drop_handle(ctx.helper)?;
        Ok(())
    }
}

impl ModuleAllocator for ScriptedInstance {
    fn malloc(&self, len: u32, _align: u32) -> Result<u32, ModuleTrap> {
        Ok(self.alloc(len))
    }

    fn realloc(
        &self,
        ptr: u32,
        old_len: u32,
        new_len: u32,
        _align: u32,
    ) -> Result<u32, ModuleTrap> {
        if new_len <= old_len {
            return Ok(ptr);
        }
        let new_ptr = self.alloc(new_len);
        let data = self.memory.with(|m| {
            m.bytes()[ptr as usize..(ptr + old_len) as usize].to_vec()
        });
        self.write_bytes(new_ptr, &data);
        Ok(new_ptr)
    }
}

impl ModuleInstance for ScriptedInstance {
    fn memory(&self) -> SharedMemory {
        self.memory.clone()
    }

    fn store_exception(&self, handle: u32) {
        *self.last_exception.lock().unwrap() = Some(handle);
    }

    fn get_compact_symbol_table(
        &self,
        debug_name: WasmSlice,
        breakpad_id: WasmSlice,
        helper: u32,
    ) -> Result<u32, ModuleTrap> {
        let debug_name = self.read_str(debug_name)?;
        let breakpad_id = self.read_str(breakpad_id)?;
        self.log(&format!("symbolicating {debug_name}/{breakpad_id}"))?;

        let (promise, resolve, reject) = self.new_result_promise()?;

        let info = self.import_u32("object_new", &[])?;
        self.set_string_property(info, "debugName", &debug_name)?;
        self.set_string_property(info, "breakpadId", &breakpad_id)?;
        let paths = self.import_u32(
            "candidate_paths_for_debug_file",
            &[AbiValue::U32(helper), AbiValue::U32(info)],
        )?;
        if paths == 0 {
            let error = self
                .take_exception()
                .ok_or_else(|| ModuleTrap::new("sentinel without stored exception"))?;
            self.reject_simple(helper, resolve, reject, error)?;
            return Ok(promise);
        }

        let list = self.import_u32("array_from", &[AbiValue::U32(paths)])?;
        self.drop_handle(paths)?;
        let count = self.import_u32("array_length", &[AbiValue::U32(list)])?;
        if count == 0 {
            self.drop_handle(list)?;
            let message = self
                .string_handle(&format!("no candidate path for {debug_name}/{breakpad_id}"))?;
            self.reject_simple(helper, resolve, reject, message)?;
            return Ok(promise);
        }
        let path = self.import_u32("array_get", &[AbiValue::U32(list), AbiValue::U32(0)])?;
        self.drop_handle(list)?;

        // Marshal the chosen path back into module memory for read_file.
        let retptr = self.alloc(8);
        self.import("string_get", &[AbiValue::U32(retptr), AbiValue::U32(path)])?;
        self.drop_handle(path)?;
        let path_ptr = self.read_word(retptr);
        let path_len = self.read_word(retptr + 4);

        let file_promise = self.import_u32(
            "read_file",
            &[
                AbiValue::U32(helper),
                AbiValue::U32(path_ptr),
                AbiValue::U32(path_len),
            ],
        )?;
        self.chain_file_continuations(file_promise, helper, resolve, reject, true)?;
        Ok(promise)
    }

    fn query_api(
        &self,
        url: WasmSlice,
        request_json: WasmSlice,
        helper: u32,
    ) -> Result<u32, ModuleTrap> {
        let url_text = self.read_str(url)?;
        let request = self.read_str(request_json)?;
        self.log(&format!(
            "query {url_text} with {} request bytes",
            request.len()
        ))?;

        let (promise, resolve, reject) = self.new_result_promise()?;
        let file_promise = self.import_u32(
            "read_file",
            &[
                AbiValue::U32(helper),
                AbiValue::U32(url.ptr),
                AbiValue::U32(url.len),
            ],
        )?;
        self.chain_file_continuations(file_promise, helper, resolve, reject, false)?;
        Ok(promise)
    }

    fn invoke_closure1(&self, state_a: u32, _state_b: u32, arg: u32) -> Result<(), ModuleTrap> {
        let continuation = self
            .pending
            .lock()
            .unwrap()
            .remove(&state_a)
            .ok_or_else(|| ModuleTrap::new("closure invoked recursively or destroyed"))?;
        match continuation {
            Continuation::SymbolFileReady(ctx) => self.finish_symbol_table(ctx, arg),
            Continuation::QueryFileReady(ctx) => self.finish_query(ctx, arg),
            Continuation::Failed(ctx) => self.finish_rejected(ctx, arg),
            Continuation::Executor(_) => {
                Err(ModuleTrap::new("executor invoked with one argument"))
            }
        }
    }

    fn invoke_closure2(
        &self,
        state_a: u32,
        _state_b: u32,
        arg0: u32,
        arg1: u32,
    ) -> Result<(), ModuleTrap> {
        let continuation = self
            .pending
            .lock()
            .unwrap()
            .remove(&state_a)
            .ok_or_else(|| ModuleTrap::new("closure invoked recursively or destroyed"))?;
        match continuation {
            Continuation::Executor(slot) => {
                *slot.lock().unwrap() = Some((arg0, arg1));
                Ok(())
            }
            _ => Err(ModuleTrap::new("unexpected two-argument invocation")),
        }
    }

    fn run_destructor(&self, index: u32, state_a: u32, state_b: u32) -> Result<(), ModuleTrap> {
        self.destructor_log
            .lock()
            .unwrap()
            .push((index, state_a, state_b));
        self.pending.lock().unwrap().remove(&state_a);
        Ok(())
    }
}
