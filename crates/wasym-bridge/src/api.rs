//! Public entry points
//!
//! The bridge's whole public call surface: `get_compact_symbol_table` and
//! `query_api`. Both marshal two strings and a helper handle into the
//! module, invoke the export, unwrap the returned promise-shaped handle and
//! drive the scheduler until it settles.

use crate::context::BridgeContext;
use crate::engine::{ModuleInstance, WasmSlice};
use crate::error::BridgeError;
use crate::helper::SymbolicationHelper;
use crate::memory::ViewKind;
use crate::promise::{Promise, Settled};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The three-part symbol table produced by the module: sorted addresses,
/// index ranges into the name buffer, and the concatenated name bytes.
/// The encoding is owned by the computation engine, not re-interpreted
/// here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactSymbolTable {
    pub addr: Vec<u32>,
    pub index: Vec<u32>,
    pub buffer: Vec<u8>,
}

/// An initialized bridge: shared state plus the instantiated module.
#[derive(Clone)]
pub struct Bridge {
    context: Arc<BridgeContext>,
    instance: Arc<dyn ModuleInstance>,
}

impl Bridge {
    pub(crate) fn new(context: Arc<BridgeContext>, instance: Arc<dyn ModuleInstance>) -> Self {
        Self { context, instance }
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    /// Resolve the symbol table for one library.
    ///
    /// Marshals `debug_name` and `breakpad_id` into module memory,
    /// registers `helper` as a heap handle owned by the module for the
    /// duration of the call, and awaits the promise-shaped result.
    pub async fn get_compact_symbol_table(
        &self,
        debug_name: &str,
        breakpad_id: &str,
        helper: Arc<dyn SymbolicationHelper>,
    ) -> Result<CompactSymbolTable, BridgeError> {
        let (slice0, slice1, helper_handle) = self.marshal_call(debug_name, breakpad_id, helper)?;
        let handle = self
            .instance
            .get_compact_symbol_table(slice0, slice1, helper_handle)?;
        match self.settle(handle).await? {
            Settled::Resolved(value) => decode_symbol_table(value),
            Settled::Rejected(error) => Err(BridgeError::Rejected(describe_rejection(&error))),
        }
    }

    /// Run a symbolication API query, returning the response JSON string.
    pub async fn query_api(
        &self,
        url: &str,
        request_json: &str,
        helper: Arc<dyn SymbolicationHelper>,
    ) -> Result<String, BridgeError> {
        let (slice0, slice1, helper_handle) = self.marshal_call(url, request_json, helper)?;
        let handle = self.instance.query_api(slice0, slice1, helper_handle)?;
        match self.settle(handle).await? {
            Settled::Resolved(Value::String(response)) => Ok(response.to_string()),
            Settled::Resolved(other) => Err(BridgeError::UnexpectedShape(format!(
                "query response must be a string, got {}",
                other.type_name()
            ))),
            Settled::Rejected(error) => Err(BridgeError::Rejected(describe_rejection(&error))),
        }
    }

    fn marshal_call(
        &self,
        first: &str,
        second: &str,
        helper: Arc<dyn SymbolicationHelper>,
    ) -> Result<(WasmSlice, WasmSlice, u32), BridgeError> {
        let accessor = self.context.accessor()?;
        let codec = &self.context.codec;
        let ptr0 = codec.encode(&*self.instance, &accessor, first)?;
        let slice0 = WasmSlice::new(ptr0, codec.last_encoded_len());
        let ptr1 = codec.encode(&*self.instance, &accessor, second)?;
        let slice1 = WasmSlice::new(ptr1, codec.last_encoded_len());
        let helper_handle = self.context.alloc_value(Value::Helper(helper));
        Ok((slice0, slice1, helper_handle.0))
    }

    async fn settle(&self, handle: u32) -> Result<Settled, BridgeError> {
        let value = self.context.take_value(handle)?;
        let Value::Promise(promise) = value else {
            return Err(BridgeError::UnexpectedShape(format!(
                "entry point must return a promise, got {}",
                value.type_name()
            )));
        };
        self.drive(&promise).await
    }

    async fn drive(&self, promise: &Promise) -> Result<Settled, BridgeError> {
        self.context.scheduler.drive(promise).await
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context", &self.context)
            .finish()
    }
}

fn decode_symbol_table(value: Value) -> Result<CompactSymbolTable, BridgeError> {
    let Value::Array(parts) = &value else {
        return Err(BridgeError::UnexpectedShape(format!(
            "symbol table result must be a 3-element array, got {}",
            value.type_name()
        )));
    };
    let parts = parts.with(|v| v.clone());
    if parts.len() != 3 {
        return Err(BridgeError::UnexpectedShape(format!(
            "symbol table result must have 3 elements, got {}",
            parts.len()
        )));
    }
    Ok(CompactSymbolTable {
        addr: words_of(&parts[0])?,
        index: words_of(&parts[1])?,
        buffer: bytes_of(&parts[2])?,
    })
}

fn words_of(value: &Value) -> Result<Vec<u32>, BridgeError> {
    match value {
        Value::WordArray(words) => Ok(words.with(|v| v.clone())),
        Value::View(view) if view.kind() == ViewKind::Word => Ok(view.snapshot_words()?),
        other => Err(BridgeError::UnexpectedShape(format!(
            "expected 32-bit word data, got {}",
            other.type_name()
        ))),
    }
}

fn bytes_of(value: &Value) -> Result<Vec<u8>, BridgeError> {
    match value {
        Value::ByteArray(bytes) => Ok(bytes.with(|v| v.clone())),
        Value::View(view) if view.kind() == ViewKind::Byte => Ok(view.snapshot_bytes()?),
        other => Err(BridgeError::UnexpectedShape(format!(
            "expected byte data, got {}",
            other.type_name()
        ))),
    }
}

fn describe_rejection(error: &Value) -> String {
    match error {
        Value::Error(e) => e.to_string(),
        Value::String(s) => s.to_string(),
        other => format!("rejected with {} value", other.type_name()),
    }
}
