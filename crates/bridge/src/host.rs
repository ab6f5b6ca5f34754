//! The main-thread side of the bridge: a registry of handlers and the
//! result write-back protocol.
//!
//! The worker parks on the transfer buffer's lock word; whatever happens
//! here (a missing handler, a failure, a synchronous or asynchronous
//! result) must end with the header written and the lock released, or the
//! worker never wakes.

use crate::buffer::{BridgeErrorCode, ResultTag, TransferBuffer};
use crate::messages::{MemoryRef, MessageParam};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasmbridge_abi::{
    CallContext, FlatReader, FlatType, FlatValue, FlatValues, FuncType, ResourceAny, TypeKind, Val,
};
use wasmbridge_runtime::Callable;

/// An asynchronous handler body.
pub type AsyncHandler = Arc<
    dyn Fn(&CallContext, Option<ResourceAny>, Vec<Val>) -> BoxFuture<'static, Result<Option<Val>>>
        + Send
        + Sync,
>;

/// A synchronous handler body.
pub type SyncHandler =
    Arc<dyn Fn(&CallContext, Option<ResourceAny>, &[Val]) -> Result<Option<Val>> + Send + Sync>;

#[derive(Clone)]
enum HandlerKind {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct HandlerEntry {
    callable: Arc<Callable>,
    kind: HandlerKind,
}

/// The flat types a bridged call's message parameters carry, receiver
/// included.
fn surface_param_types(callable: &Callable) -> Vec<FlatType> {
    let mut surface = Vec::new();
    if matches!(callable.func().kind(), wasmbridge_abi::FuncKind::Method(_)) {
        surface.push(FlatType::I32);
    }
    if callable.spills_params() {
        surface.push(FlatType::I32);
    } else {
        for (_, param) in callable.func().params() {
            surface.extend_from_slice(param.flat_types());
        }
    }
    surface
}

fn result_tag(kind: TypeKind) -> ResultTag {
    match kind {
        TypeKind::S8 | TypeKind::S16 | TypeKind::S32 | TypeKind::S64 => ResultTag::Signed,
        TypeKind::F32 | TypeKind::F64 => ResultTag::Float,
        _ => ResultTag::Unsigned,
    }
}

fn result_bits(value: FlatValue) -> (ResultTag, u64) {
    match value {
        FlatValue::I32(v) => (ResultTag::Unsigned, u64::from(v)),
        FlatValue::I64(v) => (ResultTag::Unsigned, v),
        FlatValue::F32(v) => (ResultTag::Float, u64::from(v.to_bits())),
        FlatValue::F64(v) => (ResultTag::Float, v.to_bits()),
    }
}

/// The handler registry the worker's `callMain` messages dispatch into.
pub struct MainDispatcher {
    cx: CallContext,
    handlers: Mutex<HashMap<String, HandlerEntry>>,
}

impl MainDispatcher {
    /// An empty dispatcher over the main thread's call context.
    pub fn new(cx: CallContext) -> MainDispatcher {
        MainDispatcher {
            cx,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// The main thread's call context.
    pub fn context(&self) -> &CallContext {
        &self.cx
    }

    fn insert(&self, name: &str, func: &Arc<FuncType>, kind: HandlerKind) -> Result<()> {
        let callable = Arc::new(Callable::new(func.clone(), name.to_string()));
        if callable.spills_result() {
            return Err(wasmbridge_abi::Trap::UnbridgeableResult {
                func: name.to_string(),
            }
            .into());
        }
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers
            .insert(name.to_string(), HandlerEntry { callable, kind })
            .is_some()
        {
            bail!("handler `{name}` registered twice");
        }
        Ok(())
    }

    /// Registers a synchronous handler under `name`.
    pub fn on_sync<F>(&self, name: &str, func: &Arc<FuncType>, f: F) -> Result<()>
    where
        F: Fn(&CallContext, Option<ResourceAny>, &[Val]) -> Result<Option<Val>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, func, HandlerKind::Sync(Arc::new(f)))
    }

    /// Registers an asynchronous handler under `name`. Its future is
    /// driven to completion before the lock word is released.
    pub fn on_async<F>(&self, name: &str, func: &Arc<FuncType>, f: F) -> Result<()>
    where
        F: Fn(&CallContext, Option<ResourceAny>, Vec<Val>) -> BoxFuture<'static, Result<Option<Val>>>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, func, HandlerKind::Async(Arc::new(f)))
    }

    /// Removes a handler.
    pub fn remove(&self, name: &str) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Runs the handler for one `callMain` message and completes the
    /// header on `reply`. Never fails: every outcome, including handler
    /// errors, is reported through the header so the parked worker wakes.
    pub fn dispatch(&self, name: &str, params: &[MessageParam], memory: &MemoryRef, reply: &Arc<TransferBuffer>) {
        let entry = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        let Some(entry) = entry else {
            log::debug!("no handler registered for `{name}`");
            reply.set_error_code(BridgeErrorCode::NoHandler);
            reply.complete();
            return;
        };
        match self.run(&entry, params, memory) {
            Ok((tag, bits)) => {
                reply.set_result(tag, bits);
            }
            Err(err) => {
                log::warn!("handler `{name}` failed: {err:#}");
                reply.set_error_code(BridgeErrorCode::Rejection);
            }
        }
        reply.complete();
    }

    fn run(
        &self,
        entry: &HandlerEntry,
        params: &[MessageParam],
        memory: &MemoryRef,
    ) -> Result<(ResultTag, u64)> {
        let callable = &entry.callable;
        let surface = surface_param_types(callable);
        if params.len() != surface.len() {
            bail!(
                "`{}` expects {} message parameters, got {}",
                callable.func().wit_name(),
                surface.len(),
                params.len()
            );
        }
        let mut flats = Vec::with_capacity(params.len());
        for (param, want) in params.iter().zip(&surface) {
            flats.push(param.to_flat(*want)?);
        }

        let buffer_memory = memory.buffer.memory();
        let mut reader = FlatReader::new(&flats);
        let receiver = callable.lift_receiver(&mut reader, &self.cx)?;
        let args = callable.lift_args(&buffer_memory, &mut reader, &self.cx)?;

        let value = match &entry.kind {
            HandlerKind::Sync(f) => f(&self.cx, receiver, &args)?,
            HandlerKind::Async(f) => {
                futures::executor::block_on(f(&self.cx, receiver, args))?
            }
        };

        match (callable.func().result(), value) {
            (None, None) => Ok((ResultTag::Void, 0)),
            (Some(result_ty), Some(value)) => {
                let mut out = FlatValues::new();
                result_ty.lower_flat(&mut out, &buffer_memory, &value, &self.cx)?;
                let flat = out
                    .first()
                    .copied()
                    .context("single-value result expected")?;
                let (tag, bits) = result_bits(flat);
                // Floats keep their tag; integers refine theirs by the
                // declared signedness.
                let tag = match tag {
                    ResultTag::Float => ResultTag::Float,
                    _ => result_tag(result_ty.kind()),
                };
                Ok((tag, bits))
            }
            (None, Some(_)) => bail!(
                "handler for `{}` returned a value but none is declared",
                callable.func().wit_name()
            ),
            (Some(_), None) => bail!(
                "handler for `{}` returned no value",
                callable.func().wit_name()
            ),
        }
    }
}
