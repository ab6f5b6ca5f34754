//! The worker side of the bridge: blocking calls into the main thread and
//! the worker's own message loop.
//!
//! A guest import that must run on the main thread is forwarded by
//! copying its parameters into the transfer memory with the codecs'
//! `copy`/`copy_flat`, posting a `callMain` message, and parking on the
//! lock word until the header holds the reply.

use crate::buffer::{BridgeErrorCode, TransferBuffer, LOCK_DONE};
use crate::futex::WaitOutcome;
use crate::messages::{MemoryRef, Message, MessageParam, INIT_CHANNEL};
use anyhow::{bail, Context, Result};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wasmbridge_abi::{
    CallContext, CanonicalOptions, FlatReader, FlatType, FlatValue, FlatValues, FuncKind, FuncType,
    Memory, ResourceRegistry, Trap, TypeHandle, TypeKind, Val, World,
};
use wasmbridge_runtime::{
    bind_exports, define_export_shims, Callable, CoreFn, GuestProxy, ImportTable, WasmEngine,
    ROOT_MODULE,
};

/// The worker's half of one bridge connection.
pub struct WorkerConnection {
    memory_id: u32,
    buffer: Arc<TransferBuffer>,
    data_buffer: Option<Arc<TransferBuffer>>,
    to_main: Mutex<Sender<Message>>,
    timeout: Option<Duration>,
}

impl WorkerConnection {
    /// A connection over a transfer buffer. When the guest's memory is not
    /// shared with the main thread, `data_buffer` carries the out-of-line
    /// data while `buffer` keeps the header and parameters.
    pub fn new(
        memory_id: u32,
        buffer: Arc<TransferBuffer>,
        data_buffer: Option<Arc<TransferBuffer>>,
        to_main: Sender<Message>,
        timeout: Option<Duration>,
    ) -> Arc<WorkerConnection> {
        Arc::new(WorkerConnection {
            memory_id,
            buffer,
            data_buffer,
            to_main: Mutex::new(to_main),
            timeout,
        })
    }

    fn transfer_target(&self) -> &Arc<TransferBuffer> {
        self.data_buffer.as_ref().unwrap_or(&self.buffer)
    }

    /// Executes one blocking call into the main thread.
    pub fn call_main(
        &self,
        qualified: &str,
        callable: &Callable,
        guest_memory: &Memory,
        flats: &[FlatValue],
        cx: &CallContext,
    ) -> Result<Vec<FlatValue>> {
        log::trace!("worker -> main `{qualified}`");
        self.buffer.reset();
        if let Some(data) = &self.data_buffer {
            data.reset();
        }
        let target = self.transfer_target().clone();
        let target_memory = target.memory();

        let mut out = FlatValues::new();
        let mut reader = FlatReader::new(flats);
        if matches!(callable.func().kind(), FuncKind::Method(_)) {
            // The receiver handle is memory-independent.
            out.push(FlatValue::I32(reader.take()?.as_i32()?));
        }
        if callable.spills_params() {
            let param_ty = callable.param_ty().context("spill without parameters")?;
            let ptr = reader.take()?.as_i32()?;
            let src = guest_memory.readonly(ptr, param_ty.size());
            let dst = target_memory.alloc(param_ty.alignment(), param_ty.size())?;
            param_ty.copy(&dst, 0, &src, 0, cx)?;
            out.push(FlatValue::I32(dst.ptr()));
        } else {
            for (_, param) in callable.func().params() {
                param.copy_flat(&mut out, &target_memory, &mut reader, guest_memory, cx)?;
            }
        }

        let params = out.iter().copied().map(MessageParam::from_flat).collect();
        self.to_main
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(Message::CallMain {
                name: qualified.to_string(),
                params,
                memory: MemoryRef {
                    id: self.memory_id,
                    buffer: target.clone(),
                },
            })
            .map_err(|_| anyhow::anyhow!("main thread is gone"))?;

        match self.buffer.wait_done(self.timeout) {
            WaitOutcome::TimedOut => return Err(Trap::CallTimedOut.into()),
            WaitOutcome::Woken | WaitOutcome::NotEqual(_) => {
                let lock = self.buffer.lock_word();
                if lock != LOCK_DONE {
                    return Err(Trap::CorruptLockWord(lock).into());
                }
            }
        }

        match self.buffer.error_code() {
            BridgeErrorCode::None => {}
            BridgeErrorCode::NoHandler => {
                return Err(Trap::NoHandler(qualified.to_string()).into())
            }
            BridgeErrorCode::Rejection => {
                return Err(Trap::Rejected(qualified.to_string()).into())
            }
        }

        let (tag, bits) = self.buffer.result();
        match callable.func().result() {
            None => Ok(Vec::new()),
            Some(result_ty) => {
                log::trace!("`{qualified}` returned {tag:?} {bits:#x}");
                let flat = match result_ty.flat_types() {
                    [FlatType::I32] => FlatValue::I32(bits as u32),
                    [FlatType::I64] => FlatValue::I64(bits),
                    [FlatType::F32] => FlatValue::F32(f32::from_bits(bits as u32)),
                    [FlatType::F64] => FlatValue::F64(f64::from_bits(bits)),
                    _ => {
                        return Err(Trap::UnbridgeableResult {
                            func: qualified.to_string(),
                        }
                        .into())
                    }
                };
                Ok(vec![flat])
            }
        }
    }
}

fn forward(
    table: &mut ImportTable,
    module: &str,
    field: &str,
    qualified: String,
    func: &Arc<FuncType>,
    connection: &Arc<WorkerConnection>,
    cx: &CallContext,
) -> Result<()> {
    let callable = Arc::new(Callable::new(func.clone(), qualified.clone()));
    if callable.spills_result() {
        return Err(Trap::UnbridgeableResult { func: qualified }.into());
    }
    let connection = connection.clone();
    let cx = cx.clone();
    let core: CoreFn = Arc::new(move |guest_memory, flats| {
        connection.call_main(callable.core_name(), &callable, guest_memory, flats, &cx)
    });
    table.define(module, field, core)
}

/// Builds the import table of a worker-hosted module: every imported
/// function forwards across the bridge, and the shims for exported
/// resources run locally against the worker's tables.
pub fn bridge_imports(
    world: &World,
    connection: &Arc<WorkerConnection>,
    cx: &CallContext,
) -> Result<ImportTable> {
    let mut table = ImportTable::new();

    for (name, func) in world.imports().functions() {
        forward(
            &mut table,
            ROOT_MODULE,
            name,
            name.clone(),
            func,
            connection,
            cx,
        )?;
    }

    for (iface_name, iface) in world.imports().interfaces() {
        for (name, func) in iface.functions() {
            forward(
                &mut table,
                iface_name,
                name,
                format!("{iface_name}#{name}"),
                func,
                connection,
                cx,
            )?;
        }
        for (rname, decl) in iface.resources() {
            if let Some(ctor) = decl.ctor() {
                forward(
                    &mut table,
                    iface_name,
                    ctor.wit_name(),
                    format!("{iface_name}#{}", ctor.wit_name()),
                    ctor,
                    connection,
                    cx,
                )?;
            }
            for sig in decl.methods().values() {
                forward(
                    &mut table,
                    iface_name,
                    sig.wit_name(),
                    format!("{iface_name}#{}", sig.wit_name()),
                    sig,
                    connection,
                    cx,
                )?;
            }
            for sig in decl.statics().values() {
                forward(
                    &mut table,
                    iface_name,
                    sig.wit_name(),
                    format!("{iface_name}#{}", sig.wit_name()),
                    sig,
                    connection,
                    cx,
                )?;
            }
            let drop_name = wasmbridge_abi::world::names::resource_drop(rname);
            let drop_sig = Arc::new(FuncType::new(
                drop_name.clone(),
                [("handle", wasmbridge_abi::ty::resource_handle())],
                None,
            ));
            forward(
                &mut table,
                iface_name,
                &drop_name,
                format!("{iface_name}#{drop_name}"),
                &drop_sig,
                connection,
                cx,
            )?;
        }
    }

    define_export_shims(world, cx, &mut table)?;
    Ok(table)
}

fn param_to_val(param: &MessageParam, ty: &TypeHandle) -> Result<Val> {
    match (ty.kind(), param) {
        (TypeKind::U32, MessageParam::I32(v)) => Ok(Val::U32(*v as u32)),
        (TypeKind::S32, MessageParam::I32(v)) => Ok(Val::S32(*v)),
        (TypeKind::Bool, MessageParam::I32(v)) => Ok(Val::Bool(*v != 0)),
        (TypeKind::U64, MessageParam::Str(s)) => {
            Ok(Val::U64(s.parse().context("bad u64 parameter")?))
        }
        (TypeKind::S64, MessageParam::Str(s)) => {
            Ok(Val::S64(s.parse().context("bad s64 parameter")?))
        }
        (TypeKind::String, MessageParam::Str(s)) => Ok(Val::from(s.as_str())),
        (kind, _) => bail!("parameter of kind {kind:?} cannot cross the worker message"),
    }
}

struct WorkerState {
    proxy: GuestProxy,
    world: Arc<World>,
}

impl WorkerState {
    fn call(&self, name: &str, params: &[MessageParam]) -> Result<Option<MessageParam>> {
        let result = match name.split_once('#') {
            Some((iface_name, fname)) => {
                let iface = self
                    .world
                    .exports()
                    .interfaces()
                    .get(iface_name)
                    .with_context(|| format!("no exported interface `{iface_name}`"))?;
                let sig = iface
                    .functions()
                    .get(fname)
                    .with_context(|| format!("no exported function `{name}`"))?;
                let args = convert_params(sig, params)?;
                self.proxy
                    .interface(iface_name)
                    .with_context(|| format!("interface `{iface_name}` is not bound"))?
                    .call(fname, &args)?
            }
            None => {
                let sig = self
                    .world
                    .exports()
                    .functions()
                    .get(name)
                    .with_context(|| format!("no exported function `{name}`"))?;
                let args = convert_params(sig, params)?;
                self.proxy.call(name, &args)?
            }
        };
        match result {
            None => Ok(None),
            Some(value) => Ok(Some(MessageParam::from_val(&value)?)),
        }
    }
}

fn convert_params(sig: &Arc<FuncType>, params: &[MessageParam]) -> Result<Vec<Val>> {
    if params.len() != sig.params().len() {
        bail!(
            "`{}` takes {} parameters, got {}",
            sig.wit_name(),
            sig.params().len(),
            params.len()
        );
    }
    sig.params()
        .iter()
        .zip(params)
        .map(|((_, ty), param)| param_to_val(param, ty))
        .collect()
}

/// The worker's message loop: instantiates the module on request and
/// serves `callWorker` messages until the channel closes.
pub fn run_worker(
    engine: Arc<dyn WasmEngine>,
    world: Arc<World>,
    connection: Arc<WorkerConnection>,
    from_main: Receiver<Message>,
    to_main: Sender<Message>,
) {
    let mut state: Option<WorkerState> = None;
    for message in from_main {
        match message {
            Message::InitializeWorker { module, options } => {
                let outcome = initialise(&engine, &world, &connection, &module, options);
                let report = match outcome {
                    Ok(new_state) => {
                        state = Some(new_state);
                        Message::ReportResult {
                            name: INIT_CHANNEL.to_string(),
                            result: None,
                            error: None,
                        }
                    }
                    Err(err) => Message::ReportResult {
                        name: INIT_CHANNEL.to_string(),
                        result: None,
                        error: Some(format!("{err:#}")),
                    },
                };
                if to_main.send(report).is_err() {
                    return;
                }
            }
            Message::CallWorker { name, params } => {
                let outcome = match &state {
                    Some(state) => state.call(&name, &params),
                    None => Err(anyhow::anyhow!("worker is not initialised")),
                };
                let report = match outcome {
                    Ok(result) => Message::ReportResult {
                        name,
                        result,
                        error: None,
                    },
                    Err(err) => Message::ReportResult {
                        name,
                        result: None,
                        error: Some(format!("{err:#}")),
                    },
                };
                if to_main.send(report).is_err() {
                    return;
                }
            }
            Message::CallMain { name, .. } | Message::ReportResult { name, .. } => {
                log::warn!("unexpected message `{name}` on the worker side");
            }
        }
    }
}

fn initialise(
    engine: &Arc<dyn WasmEngine>,
    world: &Arc<World>,
    connection: &Arc<WorkerConnection>,
    module: &[u8],
    options: CanonicalOptions,
) -> Result<WorkerState> {
    let cx = CallContext::new(options, ResourceRegistry::new());
    let imports = bridge_imports(world, connection, &cx)?;
    let instance = engine.instantiate(module, &imports)?;
    let proxy = bind_exports(world, &instance, &cx)?;
    Ok(WorkerState {
        proxy,
        world: world.clone(),
    })
}
