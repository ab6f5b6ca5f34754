//! Callable dispatch: the calling convention over the typed codecs.
//!
//! A [`Callable`] wraps one signature and implements both directions of a
//! synchronous call. Parameters beyond the flat budget are spilled to a
//! struct-layout region in the callee's memory with only a pointer
//! crossing the surface; results beyond the result budget travel through a
//! caller-allocated region passed as a trailing pointer.

use crate::engine::{GuestMemory, ModuleInstance};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use wasmbridge_abi::{
    ty, CallContext, ExpectedError, FlatReader, FlatValue, FlatValues, FuncKind, FuncType, Memory,
    ResourceAny, TypeHandle, TypeKind, Val, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS,
};

/// A host implementation of one callable. Methods receive the resolved
/// receiver object; everything else gets `None`.
pub type HostFn =
    Arc<dyn Fn(&CallContext, Option<ResourceAny>, &[Val]) -> Result<Option<Val>> + Send + Sync>;

/// A function on the core calling surface, as an engine imports it. The
/// memory is the calling instance's, used to resolve indirections.
pub type CoreFn = Arc<dyn Fn(&Memory, &[FlatValue]) -> Result<Vec<FlatValue>> + Send + Sync>;

/// One callable signature bound to its core export name.
pub struct Callable {
    func: Arc<FuncType>,
    core_name: String,
    param_ty: Option<TypeHandle>,
}

impl Callable {
    /// Wraps a signature. `core_name` is the name the callable carries on
    /// the core module surface.
    pub fn new(func: Arc<FuncType>, core_name: impl Into<String>) -> Callable {
        let param_ty = match func.params().len() {
            0 => None,
            1 => Some(func.params()[0].1.clone()),
            _ => Some(ty::tuple(func.params().iter().map(|(_, t)| t.clone()))),
        };
        Callable {
            func,
            core_name: core_name.into(),
            param_ty,
        }
    }

    /// The wrapped signature.
    pub fn func(&self) -> &Arc<FuncType> {
        &self.func
    }

    /// The core export name this callable dispatches to.
    pub fn core_name(&self) -> &str {
        &self.core_name
    }

    /// The synthesized parameter type: absent for no parameters, the lone
    /// parameter's type, or a tuple.
    pub fn param_ty(&self) -> Option<&TypeHandle> {
        self.param_ty.as_ref()
    }

    /// Whether parameters travel through memory instead of flat values.
    pub fn spills_params(&self) -> bool {
        self.param_ty
            .as_ref()
            .map_or(false, |t| t.flat_types().len() > MAX_FLAT_PARAMS)
    }

    /// Whether the result travels through a caller-allocated region.
    pub fn spills_result(&self) -> bool {
        self.func
            .result()
            .map_or(false, |t| t.flat_types().len() > MAX_FLAT_RESULTS)
    }

    fn check_arity(&self, args: &[Val]) -> Result<()> {
        if args.len() != self.func.params().len() {
            bail!(
                "`{}` takes {} parameters, got {}",
                self.func.wit_name(),
                self.func.params().len(),
                args.len()
            );
        }
        Ok(())
    }

    fn pack(&self, args: &[Val]) -> Val {
        if args.len() == 1 {
            args[0].clone()
        } else {
            Val::Tuple(args.to_vec())
        }
    }

    fn unpack(&self, packed: Val) -> Result<Vec<Val>> {
        if self.func.params().len() == 1 {
            return Ok(vec![packed]);
        }
        match packed {
            Val::Tuple(items) => Ok(items),
            other => bail!("spilled parameter area held a {}", other.desc()),
        }
    }

    /// Synchronous host-originated call into the guest: lowers the
    /// parameters, invokes the core export, lifts the result.
    ///
    /// `receiver` carries a method receiver's handle; constructors and
    /// plain functions pass `None`.
    pub fn call_guest(
        &self,
        instance: &Arc<dyn ModuleInstance>,
        receiver: Option<u32>,
        args: &[Val],
        cx: &CallContext,
    ) -> Result<Option<Val>> {
        self.check_arity(args)?;
        log::trace!("host -> guest `{}`", self.core_name);
        let memory = GuestMemory::new(instance.clone());
        let mut flats = FlatValues::new();
        if let Some(handle) = receiver {
            flats.push(FlatValue::I32(handle));
        }

        if let Some(param_ty) = &self.param_ty {
            if self.spills_params() {
                let range = memory.alloc(param_ty.alignment(), param_ty.size())?;
                param_ty
                    .store(&range, 0, &self.pack(args), cx)
                    .with_context(|| format!("lowering parameters of `{}`", self.func.wit_name()))?;
                flats.push(FlatValue::I32(range.ptr()));
            } else {
                for ((name, param), arg) in self.func.params().iter().zip(args) {
                    param
                        .lower_flat(&mut flats, &memory, arg, cx)
                        .with_context(|| {
                            format!("lowering parameter `{name}` of `{}`", self.func.wit_name())
                        })?;
                }
            }
        }

        let ret_area = match self.func.result() {
            Some(result_ty) if self.spills_result() => {
                let range = memory.alloc(result_ty.alignment(), result_ty.size())?;
                flats.push(FlatValue::I32(range.ptr()));
                Some(range)
            }
            _ => None,
        };

        let returned = instance
            .invoke(&self.core_name, &flats)
            .with_context(|| format!("calling `{}`", self.core_name))?;

        match (self.func.result(), ret_area) {
            (None, _) => Ok(None),
            (Some(result_ty), Some(range)) => {
                let value = result_ty
                    .load(&range.as_readonly(), 0, cx)
                    .with_context(|| format!("lifting result of `{}`", self.func.wit_name()))?;
                Ok(Some(value))
            }
            (Some(result_ty), None) => {
                let mut reader = FlatReader::new(&returned);
                let value = result_ty
                    .lift_flat(&memory, &mut reader, cx)
                    .with_context(|| format!("lifting result of `{}`", self.func.wit_name()))?;
                Ok(Some(value))
            }
        }
    }

    /// Wraps a host closure as a core function the guest can import:
    /// lifts the parameters, invokes the closure, lowers the result.
    ///
    /// Method callables resolve their receiver through the resource table
    /// from the leading flat parameter. When the signature returns a
    /// `result` and the closure raises an [`ExpectedError`], the error is
    /// lowered as the `error` arm instead of failing the call.
    pub fn wrap_host(self: &Arc<Self>, host: HostFn, cx: &CallContext) -> CoreFn {
        let callable = self.clone();
        let cx = cx.clone();
        Arc::new(move |memory: &Memory, flats: &[FlatValue]| {
            callable.dispatch_host(&host, &cx, memory, flats)
        })
    }

    /// Resolves a method receiver from the leading flat parameter.
    pub fn lift_receiver(
        &self,
        reader: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Option<ResourceAny>> {
        match self.func.kind() {
            FuncKind::Method(resource) => {
                let handle = reader.take()?.as_i32()?;
                let table = cx.resources().table(resource);
                let object = table
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(handle)?;
                Ok(Some(object))
            }
            _ => Ok(None),
        }
    }

    /// Lifts the declared parameters off the calling surface, honouring
    /// the spill rule. The receiver, if any, must already be consumed.
    pub fn lift_args(
        &self,
        memory: &Memory,
        reader: &mut FlatReader<'_>,
        cx: &CallContext,
    ) -> Result<Vec<Val>> {
        let Some(param_ty) = &self.param_ty else {
            return Ok(Vec::new());
        };
        if self.spills_params() {
            let ptr = reader.take()?.as_i32()?;
            let range = memory.readonly(ptr, param_ty.size());
            self.unpack(param_ty.load(&range, 0, cx).with_context(|| {
                format!("lifting spilled parameters of `{}`", self.func.wit_name())
            })?)
        } else {
            let mut args = Vec::with_capacity(self.func.params().len());
            for (name, param) in self.func.params() {
                args.push(param.lift_flat(memory, reader, cx).with_context(|| {
                    format!("lifting parameter `{name}` of `{}`", self.func.wit_name())
                })?);
            }
            Ok(args)
        }
    }

    fn dispatch_host(
        &self,
        host: &HostFn,
        cx: &CallContext,
        memory: &Memory,
        flats: &[FlatValue],
    ) -> Result<Vec<FlatValue>> {
        log::trace!("guest -> host `{}`", self.func.wit_name());
        let mut reader = FlatReader::new(flats);
        let receiver = self.lift_receiver(&mut reader, cx)?;
        let args = self.lift_args(memory, &mut reader, cx)?;

        let ret_ptr = if self.spills_result() {
            Some(reader.take()?.as_i32()?)
        } else {
            None
        };

        let value = match host(cx, receiver, &args) {
            Ok(value) => value,
            Err(err) => Some(self.expected_error(err)?),
        };

        match (self.func.result(), value) {
            (None, None) => Ok(Vec::new()),
            (Some(result_ty), Some(value)) => {
                if let Some(ptr) = ret_ptr {
                    let range = memory.preallocated(ptr, result_ty.size());
                    result_ty
                        .store(&range, 0, &value, cx)
                        .with_context(|| format!("lowering result of `{}`", self.func.wit_name()))?;
                    Ok(Vec::new())
                } else {
                    let mut out = FlatValues::new();
                    result_ty
                        .lower_flat(&mut out, memory, &value, cx)
                        .with_context(|| format!("lowering result of `{}`", self.func.wit_name()))?;
                    Ok(out.into_vec())
                }
            }
            (None, Some(_)) => bail!(
                "handler for `{}` returned a value but none is declared",
                self.func.wit_name()
            ),
            (Some(_), None) => bail!(
                "handler for `{}` returned no value",
                self.func.wit_name()
            ),
        }
    }

    /// Routes a handler error: an [`ExpectedError`] on a `result`-returning
    /// signature becomes the `error` arm, everything else propagates.
    fn expected_error(&self, err: anyhow::Error) -> Result<Val> {
        let is_result = self
            .func
            .result()
            .map_or(false, |t| t.kind() == TypeKind::Result);
        if !is_result {
            return Err(err);
        }
        match err.downcast::<ExpectedError>() {
            Ok(expected) => Ok(Val::Result(Err(expected.0.map(Box::new)))),
            Err(err) => Err(err),
        }
    }
}
