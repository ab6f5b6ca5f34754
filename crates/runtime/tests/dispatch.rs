//! The calling convention, exercised in both directions against a mock
//! instance.

use anyhow::Result;
use std::sync::Arc;
use wasmbridge_abi::{
    ty, CallContext, ExpectedError, FlatValue, FuncKind, FuncType, ResourceAny, Val,
};
use wasmbridge_runtime::testing::MockInstance;
use wasmbridge_runtime::{Callable, GuestMemory, ModuleInstance};

fn cx() -> CallContext {
    drop(env_logger::try_init());
    CallContext::default()
}

#[test]
fn host_calls_guest_with_flat_params() -> Result<()> {
    let cx = cx();
    let instance = MockInstance::new();
    instance.define("add", |_inst, args| match args {
        [FlatValue::I32(a), FlatValue::I32(b)] => Ok(vec![FlatValue::I32(a.wrapping_add(*b))]),
        _ => anyhow::bail!("bad arguments"),
    });

    let func = Arc::new(FuncType::new(
        "add",
        [("a", ty::u32()), ("b", ty::u32())],
        Some(ty::u32()),
    ));
    let callable = Callable::new(func, "add");
    let instance: Arc<dyn ModuleInstance> = instance;
    let result = callable.call_guest(&instance, None, &[Val::U32(40), Val::U32(2)], &cx)?;
    assert_eq!(result, Some(Val::U32(42)));
    Ok(())
}

#[test]
fn twenty_params_spill_to_memory() -> Result<()> {
    let cx = cx();
    let instance = MockInstance::new();
    // The guest sees a single pointer to a struct-layout region holding
    // all twenty values, and returns its list through the spilled result
    // area passed as the trailing pointer.
    instance.define("echo20", |inst, args| {
        let (params_ptr, ret_ptr) = match args {
            [FlatValue::I32(p), FlatValue::I32(r)] => (*p, *r),
            _ => anyhow::bail!("expected exactly two pointers, got {args:?}"),
        };
        let memory = inst.memory();
        let data = memory.alloc(wasmbridge_abi::Alignment::Four, 20 * 4);
        for index in 0..20u32 {
            let value = memory.read_u32(params_ptr + index * 4)?;
            memory.write_u32(data + index * 4, value)?;
        }
        memory.write_u32(ret_ptr, data)?;
        memory.write_u32(ret_ptr + 4, 20)?;
        Ok(Vec::new())
    });

    let params: Vec<(String, _)> = (0..20).map(|i| (format!("p{i}"), ty::u32())).collect();
    let func = Arc::new(FuncType::new("echo20", params, Some(ty::list(ty::u32()))));
    let callable = Callable::new(func, "echo20");
    assert!(callable.spills_params());
    assert!(callable.spills_result());

    let args: Vec<Val> = (0..20).map(|i| Val::U32(i * 3 + 1)).collect();
    let instance: Arc<dyn ModuleInstance> = instance;
    let result = callable.call_guest(&instance, None, &args, &cx)?;
    assert_eq!(result, Some(Val::List(args)));
    Ok(())
}

#[test]
fn guest_calls_host_with_string() -> Result<()> {
    let cx = cx();
    let instance = MockInstance::new();
    let memory = GuestMemory::new(instance.clone());

    let func = Arc::new(FuncType::new(
        "greet",
        [("name", ty::string())],
        Some(ty::string()),
    ));
    let callable = Arc::new(Callable::new(func, "greet"));
    let core = callable.wrap_host(
        Arc::new(|_cx, _receiver, args| {
            let name = args[0].as_str()?;
            Ok(Some(Val::from(format!("hallo {name}"))))
        }),
        &cx,
    );

    // The guest lowers its argument into its own memory by hand.
    let ptr = instance.memory().alloc(wasmbridge_abi::Alignment::One, 4);
    instance.memory().write_bytes(ptr, "Rosa".as_bytes())?;
    let flats = [FlatValue::I32(ptr), FlatValue::I32(4)];
    let returned = core(&memory, &flats)?;

    // The host's reply lives in guest memory as a fresh (ptr, units) pair.
    assert_eq!(returned.len(), 2);
    let mut reader = wasmbridge_abi::FlatReader::new(&returned);
    let reply = ty::string().lift_flat(&memory, &mut reader, &cx)?;
    assert_eq!(reply, Val::from("hallo Rosa"));
    Ok(())
}

#[test]
fn expected_errors_become_result_error_arms() -> Result<()> {
    let cx = cx();
    let instance = MockInstance::new();
    let memory = GuestMemory::new(instance.clone());

    let func = Arc::new(FuncType::new(
        "may-fail",
        [("ok", ty::bool())],
        Some(ty::result(Some(ty::u32()), Some(ty::string()))),
    ));
    let callable = Arc::new(Callable::new(func, "may-fail"));
    let core = callable.wrap_host(
        Arc::new(|_cx, _receiver, args| match args[0] {
            Val::Bool(true) => Ok(Some(Val::Result(Ok(Some(Box::new(Val::U32(1))))))),
            _ => Err(ExpectedError::with(Val::from("nein")).into()),
        }),
        &cx,
    );

    // result<u32, string> spills: flat count exceeds the result budget, so
    // the guest passes a return area.
    let ret_ptr = 1024u32;
    let ok = core(&memory, &[FlatValue::I32(1), FlatValue::I32(ret_ptr)])?;
    assert!(ok.is_empty());
    let ret_ty = ty::result(Some(ty::u32()), Some(ty::string()));
    let range = memory.readonly(ret_ptr, ret_ty.size());
    assert_eq!(
        ret_ty.load(&range, 0, &cx)?,
        Val::Result(Ok(Some(Box::new(Val::U32(1)))))
    );

    let err = core(&memory, &[FlatValue::I32(0), FlatValue::I32(ret_ptr)])?;
    assert!(err.is_empty());
    assert_eq!(
        ret_ty.load(&range, 0, &cx)?,
        Val::Result(Err(Some(Box::new(Val::from("nein")))))
    );
    Ok(())
}

#[test]
fn unexpected_errors_propagate() {
    let cx = cx();
    let instance = MockInstance::new();
    let memory = GuestMemory::new(instance.clone());

    // The signature returns no result, so an expected error has nowhere
    // to go and must fail the call.
    let func = Arc::new(FuncType::new("run", Vec::<(String, _)>::new(), None));
    let callable = Arc::new(Callable::new(func, "run"));
    let core = callable.wrap_host(
        Arc::new(|_cx, _receiver, _args| Err(ExpectedError::empty().into())),
        &cx,
    );
    let err = core(&memory, &[]).unwrap_err();
    assert!(err.downcast_ref::<ExpectedError>().is_some());
}

#[test]
fn methods_resolve_their_receiver() -> Result<()> {
    let cx = cx();
    let instance = MockInstance::new();
    let memory = GuestMemory::new(instance.clone());

    struct Counter {
        start: u32,
    }

    let object = ResourceAny::new(Counter { start: 40 });
    let handle = {
        let table = cx.resources().table("counter");
        let handle = table.lock().unwrap().register(object, None)?;
        handle
    };

    let func = Arc::new(
        FuncType::new("value", [("extra", ty::u32())], Some(ty::u32()))
            .with_kind(FuncKind::Method("counter".to_string())),
    );
    let callable = Arc::new(Callable::new(func, "value"));
    let core = callable.wrap_host(
        Arc::new(|_cx, receiver, args| {
            let receiver = receiver.expect("method always has a receiver");
            let counter = receiver.downcast_ref::<Counter>().expect("wrong type");
            match args[0] {
                Val::U32(extra) => Ok(Some(Val::U32(counter.start + extra))),
                ref other => anyhow::bail!("unexpected argument {other:?}"),
            }
        }),
        &cx,
    );

    // The receiver's handle is the leading flat parameter.
    let returned = core(&memory, &[FlatValue::I32(handle), FlatValue::I32(2)])?;
    assert_eq!(returned, vec![FlatValue::I32(42)]);
    Ok(())
}
