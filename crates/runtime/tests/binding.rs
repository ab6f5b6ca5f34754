//! World binding: import construction, export proxies, resource shims and
//! the loop configuration.

use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use wasmbridge_abi::{ty, CallContext, FlatValue, FuncType, Interface, ResourceDecl, Val, World};
use wasmbridge_runtime::testing::MockInstance;
use wasmbridge_runtime::{bind_exports, bind_loop, create_imports, HostServices, ModuleInstance};

fn cx() -> CallContext {
    drop(env_logger::try_init());
    CallContext::default()
}

/// A world with one imported interface (a host function and a host
/// resource) and one exported interface (a guest function and a guest
/// resource).
fn demo_world() -> World {
    World::new("demo", "test:demo/runtime")
        .import_interface(
            Interface::new("host-api", "test:demo/host-api")
                .func(FuncType::new(
                    "double",
                    [("n", ty::u32())],
                    Some(ty::u32()),
                ))
                .resource(
                    ResourceDecl::new("store")
                        .constructor([("capacity", ty::u32())])
                        .method("used", Vec::<(String, _)>::new(), Some(ty::u32())),
                ),
        )
        .export_interface(
            Interface::new("guest-api", "test:demo/guest-api")
                .func(FuncType::new(
                    "describe",
                    [("n", ty::u32())],
                    Some(ty::string()),
                ))
                .resource(
                    ResourceDecl::new("session")
                        .constructor([("id", ty::u32())])
                        .method("id", Vec::<(String, _)>::new(), Some(ty::u32()))
                        .destructor(),
                ),
        )
}

struct Store {
    capacity: u32,
}

fn demo_services() -> HostServices {
    let mut services = HostServices::new();
    let api = services.instance("test:demo/host-api");
    api.func("double", |_cx, args| match args[0] {
        Val::U32(n) => Ok(Some(Val::U32(n * 2))),
        ref other => anyhow::bail!("unexpected argument {other:?}"),
    })
    .unwrap();
    api.resource("store")
        .constructor(|_cx, args| match args[0] {
            Val::U32(capacity) => Ok(Val::Resource(wasmbridge_abi::ResourceAny::new(Store {
                capacity,
            }))),
            ref other => anyhow::bail!("unexpected argument {other:?}"),
        })
        .method("used", |_cx, receiver, _args| {
            let store = receiver.downcast_ref::<Store>().expect("wrong receiver");
            Ok(Some(Val::U32(store.capacity / 2)))
        });
    services
}

#[test]
fn imports_cover_functions_resources_and_shims() -> Result<()> {
    let cx = cx();
    let world = demo_world();
    let imports = create_imports(&world, &demo_services(), &cx)?;

    for (module, name) in [
        ("test:demo/host-api", "double"),
        ("test:demo/host-api", "[constructor]store"),
        ("test:demo/host-api", "[method]store.used"),
        ("test:demo/host-api", "[resource-drop]store"),
        ("[export]test:demo/guest-api", "[resource-new]session"),
        ("[export]test:demo/guest-api", "[resource-rep]session"),
        ("[export]test:demo/guest-api", "[resource-drop]session"),
    ] {
        assert!(
            imports.lookup(module, name).is_some(),
            "missing import `{module}::{name}`"
        );
    }
    Ok(())
}

#[test]
fn missing_host_implementation_is_an_error() {
    let cx = cx();
    let world = demo_world();
    let err = create_imports(&world, &HostServices::new(), &cx).unwrap_err();
    assert!(err.to_string().contains("test:demo/host-api"), "{err:#}");
}

#[test]
fn host_resource_lifecycle_through_imports() -> Result<()> {
    let cx = cx();
    let world = demo_world();
    let imports = create_imports(&world, &demo_services(), &cx)?;

    let instance = MockInstance::new();
    instance.link_imports(&imports);

    // Guest constructs a store: the constructor shim returns a handle.
    let returned =
        instance.call_import("test:demo/host-api", "[constructor]store", &[FlatValue::I32(64)])?;
    let handle = match returned.as_slice() {
        [FlatValue::I32(h)] => *h,
        other => anyhow::bail!("unexpected constructor result {other:?}"),
    };

    // Guest invokes a method on the handle it holds.
    let used = instance.call_import(
        "test:demo/host-api",
        "[method]store.used",
        &[FlatValue::I32(handle)],
    )?;
    assert_eq!(used, vec![FlatValue::I32(32)]);

    // Dropping releases the table entry; the handle dies with it.
    instance.call_import(
        "test:demo/host-api",
        "[resource-drop]store",
        &[FlatValue::I32(handle)],
    )?;
    let err = instance
        .call_import(
            "test:demo/host-api",
            "[method]store.used",
            &[FlatValue::I32(handle)],
        )
        .unwrap_err();
    assert!(err.to_string().contains("unknown"), "{err:#}");
    Ok(())
}

/// Wires a mock guest implementing the exported interface of
/// [`demo_world`].
fn demo_guest(imports: &wasmbridge_runtime::ImportTable) -> Arc<MockInstance> {
    static NEXT_REP: AtomicU32 = AtomicU32::new(100);

    let instance = MockInstance::new();
    instance.link_imports(imports);

    instance.define("test:demo/guest-api#describe", |inst, args| {
        let n = match args {
            [FlatValue::I32(n)] => *n,
            other => anyhow::bail!("unexpected arguments {other:?}"),
        };
        let text = format!("value {n}");
        let ptr = inst.memory().alloc(wasmbridge_abi::Alignment::One, text.len() as u32);
        inst.memory().write_bytes(ptr, text.as_bytes())?;
        Ok(vec![FlatValue::I32(ptr), FlatValue::I32(text.len() as u32)])
    });

    instance.define("test:demo/guest-api#[constructor]session", |inst, args| {
        let id = match args {
            [FlatValue::I32(id)] => *id,
            other => anyhow::bail!("unexpected arguments {other:?}"),
        };
        // The guest stores its state under a private representation and
        // wraps it in a fresh handle through the shim.
        let rep = NEXT_REP.fetch_add(1, Ordering::Relaxed);
        inst.memory().write_u32(rep, id)?;
        inst.call_import(
            "[export]test:demo/guest-api",
            "[resource-new]session",
            &[FlatValue::I32(rep)],
        )
    });

    instance.define("test:demo/guest-api#[method]session.id", |inst, args| {
        let handle = match args {
            [FlatValue::I32(h)] => *h,
            other => anyhow::bail!("unexpected arguments {other:?}"),
        };
        let rep = match inst
            .call_import(
                "[export]test:demo/guest-api",
                "[resource-rep]session",
                &[FlatValue::I32(handle)],
            )?
            .as_slice()
        {
            [FlatValue::I32(rep)] => *rep,
            other => anyhow::bail!("unexpected rep {other:?}"),
        };
        Ok(vec![FlatValue::I32(inst.memory().read_u32(rep)?)])
    });

    instance.define("test:demo/guest-api#[dtor]session", |inst, args| {
        let rep = match args {
            [FlatValue::I32(rep)] => *rep,
            other => anyhow::bail!("unexpected arguments {other:?}"),
        };
        // Scrub the state so a double destruction would be visible.
        inst.memory().write_u32(rep, u32::MAX)?;
        Ok(Vec::new())
    });

    instance
}

#[test]
fn exported_functions_and_resources_are_callable() -> Result<()> {
    let cx = cx();
    let world = demo_world();
    let imports = create_imports(&world, &demo_services(), &cx)?;
    let instance = demo_guest(&imports);
    let instance: Arc<dyn ModuleInstance> = instance;
    let proxy = bind_exports(&world, &instance, &cx)?;

    let api = proxy
        .interface("test:demo/guest-api")
        .expect("exported interface is bound");
    assert_eq!(
        api.call("describe", &[Val::U32(7)])?,
        Some(Val::from("value 7"))
    );

    let session_class = api.resource("session").expect("resource class is bound");
    let session = session_class.construct(&[Val::U32(41)])?;
    assert_eq!(
        session_class.call_method(&session, "id", &[])?,
        Some(Val::U32(41))
    );
    Ok(())
}

#[test]
fn dropping_the_proxy_runs_the_guest_destructor() -> Result<()> {
    let cx = cx();
    let world = demo_world();
    let imports = create_imports(&world, &demo_services(), &cx)?;
    let instance = demo_guest(&imports);
    let mock = instance.clone();
    let instance: Arc<dyn ModuleInstance> = instance;
    let proxy = bind_exports(&world, &instance, &cx)?;

    let api = proxy.interface("test:demo/guest-api").expect("bound");
    let session_class = api.resource("session").expect("bound");
    let session = session_class.construct(&[Val::U32(9)])?;

    // Find the representation before letting go of the proxy.
    let handle = {
        let table = cx.resources().table("session");
        let mut table = table.lock().unwrap();
        table.handle_for(session.as_resource().unwrap())?
    };
    let rep = {
        let table = cx.resources().table("session");
        let mut table = table.lock().unwrap();
        table.representation(handle)?
    };
    assert_eq!(mock.memory().read_u32(rep)?, 9);

    drop(session);
    // The next table operation drains the release queue and invokes the
    // guest-side destructor exactly once.
    {
        let table = cx.resources().table("session");
        table.lock().unwrap().drain_released();
    }
    assert_eq!(mock.memory().read_u32(rep)?, u32::MAX);
    Ok(())
}

#[test]
fn loop_binding_swaps_the_sides() -> Result<()> {
    let cx = cx();
    // A world whose import side is also implementable by the guest: in
    // loop mode the module serves the interface it normally consumes.
    let world = World::new("looped", "test:demo/looped").import_interface(
        Interface::new("api", "test:demo/api").func(FuncType::new(
            "ping",
            [("n", ty::u32())],
            Some(ty::u32()),
        )),
    );

    let instance = MockInstance::new();
    instance.define("test:demo/api#ping", |_inst, args| match args {
        [FlatValue::I32(n)] => Ok(vec![FlatValue::I32(n + 1)]),
        other => anyhow::bail!("unexpected arguments {other:?}"),
    });
    let instance: Arc<dyn ModuleInstance> = instance;

    let (imports, proxy) = bind_loop(&world, &HostServices::new(), &instance, &cx)?;
    // The inverted world imports nothing, so the table is empty, and the
    // former import surface is now callable as an export.
    assert!(imports.modules().next().is_none());
    let api = proxy.interface("test:demo/api").expect("bound");
    assert_eq!(api.call("ping", &[Val::U32(4)])?, Some(Val::U32(5)));
    Ok(())
}
