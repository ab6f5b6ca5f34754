//! Resource table behaviour through the public registry API.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use wasmbridge_abi::{ProxyHooks, ResourceAny, ResourceRegistry, Trap, Val};

struct Connection {
    id: u32,
}

#[test]
fn identity_survives_a_round_trip() -> Result<()> {
    drop(env_logger::try_init());
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    let mut table = table.lock().unwrap();

    let object = ResourceAny::new(Connection { id: 9 });
    let handle = table.register(object.clone(), None)?;
    let back = table.get(handle)?;
    assert_eq!(back, object);
    assert_eq!(back.downcast_ref::<Connection>().unwrap().id, 9);

    // Dropping the handle invalidates it.
    table.remove(handle)?;
    assert!(matches!(
        table.get(handle).unwrap_err(),
        Trap::UnknownHandle { .. }
    ));
    Ok(())
}

#[test]
fn handles_increase_across_kinds_of_registration() -> Result<()> {
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    let mut table = table.lock().unwrap();

    let mut previous = 0;
    for i in 0..4 {
        let handle = if i % 2 == 0 {
            table.new_handle(i)?
        } else {
            table.register(ResourceAny::new(Connection { id: i }), None)?
        };
        assert!(handle > previous, "handle {handle} after {previous}");
        previous = handle;
    }
    Ok(())
}

#[test]
fn proxy_release_reaches_the_guest_destructor() -> Result<()> {
    drop(env_logger::try_init());
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    let destroyed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let mut table = table.lock().unwrap();
        let destroyed = destroyed.clone();
        table.set_proxy_hooks(ProxyHooks {
            ctor: Box::new(|core| Arc::new(core)),
            dtor: Box::new(move |rep| {
                destroyed.lock().unwrap().push(rep);
                Ok(())
            }),
        });
    }

    // The guest hands the host an owned resource by handle.
    let handle = table.lock().unwrap().new_handle(1234)?;
    let proxy = table.lock().unwrap().get(handle)?;
    // While the host holds the proxy the same object comes back.
    assert_eq!(table.lock().unwrap().get(handle)?, proxy);
    assert!(destroyed.lock().unwrap().is_empty());

    // Once the last host reference goes away the guest destructor runs,
    // exactly once, with the representation.
    drop(proxy);
    table.lock().unwrap().drain_released();
    table.lock().unwrap().drain_released();
    assert_eq!(*destroyed.lock().unwrap(), vec![1234]);
    Ok(())
}

#[test]
fn dtor_failures_are_swallowed() -> Result<()> {
    drop(env_logger::try_init());
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    {
        let mut table = table.lock().unwrap();
        table.set_proxy_hooks(ProxyHooks {
            ctor: Box::new(|core| Arc::new(core)),
            dtor: Box::new(|_| anyhow::bail!("guest is gone")),
        });
    }
    let handle = table.lock().unwrap().new_handle(1)?;
    let proxy = table.lock().unwrap().get(handle)?;
    drop(proxy);
    // Draining must not propagate the destructor failure.
    table.lock().unwrap().drain_released();
    assert!(matches!(
        table.lock().unwrap().representation(handle).unwrap_err(),
        Trap::UnknownHandle { .. }
    ));
    Ok(())
}

#[test]
fn loop_registration_counts_down_from_the_top() -> Result<()> {
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    let mut table = table.lock().unwrap();

    let a = table.new_handle(1)?;
    let b = table.new_handle(2)?;
    let wrapped_a = table.register_loop(a)?;
    let wrapped_b = table.register_loop(b)?;
    let rep_a = table.representation(wrapped_a)?;
    let rep_b = table.representation(wrapped_b)?;
    assert_eq!(rep_a, u32::MAX);
    assert_eq!(rep_b, u32::MAX - 1);
    assert_eq!(table.get_loop(rep_a)?, a);
    assert_eq!(table.get_loop(rep_b)?, b);
    Ok(())
}

#[test]
fn resources_can_flow_through_vals() -> Result<()> {
    let registry = ResourceRegistry::new();
    let table = registry.table("connection");
    let object = Val::Resource(ResourceAny::new(Connection { id: 3 }));
    let handle = table
        .lock()
        .unwrap()
        .handle_for(object.as_resource().unwrap())?;
    // Lowering the same value twice reuses the handle.
    assert_eq!(
        table
            .lock()
            .unwrap()
            .handle_for(object.as_resource().unwrap())?,
        handle
    );
    Ok(())
}
