//! Handle tables for host and guest owned resources.
//!
//! Each resource type gets its own [`ResourceTable`]. Handles are positive
//! 32-bit integers issued from a counter that never reuses a value, so a
//! handle observed after a register/drop cycle can never alias an older
//! one. Host-owned objects are held strongly; proxies for guest-owned
//! resources are held weakly and release their guest half through a channel
//! drained by the table (the finalisation queue of a runtime without a
//! garbage collector).

use crate::trap::Trap;
use crate::val::ResourceAny;
use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};

type Object = Arc<dyn Any + Send + Sync>;

/// The two halves a table needs to manufacture proxies on demand.
pub struct ProxyHooks {
    /// Builds the host-side stand-in for a guest-owned resource. The
    /// returned object must keep the [`ProxyCore`] alive for as long as the
    /// proxy is reachable.
    pub ctor: Box<dyn Fn(ProxyCore) -> Object + Send + Sync>,
    /// Invoked with the representation once the proxy is collected.
    pub dtor: Box<dyn Fn(u32) -> anyhow::Result<()> + Send + Sync>,
}

/// The identity of a proxy. Dropping the core posts the release that
/// eventually runs the guest-side destructor.
pub struct ProxyCore {
    handle: u32,
    rep: u32,
    // Mutex-wrapped so proxies can be shared across threads; the channel
    // itself is single-producer-per-clone.
    release: Mutex<Sender<Released>>,
}

impl ProxyCore {
    /// The handle the guest knows this resource by.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The guest's representation of this resource.
    pub fn rep(&self) -> u32 {
        self.rep
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        // The table may already be gone during teardown; nothing to do then.
        if let Ok(release) = self.release.lock() {
            let _ = release.send(Released {
                handle: self.handle,
                rep: self.rep,
            });
        }
    }
}

struct Released {
    handle: u32,
    rep: u32,
}

/// The handle table for one resource type.
pub struct ResourceTable {
    name: String,
    counter: u32,
    handles: HashMap<u32, u32>,
    strong: HashMap<u32, Object>,
    weak: HashMap<u32, Weak<dyn Any + Send + Sync>>,
    by_identity: HashMap<usize, u32>,
    hooks: Option<ProxyHooks>,
    loop_handles: HashMap<u32, u32>,
    next_loop_rep: u32,
    release_tx: Sender<Released>,
    release_rx: Receiver<Released>,
}

impl ResourceTable {
    /// An empty table for the named resource type.
    pub fn new(name: impl Into<String>) -> ResourceTable {
        let (release_tx, release_rx) = channel();
        ResourceTable {
            name: name.into(),
            counter: 1,
            handles: HashMap::new(),
            strong: HashMap::new(),
            weak: HashMap::new(),
            by_identity: HashMap::new(),
            hooks: None,
            loop_handles: HashMap::new(),
            next_loop_rep: u32::MAX,
            release_tx,
            release_rx,
        }
    }

    /// The resource type this table manages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the constructor/destructor pair used for guest-owned
    /// proxies.
    pub fn set_proxy_hooks(&mut self, hooks: ProxyHooks) {
        self.hooks = Some(hooks);
    }

    fn next_handle(&mut self) -> Result<u32, Trap> {
        let handle = self.counter;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| Trap::HandleSpaceExhausted {
                resource: self.name.clone(),
            })?;
        Ok(handle)
    }

    /// Issues a fresh handle for `rep`.
    pub fn new_handle(&mut self, rep: u32) -> Result<u32, Trap> {
        self.drain_released();
        let handle = self.next_handle()?;
        self.handles.insert(handle, rep);
        Ok(handle)
    }

    /// The representation recorded for `handle`.
    pub fn representation(&mut self, handle: u32) -> Result<u32, Trap> {
        self.drain_released();
        self.handles
            .get(&handle)
            .copied()
            .ok_or_else(|| Trap::UnknownHandle {
                resource: self.name.clone(),
                handle,
            })
    }

    /// Releases `handle`: runs the destructor hook when one is installed,
    /// removes every table entry, and returns the representation.
    pub fn drop_handle(&mut self, handle: u32) -> Result<u32, Trap> {
        self.drain_released();
        let rep = self
            .handles
            .remove(&handle)
            .ok_or_else(|| Trap::UnknownHandle {
                resource: self.name.clone(),
                handle,
            })?;
        if let Some(hooks) = &self.hooks {
            if let Err(err) = (hooks.dtor)(rep) {
                log::warn!("destructor for {} rep {rep} failed: {err:#}", self.name);
            }
        }
        self.strong.remove(&handle);
        self.weak.remove(&handle);
        self.by_identity.retain(|_, h| *h != handle);
        self.loop_handles.remove(&rep);
        Ok(rep)
    }

    /// Registers a host-owned object, optionally under a handle that was
    /// issued earlier. Explicit handles must not be present in either the
    /// handle or the object table.
    pub fn register(&mut self, object: ResourceAny, handle: Option<u32>) -> Result<u32, Trap> {
        self.drain_released();
        let handle = match handle {
            Some(handle) => {
                if handle >= self.counter {
                    return Err(Trap::HandleNotIssued {
                        resource: self.name.clone(),
                        handle,
                    });
                }
                if self.handles.contains_key(&handle)
                    || self.strong.contains_key(&handle)
                    || self.weak.contains_key(&handle)
                {
                    return Err(Trap::DuplicateHandle {
                        resource: self.name.clone(),
                        handle,
                    });
                }
                handle
            }
            None => self.next_handle()?,
        };
        self.by_identity.insert(object.identity(), handle);
        self.strong.insert(handle, object.object().clone());
        Ok(handle)
    }

    /// Registers a proxy for a guest-owned resource. The handle must
    /// already be known to the handle table unless `rep` supplies the
    /// missing representation.
    pub fn register_proxy(
        &mut self,
        handle: u32,
        rep: Option<u32>,
        proxy: &ResourceAny,
    ) -> Result<(), Trap> {
        self.drain_released();
        if !self.handles.contains_key(&handle) {
            match rep {
                Some(rep) => {
                    self.handles.insert(handle, rep);
                }
                None => {
                    return Err(Trap::UnknownHandle {
                        resource: self.name.clone(),
                        handle,
                    })
                }
            }
        }
        self.by_identity.insert(proxy.identity(), handle);
        self.weak.insert(handle, Arc::downgrade(proxy.object()));
        Ok(())
    }

    /// A release-channel core for a proxy the caller is about to build by
    /// hand; registered proxies built through [`ResourceTable::get`] receive
    /// theirs automatically.
    pub fn proxy_core(&self, handle: u32, rep: u32) -> ProxyCore {
        ProxyCore {
            handle,
            rep,
            release: Mutex::new(self.release_tx.clone()),
        }
    }

    /// Resolves `handle` to the registered object, upgrading a weak proxy
    /// entry or constructing a proxy on first sight.
    pub fn get(&mut self, handle: u32) -> Result<ResourceAny, Trap> {
        self.drain_released();
        if let Some(object) = self.strong.get(&handle) {
            return Ok(ResourceAny::from_arc(object.clone()));
        }
        if let Some(weak) = self.weak.get(&handle) {
            return match weak.upgrade() {
                Some(object) => Ok(ResourceAny::from_arc(object)),
                None => Err(Trap::ProxyCollected {
                    resource: self.name.clone(),
                    handle,
                }),
            };
        }
        let rep = self
            .handles
            .get(&handle)
            .copied()
            .ok_or_else(|| Trap::UnknownHandle {
                resource: self.name.clone(),
                handle,
            })?;
        let hooks = self.hooks.as_ref().ok_or_else(|| Trap::NoProxyConstructor {
            resource: self.name.clone(),
        })?;
        let core = ProxyCore {
            handle,
            rep,
            release: Mutex::new(self.release_tx.clone()),
        };
        let object = (hooks.ctor)(core);
        let proxy = ResourceAny::from_arc(object);
        self.by_identity.insert(proxy.identity(), handle);
        self.weak.insert(handle, Arc::downgrade(proxy.object()));
        Ok(proxy)
    }

    /// The handle an object is registered under, registering it afresh when
    /// it has never crossed the boundary before.
    pub fn handle_for(&mut self, object: &ResourceAny) -> Result<u32, Trap> {
        self.drain_released();
        if let Some(handle) = self.by_identity.get(&object.identity()) {
            return Ok(*handle);
        }
        self.register(object.clone(), None)
    }

    /// Removes a host-owned object by handle. Weak proxy entries are
    /// managed by finalisation and cannot be removed this way.
    pub fn remove(&mut self, handle: u32) -> Result<(), Trap> {
        self.drain_released();
        if self.weak.contains_key(&handle) {
            return Err(Trap::RemoveProxy {
                resource: self.name.clone(),
                handle,
            });
        }
        if self.strong.remove(&handle).is_none() {
            return Err(Trap::UnknownHandle {
                resource: self.name.clone(),
                handle,
            });
        }
        self.by_identity.retain(|_, h| *h != handle);
        Ok(())
    }

    /// Removes a host-owned object by identity.
    pub fn remove_object(&mut self, object: &ResourceAny) -> Result<u32, Trap> {
        self.drain_released();
        let handle = self
            .by_identity
            .get(&object.identity())
            .copied()
            .ok_or_else(|| Trap::UnregisteredObject {
                resource: self.name.clone(),
            })?;
        self.remove(handle)?;
        Ok(handle)
    }

    /// Wraps an existing handle for the loop configuration where one module
    /// serves both sides: mints a synthetic representation (counting down
    /// from the top of the space) and a fresh handle bound to it.
    pub fn register_loop(&mut self, handle: u32) -> Result<u32, Trap> {
        self.drain_released();
        let rep = self.next_loop_rep;
        self.next_loop_rep = self.next_loop_rep.wrapping_sub(1);
        let wrapped = self.next_handle()?;
        self.handles.insert(wrapped, rep);
        self.loop_handles.insert(rep, handle);
        Ok(wrapped)
    }

    /// Resolves a synthetic representation back to the handle it wraps.
    pub fn get_loop(&mut self, rep: u32) -> Result<u32, Trap> {
        self.drain_released();
        self.loop_handles
            .get(&rep)
            .copied()
            .ok_or_else(|| Trap::UnknownLoopRep {
                resource: self.name.clone(),
                rep,
            })
    }

    /// Processes queued proxy releases: runs the destructor hook for each
    /// (failures are logged, never propagated) and deletes the entries.
    pub fn drain_released(&mut self) {
        while let Ok(released) = self.release_rx.try_recv() {
            if let Some(hooks) = &self.hooks {
                if let Err(err) = (hooks.dtor)(released.rep) {
                    log::warn!(
                        "destructor for {} rep {} failed: {err:#}",
                        self.name,
                        released.rep
                    );
                }
            }
            self.handles.remove(&released.handle);
            self.weak.remove(&released.handle);
            self.by_identity.retain(|_, h| *h != released.handle);
            self.loop_handles.remove(&released.rep);
        }
    }
}

/// All resource tables of one world, keyed by resource type name.
#[derive(Clone)]
pub struct ResourceRegistry {
    tables: Arc<Mutex<HashMap<String, Arc<Mutex<ResourceTable>>>>>,
}

impl ResourceRegistry {
    /// An empty registry.
    pub fn new() -> ResourceRegistry {
        ResourceRegistry {
            tables: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The table for the named resource type, created on first use.
    pub fn table(&self, name: &str) -> Arc<Mutex<ResourceTable>> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ResourceTable::new(name))))
            .clone()
    }
}

impl Default for ResourceRegistry {
    fn default() -> ResourceRegistry {
        ResourceRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing(#[allow(dead_code)] u32);

    #[test]
    fn handles_are_monotonic() {
        let mut table = ResourceTable::new("r");
        let a = table.new_handle(10).unwrap();
        let b = table.new_handle(11).unwrap();
        let c = table.new_handle(12).unwrap();
        assert!(a < b && b < c);
        assert_eq!(table.representation(b).unwrap(), 11);
    }

    #[test]
    fn register_and_get_preserves_identity() {
        let mut table = ResourceTable::new("r");
        let object = ResourceAny::new(Thing(1));
        let handle = table.register(object.clone(), None).unwrap();
        let back = table.get(handle).unwrap();
        assert_eq!(back, object);
        assert_eq!(table.handle_for(&object).unwrap(), handle);
    }

    #[test]
    fn register_rejects_taken_handles() {
        let mut table = ResourceTable::new("r");
        let first = table.register(ResourceAny::new(Thing(1)), None).unwrap();
        let err = table
            .register(ResourceAny::new(Thing(2)), Some(first))
            .unwrap_err();
        assert!(matches!(err, Trap::DuplicateHandle { .. }));
        // A handle the counter never issued is rejected as well.
        let err = table
            .register(ResourceAny::new(Thing(3)), Some(999))
            .unwrap_err();
        assert!(matches!(err, Trap::HandleNotIssued { .. }));
    }

    #[test]
    fn drop_then_get_fails() {
        let mut table = ResourceTable::new("r");
        let handle = table.new_handle(7).unwrap();
        assert_eq!(table.drop_handle(handle).unwrap(), 7);
        assert!(matches!(
            table.get(handle).unwrap_err(),
            Trap::UnknownHandle { .. }
        ));
    }

    #[test]
    fn proxy_finalisation_runs_dtor_once() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut table = ResourceTable::new("r");
        let log = dropped.clone();
        table.set_proxy_hooks(ProxyHooks {
            ctor: Box::new(|core| Arc::new(core)),
            dtor: Box::new(move |rep| {
                log.lock().unwrap().push(rep);
                Ok(())
            }),
        });
        let handle = table.new_handle(42).unwrap();
        let proxy = table.get(handle).unwrap();
        // The proxy is alive, so nothing has been released yet.
        table.drain_released();
        assert!(dropped.lock().unwrap().is_empty());
        drop(proxy);
        table.drain_released();
        assert_eq!(*dropped.lock().unwrap(), vec![42]);
        assert!(matches!(
            table.representation(handle).unwrap_err(),
            Trap::UnknownHandle { .. }
        ));
    }

    #[test]
    fn weak_entries_cannot_be_removed() {
        let mut table = ResourceTable::new("r");
        table.set_proxy_hooks(ProxyHooks {
            ctor: Box::new(|core| Arc::new(core)),
            dtor: Box::new(|_| Ok(())),
        });
        let handle = table.new_handle(1).unwrap();
        let _proxy = table.get(handle).unwrap();
        assert!(matches!(
            table.remove(handle).unwrap_err(),
            Trap::RemoveProxy { .. }
        ));
    }

    #[test]
    fn loop_table_round_trip() {
        let mut table = ResourceTable::new("r");
        let handle = table.new_handle(5).unwrap();
        let wrapped = table.register_loop(handle).unwrap();
        assert_ne!(wrapped, handle);
        let rep = table.representation(wrapped).unwrap();
        assert_eq!(rep, u32::MAX);
        assert_eq!(table.get_loop(rep).unwrap(), handle);
        assert!(matches!(
            table.get_loop(3).unwrap_err(),
            Trap::UnknownLoopRep { .. }
        ));
    }
}
