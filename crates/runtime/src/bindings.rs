//! World binding: import tables for instantiation and export proxies over
//! an instance.
//!
//! [`create_imports`] walks a world's import side and wraps each
//! host-provided function as a core function, publishing the
//! `[resource-new]`/`[resource-rep]`/`[resource-drop]` shims for every
//! resource the guest exports. [`bind_exports`] walks the export side of
//! an instantiated module and builds host-callable closures, including
//! class-like access to exported resources.

use crate::engine::ModuleInstance;
use crate::func::{Callable, CoreFn, HostFn};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use std::sync::Arc;
use wasmbridge_abi::{
    world::names, CallContext, FlatReader, FlatValue, ProxyHooks, ResourceAny, ResourceDecl, Val,
    World,
};

/// The module name under which world-level imports are resolved.
pub const ROOT_MODULE: &str = "$root";

/// The functions an engine wires into a module at instantiation, grouped
/// by import module name.
#[derive(Default)]
pub struct ImportTable {
    modules: IndexMap<String, IndexMap<String, CoreFn>>,
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field(
                "modules",
                &self
                    .modules
                    .iter()
                    .map(|(name, funcs)| (name.clone(), funcs.keys().cloned().collect::<Vec<_>>()))
                    .collect::<IndexMap<_, _>>(),
            )
            .finish()
    }
}

impl ImportTable {
    /// An empty table.
    pub fn new() -> ImportTable {
        ImportTable::default()
    }

    /// Defines a function. Redefinition is an error.
    pub fn define(&mut self, module: &str, name: &str, func: CoreFn) -> Result<()> {
        let module_map = self.modules.entry(module.to_string()).or_default();
        if module_map.insert(name.to_string(), func).is_some() {
            bail!("import `{module}::{name}` defined twice");
        }
        Ok(())
    }

    /// Looks up a function by module and field name.
    pub fn lookup(&self, module: &str, name: &str) -> Option<&CoreFn> {
        self.modules.get(module)?.get(name)
    }

    /// Iterates the import modules in definition order.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &IndexMap<String, CoreFn>)> {
        self.modules.iter().map(|(name, map)| (name.as_str(), map))
    }
}

/// The destructor hook invoked when the guest drops an owned host
/// resource.
pub type HostDtor = Arc<dyn Fn(&CallContext, ResourceAny) -> Result<()> + Send + Sync>;

/// Host implementations a world's imports are resolved against.
#[derive(Default)]
pub struct HostServices {
    root: HostInstance,
    instances: IndexMap<String, HostInstance>,
}

impl HostServices {
    /// An empty service set.
    pub fn new() -> HostServices {
        HostServices::default()
    }

    /// The implementations for world-level imports.
    pub fn root(&mut self) -> &mut HostInstance {
        &mut self.root
    }

    /// The implementations for the named interface, created on first use.
    pub fn instance(&mut self, name: &str) -> &mut HostInstance {
        self.instances.entry(name.to_string()).or_default()
    }
}

/// Host implementations for one interface.
#[derive(Default)]
pub struct HostInstance {
    funcs: IndexMap<String, HostFn>,
    resources: IndexMap<String, HostResourceImpl>,
}

impl HostInstance {
    /// Provides a function implementation. Redefinition is an error.
    pub fn func<F>(&mut self, name: &str, f: F) -> Result<&mut Self>
    where
        F: Fn(&CallContext, &[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        let wrapped: HostFn = Arc::new(move |cx, _receiver, args| f(cx, args));
        if self.funcs.insert(name.to_string(), wrapped).is_some() {
            bail!("host function `{name}` defined twice");
        }
        Ok(self)
    }

    /// The implementation slot for the named resource, created on first
    /// use.
    pub fn resource(&mut self, name: &str) -> &mut HostResourceImpl {
        self.resources.entry(name.to_string()).or_default()
    }
}

/// Host implementations for one resource type.
#[derive(Default)]
pub struct HostResourceImpl {
    constructor: Option<HostFn>,
    methods: IndexMap<String, HostFn>,
    statics: IndexMap<String, HostFn>,
    dtor: Option<HostDtor>,
}

impl HostResourceImpl {
    /// Provides the constructor. It returns the freshly built host object.
    pub fn constructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&CallContext, &[Val]) -> Result<Val> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(move |cx, _receiver, args| f(cx, args).map(Some)));
        self
    }

    /// Provides a method implementation; the receiver is the registered
    /// host object.
    pub fn method<F>(&mut self, op: &str, f: F) -> &mut Self
    where
        F: Fn(&CallContext, ResourceAny, &[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        let wrapped: HostFn = Arc::new(move |cx, receiver, args| {
            let receiver = receiver.context("method invoked without a receiver")?;
            f(cx, receiver, args)
        });
        self.methods.insert(op.to_string(), wrapped);
        self
    }

    /// Provides a static function implementation.
    pub fn static_method<F>(&mut self, op: &str, f: F) -> &mut Self
    where
        F: Fn(&CallContext, &[Val]) -> Result<Option<Val>> + Send + Sync + 'static,
    {
        self.statics
            .insert(op.to_string(), Arc::new(move |cx, _receiver, args| f(cx, args)));
        self
    }

    /// Provides the destructor invoked when the guest drops an owned
    /// handle.
    pub fn destructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&CallContext, ResourceAny) -> Result<()> + Send + Sync + 'static,
    {
        self.dtor = Some(Arc::new(f));
        self
    }
}

fn export_name(interface: Option<&str>, wit_name: &str) -> String {
    match interface {
        Some(interface) => format!("{interface}#{wit_name}"),
        None => wit_name.to_string(),
    }
}

/// Builds the import table for a world from the host's service
/// implementations.
pub fn create_imports(
    world: &World,
    services: &HostServices,
    cx: &CallContext,
) -> Result<ImportTable> {
    let mut table = ImportTable::new();

    for (name, func) in world.imports().functions() {
        let host = services
            .root
            .funcs
            .get(name)
            .with_context(|| format!("no host implementation for import `{name}`"))?;
        let callable = Arc::new(Callable::new(func.clone(), name.clone()));
        table.define(ROOT_MODULE, name, callable.wrap_host(host.clone(), cx))?;
    }

    for (iface_name, iface) in world.imports().interfaces() {
        let instance = services
            .instances
            .get(iface_name)
            .with_context(|| format!("no host implementation for interface `{iface_name}`"))?;

        for (name, func) in iface.functions() {
            let host = instance.funcs.get(name).with_context(|| {
                format!("no host implementation for `{iface_name}::{name}`")
            })?;
            let callable = Arc::new(Callable::new(func.clone(), name.clone()));
            table.define(iface_name, name, callable.wrap_host(host.clone(), cx))?;
        }

        for (rname, decl) in iface.resources() {
            let imp = instance.resources.get(rname).with_context(|| {
                format!("no host implementation for resource `{iface_name}::{rname}`")
            })?;
            define_host_resource(&mut table, iface_name, rname, decl, imp, cx)?;
        }
    }

    // The guest's own resources need the handle shims.
    define_export_shims(world, cx, &mut table)?;

    Ok(table)
}

/// Adds the `[resource-new]`/`[resource-rep]`/`[resource-drop]` shims for
/// every resource the world exports. Engines that assemble their import
/// table elsewhere (the worker bridge does) call this directly.
pub fn define_export_shims(
    world: &World,
    cx: &CallContext,
    table: &mut ImportTable,
) -> Result<()> {
    for (iface_name, iface) in world.exports().interfaces() {
        let module = names::export_module(iface_name);
        for rname in iface.resources().keys() {
            define_resource_shims(table, &module, rname, cx)?;
        }
    }
    Ok(())
}

fn define_host_resource(
    table: &mut ImportTable,
    iface_name: &str,
    rname: &str,
    decl: &ResourceDecl,
    imp: &HostResourceImpl,
    cx: &CallContext,
) -> Result<()> {
    if let Some(ctor_sig) = decl.ctor() {
        let host = imp.constructor.clone().with_context(|| {
            format!("no host constructor for resource `{iface_name}::{rname}`")
        })?;
        let callable = Arc::new(Callable::new(ctor_sig.clone(), ctor_sig.wit_name().to_string()));
        table.define(iface_name, ctor_sig.wit_name(), callable.wrap_host(host, cx))?;
    }

    for (op, sig) in decl.methods() {
        let host = imp.methods.get(op).with_context(|| {
            format!("no host implementation for method `{rname}.{op}`")
        })?;
        let callable = Arc::new(Callable::new(sig.clone(), sig.wit_name().to_string()));
        table.define(iface_name, sig.wit_name(), callable.wrap_host(host.clone(), cx))?;
    }

    for (op, sig) in decl.statics() {
        let host = imp.statics.get(op).with_context(|| {
            format!("no host implementation for static `{rname}.{op}`")
        })?;
        let callable = Arc::new(Callable::new(sig.clone(), sig.wit_name().to_string()));
        table.define(iface_name, sig.wit_name(), callable.wrap_host(host.clone(), cx))?;
    }

    // Dropping an owned host resource releases the table entry and runs
    // the host-side destructor.
    let resources = cx.resources().table(rname);
    let dtor = imp.dtor.clone();
    let drop_cx = cx.clone();
    let drop_shim: CoreFn = Arc::new(move |_memory, flats| {
        let mut reader = FlatReader::new(flats);
        let handle = reader.take()?.as_i32()?;
        let mut resources = resources.lock().unwrap_or_else(|e| e.into_inner());
        let object = resources.get(handle)?;
        if let Some(dtor) = &dtor {
            dtor(&drop_cx, object)?;
        }
        resources.remove(handle)?;
        Ok(Vec::new())
    });
    table.define(iface_name, &names::resource_drop(rname), drop_shim)
}

fn define_resource_shims(
    table: &mut ImportTable,
    module: &str,
    rname: &str,
    cx: &CallContext,
) -> Result<()> {
    let resources = cx.resources().table(rname);
    let new_shim: CoreFn = {
        let resources = resources.clone();
        Arc::new(move |_memory, flats| {
            let mut reader = FlatReader::new(flats);
            let rep = reader.take()?.as_i32()?;
            let handle = resources
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .new_handle(rep)?;
            Ok(vec![FlatValue::I32(handle)])
        })
    };
    table.define(module, &names::resource_new(rname), new_shim)?;

    let rep_shim: CoreFn = {
        let resources = resources.clone();
        Arc::new(move |_memory, flats| {
            let mut reader = FlatReader::new(flats);
            let handle = reader.take()?.as_i32()?;
            let rep = resources
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .representation(handle)?;
            Ok(vec![FlatValue::I32(rep)])
        })
    };
    table.define(module, &names::resource_rep(rname), rep_shim)?;

    let drop_shim: CoreFn = Arc::new(move |_memory, flats| {
        let mut reader = FlatReader::new(flats);
        let handle = reader.take()?.as_i32()?;
        resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drop_handle(handle)?;
        Ok(Vec::new())
    });
    table.define(module, &names::resource_drop(rname), drop_shim)
}

/// A host-callable view of one exported function.
pub struct GuestFunc {
    callable: Arc<Callable>,
    instance: Arc<dyn ModuleInstance>,
    cx: CallContext,
}

impl GuestFunc {
    /// Invokes the export.
    pub fn call(&self, args: &[Val]) -> Result<Option<Val>> {
        self.callable.call_guest(&self.instance, None, args, &self.cx)
    }
}

/// A class-like view of one exported resource.
pub struct GuestResourceClass {
    resource: String,
    ctor: Option<Arc<Callable>>,
    methods: IndexMap<String, Arc<Callable>>,
    statics: IndexMap<String, Arc<Callable>>,
    instance: Arc<dyn ModuleInstance>,
    cx: CallContext,
}

impl GuestResourceClass {
    /// Creates a fresh guest-owned instance through the constructor. The
    /// returned value is the host-side proxy.
    pub fn construct(&self, args: &[Val]) -> Result<Val> {
        let ctor = self
            .ctor
            .as_ref()
            .with_context(|| format!("resource `{}` has no constructor", self.resource))?;
        ctor.call_guest(&self.instance, None, args, &self.cx)?
            .with_context(|| format!("constructor of `{}` returned nothing", self.resource))
    }

    /// Invokes a method on a previously constructed instance.
    pub fn call_method(&self, receiver: &Val, op: &str, args: &[Val]) -> Result<Option<Val>> {
        let callable = self
            .methods
            .get(op)
            .with_context(|| format!("resource `{}` has no method `{op}`", self.resource))?;
        let handle = {
            let table = self.cx.resources().table(&self.resource);
            let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
            table.handle_for(receiver.as_resource()?)?
        };
        callable.call_guest(&self.instance, Some(handle), args, &self.cx)
    }

    /// Invokes a static function.
    pub fn call_static(&self, op: &str, args: &[Val]) -> Result<Option<Val>> {
        let callable = self
            .statics
            .get(op)
            .with_context(|| format!("resource `{}` has no static `{op}`", self.resource))?;
        callable.call_guest(&self.instance, None, args, &self.cx)
    }
}

/// A host-callable view of one exported interface.
pub struct GuestInterface {
    functions: IndexMap<String, GuestFunc>,
    resources: IndexMap<String, Arc<GuestResourceClass>>,
}

impl GuestInterface {
    /// The named function.
    pub fn func(&self, name: &str) -> Option<&GuestFunc> {
        self.functions.get(name)
    }

    /// Invokes the named function.
    pub fn call(&self, name: &str, args: &[Val]) -> Result<Option<Val>> {
        self.func(name)
            .with_context(|| format!("no exported function `{name}`"))?
            .call(args)
    }

    /// The named resource class.
    pub fn resource(&self, name: &str) -> Option<&Arc<GuestResourceClass>> {
        self.resources.get(name)
    }
}

/// A host-callable view of everything a world exports.
pub struct GuestProxy {
    functions: IndexMap<String, GuestFunc>,
    interfaces: IndexMap<String, GuestInterface>,
}

impl GuestProxy {
    /// The named world-level function.
    pub fn func(&self, name: &str) -> Option<&GuestFunc> {
        self.functions.get(name)
    }

    /// Invokes the named world-level function.
    pub fn call(&self, name: &str, args: &[Val]) -> Result<Option<Val>> {
        self.func(name)
            .with_context(|| format!("no exported function `{name}`"))?
            .call(args)
    }

    /// The named exported interface.
    pub fn interface(&self, name: &str) -> Option<&GuestInterface> {
        self.interfaces.get(name)
    }
}

/// Binds a world's exports against an instantiated module.
///
/// Installs the proxy hooks for every exported resource so that owned
/// handles lifted later manufacture host proxies whose collection drives
/// the guest destructor.
pub fn bind_exports(
    world: &World,
    instance: &Arc<dyn ModuleInstance>,
    cx: &CallContext,
) -> Result<GuestProxy> {
    let mut functions = IndexMap::new();
    for (name, func) in world.exports().functions() {
        functions.insert(
            name.clone(),
            GuestFunc {
                callable: Arc::new(Callable::new(func.clone(), export_name(None, name))),
                instance: instance.clone(),
                cx: cx.clone(),
            },
        );
    }

    let mut interfaces = IndexMap::new();
    for (iface_name, iface) in world.exports().interfaces() {
        let mut bound = GuestInterface {
            functions: IndexMap::new(),
            resources: IndexMap::new(),
        };
        for (name, func) in iface.functions() {
            bound.functions.insert(
                name.clone(),
                GuestFunc {
                    callable: Arc::new(Callable::new(
                        func.clone(),
                        export_name(Some(iface_name), name),
                    )),
                    instance: instance.clone(),
                    cx: cx.clone(),
                },
            );
        }
        for (rname, decl) in iface.resources() {
            install_proxy_hooks(iface_name, rname, decl, instance, cx);
            let class = GuestResourceClass {
                resource: rname.clone(),
                ctor: decl.ctor().map(|sig| {
                    Arc::new(Callable::new(
                        sig.clone(),
                        export_name(Some(iface_name), sig.wit_name()),
                    ))
                }),
                methods: decl
                    .methods()
                    .iter()
                    .map(|(op, sig)| {
                        (
                            op.clone(),
                            Arc::new(Callable::new(
                                sig.clone(),
                                export_name(Some(iface_name), sig.wit_name()),
                            )),
                        )
                    })
                    .collect(),
                statics: decl
                    .statics()
                    .iter()
                    .map(|(op, sig)| {
                        (
                            op.clone(),
                            Arc::new(Callable::new(
                                sig.clone(),
                                export_name(Some(iface_name), sig.wit_name()),
                            )),
                        )
                    })
                    .collect(),
                instance: instance.clone(),
                cx: cx.clone(),
            };
            bound.resources.insert(rname.clone(), Arc::new(class));
        }
        interfaces.insert(iface_name.clone(), bound);
    }

    Ok(GuestProxy {
        functions,
        interfaces,
    })
}

fn install_proxy_hooks(
    iface_name: &str,
    rname: &str,
    decl: &ResourceDecl,
    instance: &Arc<dyn ModuleInstance>,
    cx: &CallContext,
) {
    let dtor_export = export_name(Some(iface_name), &names::dtor(rname));
    let has_dtor = decl.has_destructor() && instance.has_export(&dtor_export);
    let dtor_instance = instance.clone();
    let hooks = ProxyHooks {
        ctor: Box::new(|core| Arc::new(core)),
        dtor: Box::new(move |rep| {
            if has_dtor {
                dtor_instance.invoke(&dtor_export, &[FlatValue::I32(rep)])?;
            }
            Ok(())
        }),
    };
    let table = cx.resources().table(rname);
    table
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .set_proxy_hooks(hooks);
}

/// Re-runs both halves of binding with the world's sides swapped, so one
/// instance can serve as both client and server.
pub fn bind_loop(
    world: &World,
    services: &HostServices,
    instance: &Arc<dyn ModuleInstance>,
    cx: &CallContext,
) -> Result<(ImportTable, GuestProxy)> {
    let inverted = world.invert();
    let imports = create_imports(&inverted, services, cx)?;
    let exports = bind_exports(&inverted, instance, cx)?;
    Ok((imports, exports))
}
