//! Static interface metadata: what a world imports and exports.
//!
//! These records are produced by tooling outside this crate and consumed
//! read-only by the binding walk. Maps preserve declaration order.

use crate::codec::TypeHandle;
use indexmap::IndexMap;
use std::sync::Arc;

/// Shim and export name mangling for resource callables.
pub mod names {
    /// The export name of a resource constructor.
    pub fn constructor(resource: &str) -> String {
        format!("[constructor]{resource}")
    }

    /// The export name of a resource method.
    pub fn method(resource: &str, op: &str) -> String {
        format!("[method]{resource}.{op}")
    }

    /// The export name of a resource static function.
    pub fn static_method(resource: &str, op: &str) -> String {
        format!("[static]{resource}.{op}")
    }

    /// The export name of a resource destructor.
    pub fn dtor(resource: &str) -> String {
        format!("[dtor]{resource}")
    }

    /// The import name of the handle-minting shim.
    pub fn resource_new(resource: &str) -> String {
        format!("[resource-new]{resource}")
    }

    /// The import name of the representation shim.
    pub fn resource_rep(resource: &str) -> String {
        format!("[resource-rep]{resource}")
    }

    /// The import name of the handle-release shim.
    pub fn resource_drop(resource: &str) -> String {
        format!("[resource-drop]{resource}")
    }

    /// The module name under which an exported interface's shims are
    /// imported.
    pub fn export_module(interface: &str) -> String {
        format!("[export]{interface}")
    }
}

/// What a callable is, which decides how its receiver and result are
/// treated during dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FuncKind {
    /// A plain function.
    Freestanding,
    /// A constructor of the named resource; the result is a fresh handle.
    Constructor(String),
    /// A method of the named resource; the receiver's handle is the first
    /// calling-surface parameter.
    Method(String),
    /// A static function of the named resource.
    Static(String),
    /// The destructor of the named resource, invoked with a representation.
    Destructor(String),
}

/// The signature of one callable.
#[derive(Debug)]
pub struct FuncType {
    wit_name: String,
    kind: FuncKind,
    params: Vec<(String, TypeHandle)>,
    result: Option<TypeHandle>,
}

impl FuncType {
    /// A plain function signature.
    pub fn new<N: Into<String>>(
        wit_name: impl Into<String>,
        params: impl IntoIterator<Item = (N, TypeHandle)>,
        result: Option<TypeHandle>,
    ) -> FuncType {
        FuncType {
            wit_name: wit_name.into(),
            kind: FuncKind::Freestanding,
            params: params
                .into_iter()
                .map(|(n, t)| (n.into(), t))
                .collect(),
            result,
        }
    }

    /// Reshapes this signature as a resource callable of the given kind.
    pub fn with_kind(mut self, kind: FuncKind) -> FuncType {
        self.kind = kind;
        self
    }

    /// The name this callable is exported or imported under.
    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    /// What kind of callable this is.
    pub fn kind(&self) -> &FuncKind {
        &self.kind
    }

    /// The declared parameters, in order. Method receivers are not listed.
    pub fn params(&self) -> &[(String, TypeHandle)] {
        &self.params
    }

    /// The declared result type, if any.
    pub fn result(&self) -> Option<&TypeHandle> {
        self.result.as_ref()
    }
}

/// The callables of one resource type.
#[derive(Debug, Default)]
pub struct ResourceDecl {
    wit_name: String,
    constructor: Option<Arc<FuncType>>,
    destructor: bool,
    methods: IndexMap<String, Arc<FuncType>>,
    statics: IndexMap<String, Arc<FuncType>>,
}

impl ResourceDecl {
    /// A resource declaration with no callables.
    pub fn new(wit_name: impl Into<String>) -> ResourceDecl {
        ResourceDecl {
            wit_name: wit_name.into(),
            constructor: None,
            destructor: false,
            methods: IndexMap::new(),
            statics: IndexMap::new(),
        }
    }

    /// Declares the constructor.
    pub fn constructor<N: Into<String>>(
        mut self,
        params: impl IntoIterator<Item = (N, TypeHandle)>,
    ) -> ResourceDecl {
        let result = Some(crate::codec::ty::own(self.wit_name.clone()));
        let func = FuncType::new(names::constructor(&self.wit_name), params, result)
            .with_kind(FuncKind::Constructor(self.wit_name.clone()));
        self.constructor = Some(Arc::new(func));
        self
    }

    /// Declares that the resource has a guest-side destructor export.
    pub fn destructor(mut self) -> ResourceDecl {
        self.destructor = true;
        self
    }

    /// Declares a method.
    pub fn method<N: Into<String>>(
        mut self,
        op: impl Into<String>,
        params: impl IntoIterator<Item = (N, TypeHandle)>,
        result: Option<TypeHandle>,
    ) -> ResourceDecl {
        let op = op.into();
        let func = FuncType::new(names::method(&self.wit_name, &op), params, result)
            .with_kind(FuncKind::Method(self.wit_name.clone()));
        self.methods.insert(op, Arc::new(func));
        self
    }

    /// Declares a static function.
    pub fn static_method<N: Into<String>>(
        mut self,
        op: impl Into<String>,
        params: impl IntoIterator<Item = (N, TypeHandle)>,
        result: Option<TypeHandle>,
    ) -> ResourceDecl {
        let op = op.into();
        let func = FuncType::new(names::static_method(&self.wit_name, &op), params, result)
            .with_kind(FuncKind::Static(self.wit_name.clone()));
        self.statics.insert(op, Arc::new(func));
        self
    }

    /// The resource type name.
    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    /// The constructor, if declared.
    pub fn ctor(&self) -> Option<&Arc<FuncType>> {
        self.constructor.as_ref()
    }

    /// Whether the guest exports a destructor for this resource.
    pub fn has_destructor(&self) -> bool {
        self.destructor
    }

    /// The declared methods, keyed by operation name.
    pub fn methods(&self) -> &IndexMap<String, Arc<FuncType>> {
        &self.methods
    }

    /// The declared statics, keyed by operation name.
    pub fn statics(&self) -> &IndexMap<String, Arc<FuncType>> {
        &self.statics
    }
}

/// One named interface: a bag of functions and resources.
#[derive(Debug, Default)]
pub struct Interface {
    id: String,
    wit_name: String,
    functions: IndexMap<String, Arc<FuncType>>,
    resources: IndexMap<String, Arc<ResourceDecl>>,
}

impl Interface {
    /// An empty interface.
    pub fn new(id: impl Into<String>, wit_name: impl Into<String>) -> Interface {
        Interface {
            id: id.into(),
            wit_name: wit_name.into(),
            functions: IndexMap::new(),
            resources: IndexMap::new(),
        }
    }

    /// Adds a function.
    pub fn func(mut self, func: FuncType) -> Interface {
        self.functions
            .insert(func.wit_name().to_string(), Arc::new(func));
        self
    }

    /// Adds a resource.
    pub fn resource(mut self, decl: ResourceDecl) -> Interface {
        self.resources
            .insert(decl.wit_name().to_string(), Arc::new(decl));
        self
    }

    /// The interface identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The fully qualified interface name.
    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    /// The functions, keyed by export name.
    pub fn functions(&self) -> &IndexMap<String, Arc<FuncType>> {
        &self.functions
    }

    /// The resources, keyed by type name.
    pub fn resources(&self) -> &IndexMap<String, Arc<ResourceDecl>> {
        &self.resources
    }
}

/// One side of a world: the functions and interfaces it imports or
/// exports.
#[derive(Clone, Debug, Default)]
pub struct WorldSide {
    functions: IndexMap<String, Arc<FuncType>>,
    interfaces: IndexMap<String, Arc<Interface>>,
}

impl WorldSide {
    /// The freestanding functions on this side.
    pub fn functions(&self) -> &IndexMap<String, Arc<FuncType>> {
        &self.functions
    }

    /// The interfaces on this side.
    pub fn interfaces(&self) -> &IndexMap<String, Arc<Interface>> {
        &self.interfaces
    }
}

/// The read-only description of a component's boundary.
#[derive(Clone, Debug)]
pub struct World {
    id: String,
    wit_name: String,
    imports: WorldSide,
    exports: WorldSide,
}

impl World {
    /// An empty world.
    pub fn new(id: impl Into<String>, wit_name: impl Into<String>) -> World {
        World {
            id: id.into(),
            wit_name: wit_name.into(),
            imports: WorldSide::default(),
            exports: WorldSide::default(),
        }
    }

    /// Adds an imported freestanding function.
    pub fn import_func(mut self, func: FuncType) -> World {
        self.imports
            .functions
            .insert(func.wit_name().to_string(), Arc::new(func));
        self
    }

    /// Adds an imported interface.
    pub fn import_interface(mut self, interface: Interface) -> World {
        self.imports
            .interfaces
            .insert(interface.wit_name().to_string(), Arc::new(interface));
        self
    }

    /// Adds an exported freestanding function.
    pub fn export_func(mut self, func: FuncType) -> World {
        self.exports
            .functions
            .insert(func.wit_name().to_string(), Arc::new(func));
        self
    }

    /// Adds an exported interface.
    pub fn export_interface(mut self, interface: Interface) -> World {
        self.exports
            .interfaces
            .insert(interface.wit_name().to_string(), Arc::new(interface));
        self
    }

    /// The world identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The fully qualified world name.
    pub fn wit_name(&self) -> &str {
        &self.wit_name
    }

    /// The import side.
    pub fn imports(&self) -> &WorldSide {
        &self.imports
    }

    /// The export side.
    pub fn exports(&self) -> &WorldSide {
        &self.exports
    }

    /// The same world with imports and exports swapped, for the loop
    /// configuration where one module plays both client and server.
    pub fn invert(&self) -> World {
        World {
            id: self.id.clone(),
            wit_name: self.wit_name.clone(),
            imports: self.exports.clone(),
            exports: self.imports.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ty;

    #[test]
    fn shim_names() {
        assert_eq!(names::constructor("file"), "[constructor]file");
        assert_eq!(names::method("file", "read"), "[method]file.read");
        assert_eq!(names::static_method("file", "open"), "[static]file.open");
        assert_eq!(names::dtor("file"), "[dtor]file");
        assert_eq!(names::resource_new("file"), "[resource-new]file");
        assert_eq!(names::export_module("ns:pkg/fs"), "[export]ns:pkg/fs");
    }

    #[test]
    fn invert_swaps_sides() {
        let world = World::new("w", "test:demo/w")
            .import_func(FuncType::new("log", [("msg", ty::string())], None))
            .export_func(FuncType::new("run", Vec::<(String, _)>::new(), None));
        let inverted = world.invert();
        assert!(inverted.imports().functions().contains_key("run"));
        assert!(inverted.exports().functions().contains_key("log"));
    }
}
