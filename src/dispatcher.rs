//! Dispatcher / request engine: validates and handles every incoming
//! message kind, enforcing lock discipline, recursion depth, and
//! synchronous/async execution mode (`spec.md` §4.6).
//!
//! Rust has no runtime reflection, so "invoking a callable" here means
//! calling through the [`Invokable`] trait a registered [`HostObject`]
//! implements itself — the same closed-registration model
//! [`crate::registry`] uses for descriptors. This mirrors how the
//! teacher's `commands::Command` enum dispatches each parsed transaction
//! to its own `process` method (`commands/mod.rs`), just keyed by
//! `(message kind, type, callable index)` instead of a transaction type
//! code.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use crate::{
    callback::{CallbackEngine, CallbackOutcome, CallbackProxyHandle, WellKnownInterface, find_single_abstract_method},
    config::EngineConfig,
    error::EngineError,
    handles::HandleTable,
    ids::{Handle, LogicalThreadId, RequestId, TypeId},
    locks::LockManager,
    marshal::Value,
    registry::{CallableDescriptor, TypeDescriptor, TypeRegistry},
    workers::{CallFuture, MethodCallerPool},
};

/// How the dispatcher should render a method/constructor call's return
/// value (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnFormat {
    /// By handle, opportunistically inlined for small strings/boxes.
    ByReference,
    /// By a client-owned reference; only valid for a client-owned result.
    ByClientReference,
    /// Raw, length-prefixed pickle bytes.
    ByPickle,
    /// Compressed pickle bytes.
    ByCompressedPickle,
    /// Pickle bytes that fall back to a construct-call for unrepresentable
    /// types (`spec.md` §4.6, glossary "best-effort pickle").
    ByBestEffortPickle,
    /// Compressed best-effort pickle.
    ByCompressedBestEffortPickle,
    /// Via the shared-memory side channel; typed primitive arrays only.
    BySharedMemory,
}

/// Synchronous vs. asynchronous calling mode selected by the client
/// (`spec.md` §4.6, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Run inline and reply once complete.
    Synchronous,
    /// Run on a dedicated method-caller task; reply immediately with a
    /// future handle.
    NewHostThread,
}

/// A type implementing this can have its constructors/methods invoked
/// and its fields read/written by the dispatcher (`spec.md` §4.6).
/// Registered alongside a [`crate::registry::HostObject`] implementation.
pub trait Invokable: crate::registry::HostObject {
    /// Invoke the method at `index` with `args`.
    ///
    /// # Errors
    /// Returns [`EngineError::ReflectionFailure`] if the underlying call
    /// fails, or [`EngineError::MalformedRequest`] for an out-of-range
    /// index (though the dispatcher validates the index against the
    /// registry first).
    fn invoke_method(&self, index: u32, args: &[Value]) -> Result<Value, EngineError>;

    /// Read the field at `index` (or, for arrays, the element at that
    /// index).
    ///
    /// # Errors
    /// Returns [`EngineError::MalformedRequest`] for an out-of-range
    /// index.
    fn get_field(&self, index: u32) -> Result<Value, EngineError>;

    /// Write `value` to the field at `index` (or, for arrays, the element
    /// at that index).
    ///
    /// # Errors
    /// Returns [`EngineError::MalformedRequest`] for an out-of-range
    /// index, or [`EngineError::ValueConversion`] if `value` does not fit
    /// the field's declared type.
    fn set_field(&self, index: u32, value: Value) -> Result<(), EngineError>;

    /// Render this object's `toString()`-equivalent form.
    fn display_string(&self) -> String;

    /// For array objects, this array's length; `None` for non-arrays.
    fn array_length(&self) -> Option<u32> { None }
}

/// Constructs new instances of a registered type (`spec.md` §4.6
/// "method call / constructor call").
pub trait Constructible: Send + Sync {
    /// Construct a new instance by invoking the constructor at `index`.
    ///
    /// # Errors
    /// Returns [`EngineError::ReflectionFailure`] if construction fails.
    fn construct(&self, index: u32, args: &[Value]) -> Result<Arc<dyn Invokable>, EngineError>;
}

/// Allocates new array objects of a given element type and length
/// (`spec.md` §4.6 "new array").
pub trait ArrayFactory: Send + Sync {
    /// Allocate a new, zero-initialised array of `length` elements of
    /// `element_type`.
    ///
    /// # Errors
    /// Returns [`EngineError::MalformedRequest`] if `element_type` cannot
    /// be used as an array element.
    fn new_array(&self, element_type: TypeId, length: u32) -> Result<Arc<dyn Invokable>, EngineError>;
}

/// Compiles or loads classes injected at runtime (`spec.md` §4.6 "inject
/// class" / "inject source"). Dynamic source compilation itself is out of
/// scope; this trait is the narrow seam a host embedder plugs a real
/// compiler (or a fixed lookup table) into.
pub trait ClassInjector: Send + Sync {
    /// Load a type from already-compiled bytecode, registering it with the
    /// type registry and returning its assigned ID.
    ///
    /// # Errors
    /// Returns [`EngineError::ReflectionFailure`] if the bytecode is
    /// invalid or registration fails.
    fn inject_class(&self, bytecode: &[u8]) -> Result<TypeId, EngineError>;

    /// Compile `source` under the given class `name`, registering the
    /// resulting type and returning its assigned ID.
    ///
    /// # Errors
    /// Returns [`EngineError::ReflectionFailure`] if compilation fails.
    fn inject_source(&self, name: &str, source: &str) -> Result<TypeId, EngineError>;
}

/// Per-connection synchronous recursion depth guard (`spec.md` §4.6, §9):
/// an explicit counter rather than relying on stack exhaustion.
#[derive(Debug, Default)]
pub struct RecursionGuard {
    depth: AtomicU32,
    limit: u32,
}

impl RecursionGuard {
    /// Construct a guard enforcing `limit`.
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self {
            depth: AtomicU32::new(0),
            limit,
        }
    }

    /// Enter one level of synchronous recursion, returning a token that
    /// exits it on drop.
    ///
    /// # Errors
    /// Returns [`EngineError::RecursionDepthExceeded`] if this entry would
    /// exceed the configured limit.
    pub fn enter(&self) -> Result<RecursionToken<'_>, EngineError> {
        let previous = self.depth.fetch_add(1, Ordering::AcqRel);
        if previous >= self.limit {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::RecursionDepthExceeded { limit: self.limit });
        }
        Ok(RecursionToken { guard: self })
    }
}

/// RAII token exiting one level of recursion on drop.
#[derive(Debug)]
pub struct RecursionToken<'a> {
    guard: &'a RecursionGuard,
}

impl Drop for RecursionToken<'_> {
    fn drop(&mut self) { self.guard.depth.fetch_sub(1, Ordering::AcqRel); }
}

/// The result of handling a method or constructor call before it is
/// rendered to wire bytes: a value plus the type the dispatcher should
/// report for it (`spec.md` §4.2 generic-return heuristic: the runtime
/// class when the callable's return was flagged generic).
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// The produced value.
    pub value: Value,
    /// The type ID to report for `value`.
    pub reported_type: TypeId,
}

/// External hook resolving an instance lookup by name (`spec.md` §4.6
/// "instance lookup"). A narrow collaborator interface, analogous to the
/// teacher's `db::DbPool` being threaded through `handler::Context`
/// rather than owned by the dispatcher.
pub trait InstanceLookup: Send + Sync {
    /// Resolve `name` to a live object, or `None` if there is none.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Invokable>>;
}

/// Looks up the constructor factory for a registered type (`spec.md`
/// §4.6 "method call / constructor call"). The dispatcher itself has no
/// notion of which types are constructible; this is the seam a connection
/// supervisor plugs its own type-to-factory table into, same shape as
/// [`InstanceLookup`].
pub trait ConstructorRegistry: Send + Sync {
    /// Return the constructor factory registered for `type_id`, if any.
    fn constructible(&self, type_id: TypeId) -> Option<Arc<dyn Constructible>>;
}

/// Per-connection request engine (`spec.md` §4.6). Owns this
/// connection's handle table and recursion guard; the type registry and
/// lock manager are shared across connections (`spec.md` §5).
pub struct Dispatcher {
    /// Shared, process-wide type registry.
    pub registry: Arc<TypeRegistry>,
    /// This connection's handle table.
    pub handles: Arc<HandleTable>,
    /// Shared lock manager.
    pub locks: Arc<LockManager>,
    /// Engine-wide configuration.
    pub config: EngineConfig,
    /// Per-connection recursion depth guard.
    pub recursion: RecursionGuard,
    /// Instance-lookup hook.
    pub instance_lookup: Arc<dyn InstanceLookup>,
    /// Pool used for [`CallMode::NewHostThread`] calls.
    pub method_callers: MethodCallerPool,
    /// This connection's outbound callback engine.
    pub callback: Arc<CallbackEngine>,
    /// Array allocation hook.
    pub array_factory: Arc<dyn ArrayFactory>,
    /// Class injection hook; `None` disables `INJECT_CLASS`/`INJECT_SOURCE`
    /// for this connection.
    pub class_injector: Option<Arc<dyn ClassInjector>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Construct a dispatcher for one connection.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TypeRegistry>,
        locks: Arc<LockManager>,
        config: EngineConfig,
        instance_lookup: Arc<dyn InstanceLookup>,
        callback: Arc<CallbackEngine>,
        array_factory: Arc<dyn ArrayFactory>,
        class_injector: Option<Arc<dyn ClassInjector>>,
    ) -> Self {
        let recursion = RecursionGuard::new(config.recursion_depth_limit);
        Self {
            registry,
            handles: Arc::new(HandleTable::new()),
            locks,
            config,
            recursion,
            instance_lookup,
            method_callers: MethodCallerPool,
            callback,
            array_factory,
            class_injector,
        }
    }

    /// Handle `INSTANCE_LOOKUP` (`spec.md` §4.6): resolve `name` via the
    /// lookup hook and add-reference the result. A `None` name or an
    /// unresolved name both produce the null reference.
    pub fn instance_lookup(&self, name: Option<&str>) -> Handle {
        let Some(name) = name else {
            return Handle::NULL;
        };
        self.instance_lookup
            .lookup(name)
            .map_or(Handle::NULL, |object| self.handles.add_ref_object(object))
    }

    /// Handle `ADD_REF` for a list of handles.
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if any handle is not live.
    pub fn add_refs(&self, handles: &[Handle]) -> Result<(), EngineError> {
        for &handle in handles {
            self.handles.add_ref_handle(handle)?;
        }
        Ok(())
    }

    /// Handle `DROP_REF` for a list of handles.
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if any handle is not live.
    pub fn drop_refs(&self, handles: &[Handle]) -> Result<(), EngineError> {
        for &handle in handles {
            self.handles.drop_ref(handle)?;
        }
        Ok(())
    }

    /// Handle a type request by ID (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if the type is unknown.
    pub fn type_request_by_id(&self, type_id: TypeId) -> Result<TypeDescriptor, EngineError> {
        Ok(self.registry.get(type_id)?)
    }

    /// Handle a type request by canonical name, consulting the
    /// class-authorisation predicate (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] wrapping
    /// [`crate::error::RegistryError::AccessDenied`] if blocked, or
    /// `UnknownTypeName` if there is no such type.
    pub fn type_request_by_name(&self, name: &str) -> Result<TypeDescriptor, EngineError> {
        Ok(self.registry.get_by_name(name)?)
    }

    /// Handle `OBJECT_CAST` (`spec.md` §4.6): verify `handle` is
    /// assignable to `target_type`, add a new reference, and return the
    /// same handle tagged with the new type.
    ///
    /// # Errors
    /// Returns [`EngineError::ValueConversion`] if the handle's runtime
    /// type is not assignable to `target_type`, or [`EngineError::Handle`]
    /// if the handle is not live.
    pub fn cast(&self, handle: Handle, from_type: TypeId, target_type: TypeId) -> Result<Handle, EngineError> {
        if !self.registry.is_assignable(from_type, target_type) {
            return Err(EngineError::ValueConversion(
                crate::error::MarshalError::ConversionFailure {
                    target_type,
                },
            ));
        }
        self.handles.add_ref_handle(handle)?;
        Ok(handle)
    }

    /// Handle `LOCK` (`spec.md` §4.6, §4.9).
    ///
    /// # Errors
    /// Returns [`EngineError::Deadlock`] if acquisition would deadlock.
    pub fn lock(&self, thread: LogicalThreadId, name: &str) -> Result<(), EngineError> {
        Ok(self.locks.acquire(thread, name)?)
    }

    /// Handle `UNLOCK` (`spec.md` §4.6, §4.9).
    ///
    /// # Errors
    /// Returns [`EngineError::Deadlock`] (really a "not held" lock error,
    /// surfaced through the same variant since both originate from the
    /// lock manager).
    pub fn unlock(&self, thread: LogicalThreadId, name: &str) -> Result<(), EngineError> {
        Ok(self.locks.release(thread, name)?)
    }

    /// Handle `TO_STRING` (`spec.md` §4.6): `None` for the null handle,
    /// otherwise the object's rendered form.
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if `handle` is not null but also
    /// not live.
    pub fn to_string_of(&self, handle: Handle) -> Result<Option<String>, EngineError> {
        if handle.is_null() {
            return Ok(None);
        }
        let object = self.handles.lookup(handle).ok_or(crate::error::HandleError::Unknown(handle))?;
        Ok(Some(Self::as_invokable(&object)?.display_string()))
    }

    /// Handle `GET_FIELD` (`spec.md` §4.6): for array objects, `index` is
    /// treated as an array index; otherwise it indexes the type's field
    /// vector (validated by the caller via the registry).
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if `handle` is not live.
    pub fn get_field(&self, handle: Handle, index: u32) -> Result<Value, EngineError> {
        let object = self.handles.lookup(handle).ok_or(crate::error::HandleError::Unknown(handle))?;
        Self::as_invokable(&object)?.get_field(index)
    }

    /// Handle `SET_FIELD` (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if `handle` is not live.
    pub fn set_field(&self, handle: Handle, index: u32, value: Value) -> Result<(), EngineError> {
        let object = self.handles.lookup(handle).ok_or(crate::error::HandleError::Unknown(handle))?;
        Self::as_invokable(&object)?.set_field(index, value)
    }

    /// Handle `ARRAY_LENGTH` (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if `handle` is not live, or
    /// [`EngineError::MalformedRequest`] if it is not an array.
    pub fn array_length(&self, handle: Handle) -> Result<u32, EngineError> {
        let object = self.handles.lookup(handle).ok_or(crate::error::HandleError::Unknown(handle))?;
        Self::as_invokable(&object)?
            .array_length()
            .ok_or_else(|| EngineError::MalformedRequest("handle does not name an array".to_owned()))
    }

    /// Resolve a callable by `(type, index)` and invoke it on `target`,
    /// holding the global lock around the call for value-plane kinds
    /// (`spec.md` §4.1, §4.6, §9).
    ///
    /// A zero-argument `getClass()` call against the null instance is
    /// handled specially, returning `type_id`'s own descriptor type
    /// rather than attempting to invoke through a null target (`spec.md`
    /// §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::RecursionDepthExceeded`] if the recursion
    /// guard trips, [`EngineError::Deadlock`] if the global lock cannot
    /// be acquired, [`EngineError::Registry`] for a bad callable index,
    /// or [`EngineError::ReflectionFailure`] if the call itself throws.
    pub fn call(
        &self,
        thread: LogicalThreadId,
        is_constructor: bool,
        type_id: TypeId,
        target: Handle,
        callable_index: u32,
        args: &[Value],
        constructor_factory: Option<&dyn Constructible>,
    ) -> Result<CallResult, EngineError> {
        let _recursion = self.recursion.enter()?;
        let callable = self.registry.callable(type_id, callable_index, is_constructor)?;

        if !is_constructor && callable.name == "getClass" && args.is_empty() && target.is_null() {
            return Ok(CallResult {
                value: Value::Int(type_id.0 as i32),
                reported_type: type_id,
            });
        }

        self.locks.acquire_global(thread)?;
        let outcome = self.invoke_resolved(is_constructor, target, &callable, args, constructor_factory);
        self.locks.release_global(thread)?;

        let value = outcome?;
        let reported_type = if callable.generic_return {
            self.runtime_type_of(&value).unwrap_or(callable.return_type)
        } else {
            callable.return_type
        };
        Ok(CallResult { value, reported_type })
    }

    fn invoke_resolved(
        &self,
        is_constructor: bool,
        target: Handle,
        callable: &CallableDescriptor,
        args: &[Value],
        constructor_factory: Option<&dyn Constructible>,
    ) -> Result<Value, EngineError> {
        if is_constructor {
            let factory = constructor_factory.ok_or_else(|| {
                EngineError::MalformedRequest("no constructor factory registered for type".to_owned())
            })?;
            let instance = factory.construct(callable.index, args)?;
            let handle = self.handles.add_ref_object(instance);
            return Ok(Value::Reference(handle));
        }
        let object = self.handles.lookup(target).ok_or(crate::error::HandleError::Unknown(target))?;
        Self::as_invokable(&object)?.invoke_method(callable.index, args)
    }

    /// Handle `NEW_ARRAY` (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::MalformedRequest`] if `element_type` is not a
    /// valid array element type.
    pub fn new_array(&self, element_type: TypeId, length: u32) -> Result<Handle, EngineError> {
        let array = self.array_factory.new_array(element_type, length)?;
        Ok(self.handles.add_ref_object(array))
    }

    /// Handle `GET_VALUE_OF` (`spec.md` §4.6): unwrap a boxed primitive to
    /// its underlying value. By convention a boxed primitive's sole field
    /// (index 0) holds that value.
    ///
    /// # Errors
    /// Returns [`EngineError::Handle`] if `handle` is not live.
    pub fn get_value_of(&self, handle: Handle) -> Result<Value, EngineError> { self.get_field(handle, 0) }

    /// Handle `GET_CALLBACK_HANDLE` (`spec.md` §4.6, §4.7): register a
    /// client-side callable under `function_id`, resolving its expected
    /// arity either from a well-known interface name or, failing that,
    /// from the target interface's single abstract method.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if `target_interface` is
    /// requested but unknown, or [`EngineError::MalformedRequest`] if the
    /// interface has no unique abstract method to route through.
    pub fn get_callback_handle(
        &self,
        target_interface: Option<TypeId>,
        function_id: i32,
        is_root_method: impl Fn(&str, usize) -> bool,
    ) -> Result<CallbackProxyHandle, EngineError> {
        let arg_count = match target_interface {
            None => 1,
            Some(type_id) => {
                let descriptor = self.registry.get(type_id)?;
                if let Some(well_known) = WellKnownInterface::from_type_name(&descriptor.name) {
                    well_known.arity()
                } else {
                    (0..=8_u32)
                        .find(|&count| {
                            find_single_abstract_method(&descriptor, count, &is_root_method).is_some()
                        })
                        .ok_or_else(|| {
                            EngineError::MalformedRequest(format!(
                                "no unique abstract method on {}",
                                descriptor.name
                            ))
                        })?
                }
            }
        };
        Ok(CallbackProxyHandle {
            function_id,
            target_interface,
            arg_count,
        })
    }

    /// Handle `CALLBACK_RESPONSE` (`spec.md` §4.6): route the client's
    /// reply to the outbound call it answers.
    pub fn callback_response(&self, request_id: RequestId, outcome: CallbackOutcome) {
        self.callback.resolve(request_id, outcome);
    }

    /// Handle `GET_PROXY` (`spec.md` §4.6, §4.7): synthesise a callback
    /// proxy handle for `target_interface`, the same arity resolution
    /// `get_callback_handle` performs.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if `target_interface` is unknown,
    /// or [`EngineError::MalformedRequest`] if it has no unique abstract
    /// method.
    pub fn get_proxy(
        &self,
        target_interface: TypeId,
        function_id: i32,
        is_root_method: impl Fn(&str, usize) -> bool,
    ) -> Result<CallbackProxyHandle, EngineError> {
        self.get_callback_handle(Some(target_interface), function_id, is_root_method)
    }

    /// Handle `INJECT_CLASS` (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::AccessDenied`] if no class injector is
    /// configured for this connection, or whatever the injector itself
    /// reports.
    pub fn inject_class(&self, bytecode: &[u8]) -> Result<TypeId, EngineError> {
        let injector = self
            .class_injector
            .as_ref()
            .ok_or_else(|| EngineError::AccessDenied("class injection is not enabled".to_owned()))?;
        injector.inject_class(bytecode)
    }

    /// Handle `INJECT_SOURCE` (`spec.md` §4.6).
    ///
    /// # Errors
    /// Returns [`EngineError::AccessDenied`] if no class injector is
    /// configured for this connection, or whatever the injector itself
    /// reports.
    pub fn inject_source(&self, name: &str, source: &str) -> Result<TypeId, EngineError> {
        let injector = self
            .class_injector
            .as_ref()
            .ok_or_else(|| EngineError::AccessDenied("class injection is not enabled".to_owned()))?;
        injector.inject_source(name, source)
    }

    /// Spawn an asynchronous call onto the method-caller pool, returning a
    /// future immediately (`spec.md` §4.8 calling mode
    /// [`CallMode::NewHostThread`]). The caller is responsible for
    /// tracking the returned future against a client-visible handle.
    pub fn call_async(
        self: &Arc<Self>,
        thread: LogicalThreadId,
        is_constructor: bool,
        type_id: TypeId,
        target: Handle,
        callable_index: u32,
        args: Vec<Value>,
    ) -> CallFuture<Result<CallResult, EngineError>>
    where
    {
        let dispatcher = Arc::clone(self);
        self.method_callers.spawn(async move {
            tokio::task::spawn_blocking(move || {
                dispatcher.call(thread, is_constructor, type_id, target, callable_index, &args, None)
            })
            .await
            .unwrap_or_else(|join_err| {
                Err(EngineError::ReflectionFailure {
                    cause: join_err.to_string(),
                })
            })
        })
    }

    fn as_invokable(object: &Arc<dyn crate::registry::HostObject>) -> Result<&dyn Invokable, EngineError> {
        object.as_invokable().ok_or_else(|| {
            EngineError::MalformedRequest(format!(
                "object of type {} does not support invocation",
                object.type_name()
            ))
        })
    }

    /// The generic-return heuristic reports the value's runtime class
    /// (`spec.md` §4.2, §4.6): for a reference, the registered type of the
    /// object the handle actually names, looked up through
    /// [`crate::registry::HostObject::runtime_type_name`] rather than the
    /// callable's declared return type. `None` when the handle is dead or
    /// its runtime type name is not registered, leaving the caller to fall
    /// back to the declared return type.
    fn runtime_type_of(&self, value: &Value) -> Option<TypeId> {
        let Value::Reference(handle) = value else {
            return Some(TypeId::VOID);
        };
        let object = self.handles.lookup(*handle)?;
        self.registry.get_by_name(object.runtime_type_name()).ok().map(|descriptor| descriptor.id)
    }

    /// The registered runtime type backing `handle` (`spec.md` §4.4,
    /// §4.6), for wire handlers that only have a bare handle rather than a
    /// [`Value`] already in hand. [`TypeId::VOID`] for the null handle, a
    /// dead handle, or a runtime type name with no registry entry.
    #[must_use]
    pub fn handle_runtime_type(&self, handle: Handle) -> TypeId {
        if handle.is_null() {
            return TypeId::VOID;
        }
        self.runtime_type_of(&Value::Reference(handle)).unwrap_or(TypeId::VOID)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ArrayFactory, Dispatcher, EngineConfig, Invokable, InstanceLookup, LogicalThreadId, RecursionGuard, TypeId};
    use crate::{
        callback::CallbackEngine,
        ids::ClientThreadId,
        locks::LockManager,
        registry::{DescribeType, SpecificityMatrix, TypeDescriptor, TypeFlags, TypeRegistry},
    };

    struct NoLookup;
    impl InstanceLookup for NoLookup {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn Invokable>> { None }
    }

    struct NoArrays;
    impl ArrayFactory for NoArrays {
        fn new_array(&self, element_type: TypeId, _length: u32) -> Result<Arc<dyn Invokable>, super::EngineError> {
            Err(super::EngineError::MalformedRequest(format!("no array support for {element_type}")))
        }
    }

    fn thread() -> LogicalThreadId { LogicalThreadId::new(1, ClientThreadId(1)) }

    fn make_dispatcher() -> Dispatcher {
        let (outbound, _rx) = tokio::sync::mpsc::unbounded_channel();
        Dispatcher::new(
            Arc::new(TypeRegistry::new(|_| true)),
            Arc::new(LockManager::new(true)),
            EngineConfig::default(),
            Arc::new(NoLookup),
            Arc::new(CallbackEngine::new(outbound)),
            Arc::new(NoArrays),
            None,
        )
    }

    #[test]
    fn recursion_guard_rejects_past_the_limit() {
        let guard = RecursionGuard::new(2);
        let first = guard.enter().expect("first ok");
        let second = guard.enter().expect("second ok");
        assert!(guard.enter().is_err());
        drop(second);
        drop(first);
        assert!(guard.enter().is_ok());
    }

    #[test]
    fn instance_lookup_with_no_name_is_null() {
        let dispatcher = make_dispatcher();
        assert!(dispatcher.instance_lookup(None).is_null());
    }

    #[test]
    fn add_then_drop_ref_on_unknown_handle_errors() {
        let dispatcher = make_dispatcher();
        assert!(dispatcher.add_refs(&[crate::ids::Handle(999)]).is_err());
    }

    #[test]
    fn to_string_of_null_handle_is_none() {
        let dispatcher = make_dispatcher();
        assert_eq!(dispatcher.to_string_of(crate::ids::Handle::NULL).expect("ok"), None);
    }

    #[test]
    fn lock_then_unlock_succeeds_for_the_same_thread() {
        let dispatcher = make_dispatcher();
        dispatcher.lock(thread(), "A").expect("locks");
        dispatcher.unlock(thread(), "A").expect("unlocks");
    }

    #[test]
    fn cast_to_unrelated_type_is_a_conversion_failure() {
        let dispatcher = make_dispatcher();
        let err = dispatcher.cast(crate::ids::Handle(1), TypeId(1), TypeId(2)).unwrap_err();
        assert!(matches!(err, super::EngineError::ValueConversion(_)));
    }

    #[test]
    fn new_array_without_a_factory_propagates_the_error() {
        let dispatcher = make_dispatcher();
        assert!(dispatcher.new_array(TypeId(1), 4).is_err());
    }

    #[test]
    fn inject_class_without_an_injector_is_access_denied() {
        let dispatcher = make_dispatcher();
        let err = dispatcher.inject_class(&[]).unwrap_err();
        assert!(matches!(err, super::EngineError::AccessDenied(_)));
    }

    #[test]
    fn callback_handle_for_a_well_known_interface_resolves_arity_without_the_registry() {
        let dispatcher = make_dispatcher();
        let descriptor_id = {
            struct AlwaysRunnable;
            impl DescribeType for AlwaysRunnable {
                fn describe(&self, id: TypeId, _supertypes: &[TypeDescriptor]) -> TypeDescriptor {
                    TypeDescriptor {
                        id,
                        name: "java.lang.Runnable".to_owned(),
                        flags: TypeFlags::INTERFACE | TypeFlags::FUNCTIONAL_INTERFACE,
                        supertypes: Vec::new(),
                        element_type: None,
                        fields: Vec::new(),
                        constructors: Vec::new(),
                        methods: Vec::new(),
                        constructor_specificity: SpecificityMatrix::default(),
                        method_specificity: SpecificityMatrix::default(),
                    }
                }
            }
            dispatcher.registry.register("java.lang.Runnable", &AlwaysRunnable, &[])
        };
        let handle = dispatcher
            .get_callback_handle(Some(descriptor_id), 7, |_, _| false)
            .expect("resolves via well-known interface");
        assert_eq!(handle.arg_count, 0);
        assert_eq!(handle.function_id, 7);
    }
}
