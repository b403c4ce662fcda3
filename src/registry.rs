//! Type registry: assigns stable IDs to introspected host types and
//! memoises their field/constructor/method descriptors and
//! per-type overload-specificity matrices (`spec.md` §3, §4.2).
//!
//! Rust has no runtime reflection, so "introspecting a host type" here
//! means a type that implements [`HostObject`] and hands back its own
//! descriptor and a fixed set of callable implementations. Registration
//! plays the role the teacher's command table (`commands::HandlerContext`)
//! plays for transaction types: a closed, explicitly registered set of
//! handlers rather than anything derived at runtime.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bitflags::bitflags;

use crate::{error::RegistryError, ids::TypeId};

bitflags! {
    /// Type descriptor flag bits (`spec.md` §3).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        /// The type is a primitive (`int`, `double`, `boolean`, ...).
        const PRIMITIVE           = 1 << 0;
        /// The type is throwable (an exception/error type).
        const THROWABLE           = 1 << 1;
        /// The type is an interface.
        const INTERFACE           = 1 << 2;
        /// The type is an enum.
        const ENUM                = 1 << 3;
        /// The type is an array type.
        const ARRAY               = 1 << 4;
        /// The type is a functional (single abstract method) interface.
        const FUNCTIONAL_INTERFACE = 1 << 5;
    }
}

/// Field descriptor: name, declared type, and whether it is static
/// (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Declared type ID.
    pub declared_type: TypeId,
    /// Whether the field is static.
    pub is_static: bool,
}

/// Callable flag bits shared by constructors and methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallableFlags {
    /// The callable is static.
    pub is_static: bool,
    /// The callable is deprecated.
    pub is_deprecated: bool,
    /// The callable has a default (interface) implementation.
    pub is_default: bool,
    /// The callable uses explicit binding (no overload resolution needed
    /// on the server side).
    pub has_explicit_binding: bool,
    /// The callable accepts keyword arguments.
    pub has_keyword_args: bool,
}

/// Callable descriptor shared by constructors and methods (`spec.md` §3).
///
/// A constructor's name is its declaring type's name and its return type
/// is the declaring type itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallableDescriptor {
    /// Index, unique within this type's constructors or methods (whichever
    /// category this descriptor belongs to).
    pub index: u32,
    /// Callable name.
    pub name: String,
    /// Flag bits.
    pub flags: CallableFlags,
    /// Declared return type (the declaring type, for a constructor).
    pub return_type: TypeId,
    /// Whether the return type is a generic type parameter, per the
    /// generic-return heuristic in `spec.md` §4.2.
    pub generic_return: bool,
    /// Declared argument type IDs, in order.
    pub arg_types: Vec<TypeId>,
    /// Declared argument names, in order, parallel to `arg_types`.
    pub arg_names: Vec<String>,
    /// Accepted keyword argument names, if this callable accepts any.
    pub keyword_args: Option<Vec<String>>,
}

/// Square matrix of signed specificity values, one row/column per callable
/// index within a single category (constructors or methods) of one type.
///
/// `matrix[a][b]` is negative when callable `a` is strictly more specific
/// than callable `b`, positive for the converse, zero when incomparable
/// (`spec.md` §3, §4.3). Antisymmetric with a zero diagonal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecificityMatrix {
    rows: Vec<Vec<i8>>,
}

impl SpecificityMatrix {
    /// Build a specificity matrix from a square vector of rows.
    #[must_use]
    pub fn new(rows: Vec<Vec<i8>>) -> Self { Self { rows } }

    /// Number of callables this matrix covers.
    #[must_use]
    pub fn len(&self) -> usize { self.rows.len() }

    /// Whether this matrix covers zero callables.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// The signed specificity of callable `a` relative to callable `b`.
    #[must_use]
    pub fn get(&self, a: usize, b: usize) -> Option<i8> { self.rows.get(a)?.get(b).copied() }
}

/// Type descriptor: everything the type registry knows about one host
/// type (`spec.md` §3). Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// This type's assigned ID.
    pub id: TypeId,
    /// Canonical type name, e.g. `"java.lang.Object"`-style or `"int"`.
    pub name: String,
    /// Flag bits.
    pub flags: TypeFlags,
    /// Direct supertype IDs (superclass plus interfaces).
    pub supertypes: Vec<TypeId>,
    /// Array element type, if this is an array type.
    pub element_type: Option<TypeId>,
    /// Field descriptors, shadowing already resolved.
    pub fields: Vec<FieldDescriptor>,
    /// Constructor descriptors.
    pub constructors: Vec<CallableDescriptor>,
    /// Method descriptors, collected per the rules in `spec.md` §4.2.
    pub methods: Vec<CallableDescriptor>,
    /// Pairwise specificity of this type's constructors.
    pub constructor_specificity: SpecificityMatrix,
    /// Pairwise specificity of this type's methods.
    pub method_specificity: SpecificityMatrix,
}

impl TypeDescriptor {
    /// The built-in void type descriptor, occupying [`TypeId::VOID`].
    #[must_use]
    pub fn void() -> Self {
        Self {
            id: TypeId::VOID,
            name: "void".to_owned(),
            flags: TypeFlags::PRIMITIVE,
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

/// A type registered with the registry: a live Rust type that can be
/// introspected and whose instances can be dispatched against.
///
/// Stands in for reflective introspection: a host type registers its own
/// descriptor once, and the registry memoises it.
pub trait HostObject: Any + Send + Sync {
    /// Canonical name under which this type is registered.
    fn type_name(&self) -> &str;

    /// This object's runtime type name, which may differ from
    /// `type_name()` for subtypes sharing a declared field/return type.
    fn runtime_type_name(&self) -> &str { self.type_name() }

    /// Upcast to [`Any`] so the dispatcher can downcast to a concrete type
    /// when invoking a callable.
    fn as_any(&self) -> &dyn Any;

    /// Expose the invocation interface, if this type supports being
    /// invoked through the dispatcher (`spec.md` §4.6). Types registered
    /// only to be passed around by reference (e.g. plain boxed values)
    /// return `None`.
    fn as_invokable(&self) -> Option<&dyn crate::dispatcher::Invokable> { None }
}

/// Builds the descriptor for a registered type, including method
/// collection per the rules in `spec.md` §4.2 and the generic-return
/// heuristic.
pub trait DescribeType: Send + Sync {
    /// Produce this type's descriptor given its already-assigned ID and
    /// its supertypes' descriptors (for field/method shadowing
    /// resolution).
    fn describe(&self, id: TypeId, supertypes: &[TypeDescriptor]) -> TypeDescriptor;
}

struct RegistryState {
    by_id: HashMap<TypeId, TypeDescriptor>,
    by_name: HashMap<String, TypeId>,
    next_id: u32,
}

impl RegistryState {
    fn new() -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let void = TypeDescriptor::void();
        by_name.insert(void.name.clone(), void.id);
        by_id.insert(void.id, void);
        Self {
            by_id,
            by_name,
            next_id: 1,
        }
    }
}

/// Process-wide registry of type descriptors, shared across connections
/// (`spec.md` §5).
///
/// Entry creation is idempotent: concurrent lookups for the same not-yet
/// registered name race to build a descriptor, but only one wins the slot
/// and all callers observe the same [`TypeId`] (`spec.md` §8).
pub struct TypeRegistry {
    state: RwLock<RegistryState>,
    class_permitted: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry").finish_non_exhaustive()
    }
}

impl TypeRegistry {
    /// Construct an empty registry (containing only the void type),
    /// gating name-based lookups with `class_permitted`.
    pub fn new(class_permitted: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: RwLock::new(RegistryState::new()),
            class_permitted: Arc::new(class_permitted),
        }
    }

    /// Look up a type descriptor by ID.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownType`] if no type is registered
    /// under `id`.
    pub fn get(&self, id: TypeId) -> Result<TypeDescriptor, RegistryError> {
        let state = self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.by_id.get(&id).cloned().ok_or(RegistryError::UnknownType(id))
    }

    /// Look up a type descriptor by canonical name, consulting the
    /// class-authorisation predicate first (`spec.md` §4.6, §6).
    ///
    /// # Errors
    /// Returns [`RegistryError::AccessDenied`] if the predicate rejects
    /// `name`, or [`RegistryError::UnknownTypeName`] if no type is
    /// registered (or derivable) under it.
    pub fn get_by_name(&self, name: &str) -> Result<TypeDescriptor, RegistryError> {
        if !(self.class_permitted)(name) {
            return Err(RegistryError::AccessDenied(name.to_owned()));
        }
        let state = self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = state
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownTypeName(name.to_owned()))?;
        state.by_id.get(&id).cloned().ok_or_else(|| RegistryError::UnknownTypeName(name.to_owned()))
    }

    /// Register a type descriptor built by `describe`, assigning it the
    /// next dense type ID if it has not already been registered under
    /// `name`. Returns the (possibly pre-existing) ID.
    pub fn register(&self, name: &str, describe: &dyn DescribeType, supertypes: &[TypeId]) -> TypeId {
        let mut state = self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = state.by_name.get(name) {
            return *existing;
        }
        let id = TypeId(state.next_id);
        state.next_id += 1;
        let supertype_descriptors: Vec<TypeDescriptor> =
            supertypes.iter().filter_map(|sid| state.by_id.get(sid).cloned()).collect();
        let descriptor = describe.describe(id, &supertype_descriptors);
        state.by_name.insert(name.to_owned(), id);
        state.by_id.insert(id, descriptor);
        id
    }

    /// Whether `from` is assignable to `to`: the same type, or `to`
    /// reachable by walking `from`'s supertype chain transitively. Used by
    /// the dispatcher's cast operation (`spec.md` §4.6 "object cast").
    #[must_use]
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        if from == to {
            return true;
        }
        let state = self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(descriptor) = state.by_id.get(&current) else {
                continue;
            };
            for &supertype in &descriptor.supertypes {
                if supertype == to {
                    return true;
                }
                stack.push(supertype);
            }
        }
        false
    }

    /// Look up a specific callable by `(type, index)` in the given
    /// category, validating the index is in range.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownType`] or
    /// [`RegistryError::BadCallableIndex`].
    pub fn callable(
        &self,
        type_id: TypeId,
        index: u32,
        is_constructor: bool,
    ) -> Result<CallableDescriptor, RegistryError> {
        let descriptor = self.get(type_id)?;
        let set = if is_constructor {
            &descriptor.constructors
        } else {
            &descriptor.methods
        };
        set.get(index as usize)
            .cloned()
            .ok_or(RegistryError::BadCallableIndex { type_id, index })
    }
}

/// Resolve shadowed fields, keeping per name the field declared by the
/// most-derived type, per `spec.md` §4.2. `own` fields take precedence
/// over any field of the same name inherited from `supertypes`.
#[must_use]
pub fn resolve_field_shadowing(
    own: Vec<FieldDescriptor>,
    supertypes: &[TypeDescriptor],
) -> Vec<FieldDescriptor> {
    let mut by_name: HashMap<String, FieldDescriptor> = HashMap::new();
    for supertype in supertypes {
        for field in &supertype.fields {
            by_name.entry(field.name.clone()).or_insert_with(|| field.clone());
        }
    }
    for field in own {
        by_name.insert(field.name.clone(), field);
    }
    let mut fields: Vec<FieldDescriptor> = by_name.into_values().collect();
    fields.sort_by(|a, b| a.name.cmp(&b.name));
    fields
}

/// Apply the generic-return heuristic from `spec.md` §4.2: if the
/// reflected return type name differs from the generic-form return type
/// name, and the generic form contains neither `<` nor `>`, the method is
/// marked generic-returning. An explicit annotation always forces the
/// flag on.
#[must_use]
pub const fn is_generic_return(
    reflected_name_differs: bool,
    generic_form_has_brackets: bool,
    explicit_annotation: bool,
) -> bool {
    explicit_annotation || (reflected_name_differs && !generic_form_has_brackets)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    struct AlwaysDescribe(TypeDescriptor);

    impl DescribeType for AlwaysDescribe {
        fn describe(&self, id: TypeId, _supertypes: &[TypeDescriptor]) -> TypeDescriptor {
            let mut descriptor = self.0.clone();
            descriptor.id = id;
            descriptor
        }
    }

    fn stub_descriptor(name: &str) -> TypeDescriptor {
        TypeDescriptor {
            id: TypeId::VOID,
            name: name.to_owned(),
            flags: TypeFlags::empty(),
            supertypes: Vec::new(),
            element_type: None,
            fields: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
            constructor_specificity: SpecificityMatrix::default(),
            method_specificity: SpecificityMatrix::default(),
        }
    }

    #[test]
    fn void_type_is_preregistered() {
        let registry = TypeRegistry::new(|_| true);
        let descriptor = registry.get(TypeId::VOID).expect("void registered");
        assert_eq!(descriptor.name, "void");
        assert!(descriptor.flags.contains(TypeFlags::PRIMITIVE));
    }

    #[test]
    fn registering_the_same_name_twice_returns_the_same_id() {
        let registry = TypeRegistry::new(|_| true);
        let describe = AlwaysDescribe(stub_descriptor("demo.Widget"));
        let first = registry.register("demo.Widget", &describe, &[]);
        let second = registry.register("demo.Widget", &describe, &[]);
        assert_eq!(first, second);
        assert_ne!(first, TypeId::VOID);
    }

    #[test]
    fn name_lookup_respects_authorisation_predicate() {
        let registry = TypeRegistry::new(|name| name != "blocked.Type");
        let describe = AlwaysDescribe(stub_descriptor("blocked.Type"));
        registry.register("blocked.Type", &describe, &[]);
        let err = registry.get_by_name("blocked.Type").unwrap_err();
        assert!(matches!(err, RegistryError::AccessDenied(_)));
    }

    #[test]
    fn unknown_callable_index_is_an_error() {
        let registry = TypeRegistry::new(|_| true);
        let describe = AlwaysDescribe(stub_descriptor("demo.Empty"));
        let id = registry.register("demo.Empty", &describe, &[]);
        let err = registry.callable(id, 0, false).unwrap_err();
        assert!(matches!(err, RegistryError::BadCallableIndex { index: 0, .. }));
    }

    #[test]
    fn field_shadowing_keeps_most_derived_declaration() {
        let base = {
            let mut d = stub_descriptor("demo.Base");
            d.fields.push(FieldDescriptor {
                name: "value".to_owned(),
                declared_type: TypeId(1),
                is_static: false,
            });
            d
        };
        let own = vec![FieldDescriptor {
            name: "value".to_owned(),
            declared_type: TypeId(2),
            is_static: false,
        }];
        let resolved = resolve_field_shadowing(own, std::slice::from_ref(&base));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].declared_type, TypeId(2));
    }

    #[test]
    fn is_assignable_walks_the_supertype_chain() {
        let registry = TypeRegistry::new(|_| true);
        let describe_base = AlwaysDescribe(stub_descriptor("demo.Animal"));
        let base_id = registry.register("demo.Animal", &describe_base, &[]);

        let mut dog_descriptor = stub_descriptor("demo.Dog");
        dog_descriptor.supertypes.push(base_id);
        let describe_dog = AlwaysDescribe(dog_descriptor);
        let dog_id = registry.register("demo.Dog", &describe_dog, &[base_id]);

        assert!(registry.is_assignable(dog_id, base_id));
        assert!(registry.is_assignable(dog_id, dog_id));
        assert!(!registry.is_assignable(base_id, dog_id));
    }

    #[rstest]
    #[case(false, false, false, false)]
    #[case(true, false, false, true)]
    #[case(true, true, false, false)]
    #[case(false, false, true, true)]
    fn generic_return_heuristic_matches_spec(
        #[case] reflected_name_differs: bool,
        #[case] generic_form_has_brackets: bool,
        #[case] explicit_annotation: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(
            is_generic_return(reflected_name_differs, generic_form_has_brackets, explicit_annotation),
            expected
        );
    }
}
