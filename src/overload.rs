//! Overload resolver: signed pairwise specificity comparator for
//! constructors/methods sharing a name and arity (`spec.md` §4.3).
//!
//! The host-specific relation between two parameter types is not a
//! reflexive, antisymmetric relation in the mathematical sense (a boxed
//! type and its primitive are mutually "equivalent" without being equal,
//! and the registry never compares a type against itself), so it is
//! modelled as an explicit three-valued function rather than forced into
//! `Ord`/`PartialOrd` (`spec.md` §9 design notes).

use std::cmp::Ordering;

use crate::registry::CallableDescriptor;

/// A primitive numeric/boolean/void kind, used for widening and
/// boxed/primitive comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// `boolean`
    Boolean,
    /// `void`
    Void,
    /// `char`
    Char,
    /// `byte`
    Byte,
    /// `short`
    Short,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
}

impl Primitive {
    /// Widening rank used to decide if `self` is assignable from `other`
    /// via primitive widening (`spec.md` §4.3 rule 2): `byte < short < int
    /// < long < float < double`. `char` is deliberately excluded: it
    /// widens one-directionally into `int` and beyond but nothing widens
    /// into it, which a shared rank cannot express (`char` and `int`
    /// would then compare equal in both directions). `boolean` and `void`
    /// never widen.
    const fn widening_rank(self) -> Option<u8> {
        match self {
            Self::Byte => Some(0),
            Self::Short => Some(1),
            Self::Int => Some(2),
            Self::Long => Some(3),
            Self::Float => Some(4),
            Self::Double => Some(5),
            Self::Boolean | Self::Void | Self::Char => None,
        }
    }

    /// Whether a value of this primitive type can be passed where `target`
    /// is expected, via widening only (no narrowing, no boolean/void
    /// conversion). `char` only widens into `int`/`long`/`float`/`double`,
    /// never the reverse, so it is handled before the rank comparison.
    #[must_use]
    pub const fn widens_to(self, target: Self) -> bool {
        match self {
            Self::Char => matches!(target, Self::Char | Self::Int | Self::Long | Self::Float | Self::Double),
            _ => match (self.widening_rank(), target.widening_rank()) {
                (Some(from), Some(to)) => from <= to,
                _ => matches!((self, target), (Self::Boolean, Self::Boolean) | (Self::Void, Self::Void)),
            },
        }
    }
}

/// A parameter type as seen by the overload resolver: enough shape to
/// apply the host-specific comparison rules without needing the full
/// reflected type system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// A primitive scalar type.
    Primitive(Primitive),
    /// The boxed wrapper of a primitive scalar type.
    Boxed(Primitive),
    /// A reference type, with its chain of supertype names for
    /// subtype-assignability checks (nearest first).
    Reference {
        /// This type's own name.
        name: String,
        /// Names of this type's supertypes and implemented interfaces,
        /// transitively, nearest first.
        supertypes: Vec<String>,
    },
    /// `String`.
    StringType,
    /// `char[]`.
    CharArray,
    /// `byte[]`.
    ByteArray,
}

impl ParamType {
    fn is_assignable_reference(name: &str, supertypes: &[String], target: &str) -> bool {
        name == target || supertypes.iter().any(|s| s == target)
    }
}

/// Three-valued outcome of comparing two parameter types for specificity,
/// from the perspective "is `self` more specific than the other type?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specificity {
    /// Strictly more specific.
    MoreSpecific,
    /// Neither more nor less specific (includes boxed/primitive pairs).
    Equivalent,
    /// Strictly less specific.
    LessSpecific,
    /// Not comparable at all (e.g. unrelated reference types).
    Incomparable,
}

/// Compare two parameter types per the host-specific rules in `spec.md`
/// §4.3 rule 2. Returns how `a` compares to `b`.
#[must_use]
pub fn compare_param_types(a: &ParamType, b: &ParamType) -> Specificity {
    use Specificity::{Equivalent, Incomparable, LessSpecific, MoreSpecific};

    match (a, b) {
        (ParamType::Primitive(p), ParamType::Boxed(q)) | (ParamType::Boxed(q), ParamType::Primitive(p))
            if p == q =>
        {
            Equivalent
        }
        (ParamType::Primitive(p), ParamType::Primitive(q)) => {
            if p == q {
                Equivalent
            } else if p.widens_to(*q) {
                MoreSpecific
            } else if q.widens_to(*p) {
                LessSpecific
            } else {
                Incomparable
            }
        }
        (ParamType::Boxed(p), ParamType::Boxed(q)) => {
            if p == q { Equivalent } else { Incomparable }
        }
        (ParamType::Primitive(_), ParamType::Boxed(_)) | (ParamType::Boxed(_), ParamType::Primitive(_)) => {
            // Different underlying primitive: boxed types only accept their
            // own primitive, so these are unrelated.
            Incomparable
        }
        (
            ParamType::Reference {
                name: a_name,
                supertypes: a_super,
            },
            ParamType::Reference {
                name: b_name,
                supertypes: b_super,
            },
        ) => {
            if a_name == b_name {
                Equivalent
            } else if ParamType::is_assignable_reference(a_name, a_super, b_name) {
                MoreSpecific
            } else if ParamType::is_assignable_reference(b_name, b_super, a_name) {
                LessSpecific
            } else {
                Incomparable
            }
        }
        (ParamType::StringType, ParamType::CharArray | ParamType::ByteArray) => MoreSpecific,
        (ParamType::CharArray | ParamType::ByteArray, ParamType::StringType) => LessSpecific,
        (ParamType::CharArray, ParamType::ByteArray) => MoreSpecific,
        (ParamType::ByteArray, ParamType::CharArray) => LessSpecific,
        (ParamType::StringType, ParamType::StringType)
        | (ParamType::CharArray, ParamType::CharArray)
        | (ParamType::ByteArray, ParamType::ByteArray) => Equivalent,
        _ => Incomparable,
    }
}

/// Compare two callables sharing (or not) a name and arity, producing the
/// signed byte the registry caches in a type's specificity matrix
/// (`spec.md` §4.3).
///
/// Negative when `a` is strictly more specific, positive for the
/// converse, zero when incomparable or when names/arities differ.
#[must_use]
pub fn compare_callables(
    a: &CallableDescriptor,
    a_params: &[ParamType],
    b: &CallableDescriptor,
    b_params: &[ParamType],
    return_specificity: Specificity,
) -> i8 {
    if a.name != b.name || a_params.len() != b_params.len() {
        return 0;
    }

    let mut direction: Option<Ordering> = None;
    for (a_param, b_param) in a_params.iter().zip(b_params) {
        let this_direction = match compare_param_types(a_param, b_param) {
            Specificity::MoreSpecific => Ordering::Less,
            Specificity::LessSpecific => Ordering::Greater,
            Specificity::Equivalent => continue,
            Specificity::Incomparable => return 0,
        };
        match direction {
            None => direction = Some(this_direction),
            Some(existing) if existing == this_direction => {}
            Some(_) => return 0,
        }
    }

    match direction {
        Some(Ordering::Less) => -1,
        Some(Ordering::Greater) => 1,
        Some(Ordering::Equal) | None => match return_specificity {
            Specificity::MoreSpecific => -1,
            Specificity::LessSpecific => 1,
            Specificity::Equivalent | Specificity::Incomparable => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::registry::CallableFlags;

    fn callable(name: &str) -> CallableDescriptor {
        CallableDescriptor {
            index: 0,
            name: name.to_owned(),
            flags: CallableFlags::default(),
            return_type: crate::ids::TypeId(1),
            generic_return: false,
            arg_types: Vec::new(),
            arg_names: Vec::new(),
            keyword_args: None,
        }
    }

    #[rstest]
    #[case(Primitive::Byte, Primitive::Short, true)]
    #[case(Primitive::Byte, Primitive::Long, true)]
    #[case(Primitive::Char, Primitive::Int, true)]
    #[case(Primitive::Int, Primitive::Char, false)]
    #[case(Primitive::Long, Primitive::Int, false)]
    #[case(Primitive::Boolean, Primitive::Int, false)]
    fn widening_matches_spec(#[case] from: Primitive, #[case] to: Primitive, #[case] expected: bool) {
        assert_eq!(from.widens_to(to), expected);
    }

    #[test]
    fn char_and_int_specificity_is_antisymmetric() {
        let f = callable("f");
        let g = callable("f");
        let char_param = [ParamType::Primitive(Primitive::Char)];
        let int_param = [ParamType::Primitive(Primitive::Int)];

        let s_char_int = compare_callables(&f, &char_param, &g, &int_param, Specificity::Equivalent);
        let s_int_char = compare_callables(&g, &int_param, &f, &char_param, Specificity::Equivalent);

        assert_eq!(s_char_int, -1);
        assert_eq!(s_int_char, 1);
        assert_eq!(s_char_int, -s_int_char);
    }

    #[test]
    fn int_and_long_tie_break_by_narrower_widening() {
        let int_f = callable("f");
        let long_f = callable("f");
        let int_param = [ParamType::Primitive(Primitive::Int)];
        let long_param = [ParamType::Primitive(Primitive::Long)];

        let s_int_long =
            compare_callables(&int_f, &int_param, &long_f, &long_param, Specificity::Equivalent);
        let s_long_int =
            compare_callables(&long_f, &long_param, &int_f, &int_param, Specificity::Equivalent);

        assert_eq!(s_int_long, -1);
        assert_eq!(s_long_int, 1);
        assert_eq!(s_int_long, -s_long_int);
    }

    #[test]
    fn specificity_is_reflexive_zero() {
        let f = callable("f");
        let params = [ParamType::Primitive(Primitive::Int)];
        assert_eq!(compare_callables(&f, &params, &f, &params, Specificity::Equivalent), 0);
    }

    #[test]
    fn different_names_are_incomparable() {
        let f = callable("f");
        let g = callable("g");
        let params = [ParamType::Primitive(Primitive::Int)];
        assert_eq!(compare_callables(&f, &params, &g, &params, Specificity::Equivalent), 0);
    }

    #[test]
    fn mixed_direction_arguments_are_incomparable() {
        let f = callable("f");
        let a_params = [ParamType::Primitive(Primitive::Int), ParamType::Primitive(Primitive::Long)];
        let b_params = [ParamType::Primitive(Primitive::Long), ParamType::Primitive(Primitive::Int)];
        assert_eq!(compare_callables(&f, &a_params, &f, &b_params, Specificity::Equivalent), 0);
    }

    #[test]
    fn boxed_and_primitive_are_equivalent() {
        let specificity = compare_param_types(
            &ParamType::Primitive(Primitive::Int),
            &ParamType::Boxed(Primitive::Int),
        );
        assert_eq!(specificity, Specificity::Equivalent);
    }

    #[test]
    fn boxed_types_are_asymmetric_with_other_primitives() {
        let specificity = compare_param_types(
            &ParamType::Boxed(Primitive::Int),
            &ParamType::Primitive(Primitive::Long),
        );
        assert_eq!(specificity, Specificity::Incomparable);
    }

    #[test]
    fn string_beats_char_array_and_byte_array() {
        assert_eq!(
            compare_param_types(&ParamType::StringType, &ParamType::CharArray),
            Specificity::MoreSpecific
        );
        assert_eq!(
            compare_param_types(&ParamType::StringType, &ParamType::ByteArray),
            Specificity::MoreSpecific
        );
        assert_eq!(
            compare_param_types(&ParamType::CharArray, &ParamType::ByteArray),
            Specificity::MoreSpecific
        );
    }

    #[test]
    fn subtype_reference_is_more_specific() {
        let derived = ParamType::Reference {
            name: "demo.Dog".to_owned(),
            supertypes: vec!["demo.Animal".to_owned()],
        };
        let base = ParamType::Reference {
            name: "demo.Animal".to_owned(),
            supertypes: vec![],
        };
        assert_eq!(compare_param_types(&derived, &base), Specificity::MoreSpecific);
        assert_eq!(compare_param_types(&base, &derived), Specificity::LessSpecific);
    }

    #[test]
    fn unrelated_reference_types_are_incomparable() {
        let a = ParamType::Reference {
            name: "demo.A".to_owned(),
            supertypes: vec![],
        };
        let b = ParamType::Reference {
            name: "demo.B".to_owned(),
            supertypes: vec![],
        };
        assert_eq!(compare_param_types(&a, &b), Specificity::Incomparable);
    }

    #[test]
    fn equal_args_break_tie_on_return_type() {
        let f = callable("f");
        let params = [ParamType::Primitive(Primitive::Int)];
        assert_eq!(compare_callables(&f, &params, &f, &params, Specificity::MoreSpecific), -1);
        assert_eq!(compare_callables(&f, &params, &f, &params, Specificity::LessSpecific), 1);
    }
}
