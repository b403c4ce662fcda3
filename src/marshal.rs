//! Value marshaller: reads and writes typed values on the wire using the
//! four argument encodings, primitive boxing, typed arrays, UTF-16
//! strings, and the structural containers (`spec.md` §4.5).
//!
//! Byte layout mirrors the big-endian, length-prefixed style the teacher
//! uses for its own transaction payloads (`transaction/params.rs`), just
//! applied to a richer value model than a flat parameter list.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    error::MarshalError,
    handles::HandleTable,
    ids::{Handle, TypeId},
};

/// UTF-16 byte-order mark, written before every UTF-16 string payload.
const UTF16_BOM: u16 = 0xFEFF;

/// Sentinel byte-count meaning "no inlined value" when an object is
/// written by handle only (`spec.md` §4.5).
pub const NO_INLINE_SENTINEL: i32 = -1;

/// Threshold below which a string is opportunistically inlined alongside
/// its handle (`spec.md` §4.5).
pub const INLINE_STRING_MAX_CHARS: usize = 32_768;

/// The eight primitive scalar kinds, plus the two composite primitive
/// forms (`String`/`char[]`) that travel as UTF-16.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `boolean`
    Boolean(bool),
    /// `byte`
    Byte(i8),
    /// `short`
    Short(i16),
    /// `char`, a single UTF-16 code unit.
    Char(u16),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// `String`, decoded from its UTF-16 wire form.
    Str(String),
    /// A typed array of one of the eight primitive kinds.
    PrimitiveArray(PrimitiveArray),
    /// An object array: recursively encoded, typed elements.
    ObjectArray {
        /// Declared element type.
        element_type: TypeId,
        /// Elements, each independently typed.
        elements: Vec<Value>,
    },
    /// A reference to a live host object.
    Reference(Handle),
    /// A client-owned object, identified by a client-assigned ID.
    /// Negative denotes null.
    ClientObject(i32),
    /// `Map`: count plus recursive key/value pairs.
    Map(Vec<(Value, Value)>),
    /// `Set`: count plus recursive elements.
    Set(Vec<Value>),
    /// `List`/`Collection`: count plus recursive elements.
    List(Vec<Value>),
    /// A slice triple, each component independently typed (commonly
    /// `int` or null).
    Slice {
        /// Start bound.
        start: Box<Value>,
        /// Stop bound.
        stop: Box<Value>,
        /// Step.
        step: Box<Value>,
    },
    /// Typed n-dimensional array: shape plus chunked element arrays.
    NdArray {
        /// Array shape, outermost dimension first.
        shape: Vec<i32>,
        /// Packed element chunks, in row-major order.
        chunks: Vec<PrimitiveArray>,
    },
}

/// One-character type codes for the eight primitive element types
/// (`spec.md` §6: `{Z,B,S,I,J,F,D}`, plus `C` for `char`, which the
/// shared-memory channel itself does not support).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveCode {
    /// `boolean`, code `Z`.
    Boolean,
    /// `byte`, code `B`.
    Byte,
    /// `char`, code `C`. Not valid over the shared-memory channel.
    Char,
    /// `short`, code `S`.
    Short,
    /// `int`, code `I`.
    Int,
    /// `long`, code `J`.
    Long,
    /// `float`, code `F`.
    Float,
    /// `double`, code `D`.
    Double,
}

impl PrimitiveCode {
    /// The single-character wire code for this primitive kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Boolean => b'Z',
            Self::Byte => b'B',
            Self::Char => b'C',
            Self::Short => b'S',
            Self::Int => b'I',
            Self::Long => b'J',
            Self::Float => b'F',
            Self::Double => b'D',
        }
    }

    /// Parse a wire code back into a [`PrimitiveCode`].
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'Z' => Self::Boolean,
            b'B' => Self::Byte,
            b'C' => Self::Char,
            b'S' => Self::Short,
            b'I' => Self::Int,
            b'J' => Self::Long,
            b'F' => Self::Float,
            b'D' => Self::Double,
            _ => return None,
        })
    }

    /// Whether this code is one of the eight types the shared-memory
    /// channel supports (`char` is excluded, `spec.md` §6).
    #[must_use]
    pub const fn is_shared_memory_eligible(self) -> bool { !matches!(self, Self::Char) }

    /// Width in bytes of one packed element.
    #[must_use]
    pub const fn element_width(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }
}

/// A typed array of one primitive kind, packed as element-width bytes in
/// network byte order (`spec.md` §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveArray {
    /// Element kind.
    pub code: PrimitiveCode,
    /// Packed element bytes, `len() == count * code.element_width()`.
    pub packed: Vec<u8>,
}

impl PrimitiveArray {
    /// Number of elements packed in this array.
    #[must_use]
    pub fn len(&self) -> usize {
        let width = self.code.element_width();
        if width == 0 { 0 } else { self.packed.len() / width }
    }

    /// Whether this array has zero elements.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.packed.is_empty() }
}

fn write_utf16(dst: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    let byte_count = 2 + units.len() * 2;
    dst.put_u32(u32::try_from(byte_count).unwrap_or(u32::MAX));
    dst.put_u16(UTF16_BOM);
    for unit in units {
        dst.put_u16(unit);
    }
}

fn read_utf16(src: &mut BytesMut) -> Result<String, MarshalError> {
    if src.remaining() < 4 {
        return Err(MarshalError::InvalidString);
    }
    let byte_count = src.get_u32() as usize;
    if byte_count < 2 || src.remaining() < byte_count {
        return Err(MarshalError::InvalidString);
    }
    let _bom = src.get_u16();
    let unit_count = (byte_count - 2) / 2;
    let mut units = Vec::with_capacity(unit_count);
    for _ in 0..unit_count {
        units.push(src.get_u16());
    }
    String::from_utf16(&units).map_err(|_| MarshalError::InvalidString)
}

/// Write `value` per its variant's wire form (`spec.md` §4.5). Does not
/// write the leading type ID; callers that need the "writing an object
/// always emits the type ID" rule do so themselves before calling this.
pub fn write_value(dst: &mut BytesMut, value: &Value) {
    match value {
        Value::Boolean(b) => dst.put_u8(u8::from(*b)),
        Value::Byte(b) => dst.put_i8(*b),
        Value::Short(s) => dst.put_i16(*s),
        Value::Char(c) => dst.put_u16(*c),
        Value::Int(i) => dst.put_i32(*i),
        Value::Long(l) => dst.put_i64(*l),
        Value::Float(f) => dst.put_f32(*f),
        Value::Double(d) => dst.put_f64(*d),
        Value::Str(s) => write_utf16(dst, s),
        Value::PrimitiveArray(array) => {
            dst.put_u32(u32::try_from(array.len()).unwrap_or(u32::MAX));
            dst.put_slice(&array.packed);
        }
        Value::ObjectArray { elements, .. } => {
            dst.put_u32(u32::try_from(elements.len()).unwrap_or(u32::MAX));
            for element in elements {
                write_value(dst, element);
            }
        }
        Value::Reference(handle) => dst.put_u64(handle.0),
        Value::ClientObject(id) => dst.put_i32(*id),
        Value::Map(entries) => {
            dst.put_u32(u32::try_from(entries.len()).unwrap_or(u32::MAX));
            for (key, val) in entries {
                write_value(dst, key);
                write_value(dst, val);
            }
        }
        Value::Set(elements) | Value::List(elements) => {
            dst.put_u32(u32::try_from(elements.len()).unwrap_or(u32::MAX));
            for element in elements {
                write_value(dst, element);
            }
        }
        Value::Slice { start, stop, step } => {
            write_value(dst, start);
            write_value(dst, stop);
            write_value(dst, step);
        }
        Value::NdArray { shape, chunks } => {
            dst.put_u32(u32::try_from(shape.len()).unwrap_or(u32::MAX));
            for dim in shape {
                dst.put_i32(*dim);
            }
            dst.put_u32(u32::try_from(chunks.len()).unwrap_or(u32::MAX));
            for chunk in chunks {
                dst.put_u8(chunk.code.code());
                dst.put_u32(u32::try_from(chunk.len()).unwrap_or(u32::MAX));
                dst.put_slice(&chunk.packed);
            }
        }
    }
}

#[expect(clippy::too_many_lines, reason = "one arm per value shape, mirrors write_value")]
fn read_scalar(src: &mut BytesMut, code: PrimitiveCode) -> Result<Value, MarshalError> {
    let width = code.element_width();
    if src.remaining() < width {
        return Err(MarshalError::InvalidString);
    }
    Ok(match code {
        PrimitiveCode::Boolean => Value::Boolean(src.get_u8() != 0),
        PrimitiveCode::Byte => Value::Byte(src.get_i8()),
        PrimitiveCode::Char => Value::Char(src.get_u16()),
        PrimitiveCode::Short => Value::Short(src.get_i16()),
        PrimitiveCode::Int => Value::Int(src.get_i32()),
        PrimitiveCode::Long => Value::Long(src.get_i64()),
        PrimitiveCode::Float => Value::Float(src.get_f32()),
        PrimitiveCode::Double => Value::Double(src.get_f64()),
    })
}

fn read_primitive_array(src: &mut BytesMut, code: PrimitiveCode) -> Result<PrimitiveArray, MarshalError> {
    if src.remaining() < 4 {
        return Err(MarshalError::InvalidString);
    }
    let count = src.get_u32() as usize;
    let width = code.element_width();
    let byte_len = count * width;
    if src.remaining() < byte_len {
        return Err(MarshalError::InvalidString);
    }
    let packed = src.split_to(byte_len).to_vec();
    Ok(PrimitiveArray { code, packed })
}

/// Read a string value, consuming a 4-byte byte count, BOM, and that many
/// UTF-16 bytes.
///
/// # Errors
/// Returns [`MarshalError::InvalidString`] on a truncated buffer or
/// invalid UTF-16.
pub fn read_string(src: &mut BytesMut) -> Result<String, MarshalError> { read_utf16(src) }

/// Read a value from the wire given which shape it takes. The caller is
/// expected to already know the shape (from a type descriptor, argument
/// encoding header, or container element-type tag), mirroring how the
/// real engine threads declared types through rather than self-describing
/// every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// A single primitive scalar.
    Scalar(PrimitiveCode),
    /// `String`.
    Str,
    /// A typed array of one primitive kind.
    PrimitiveArray(PrimitiveCode),
    /// An object array of the given element shape.
    ObjectArray(TypeId),
    /// A reference to a live host object.
    Reference,
    /// A client-owned object ID.
    ClientObject,
    /// `Map` of the given key/value shapes.
    Map(Box<ValueShape>, Box<ValueShape>),
    /// `Set`/`List` of the given element shape.
    Collection(Box<ValueShape>, bool),
    /// A slice of the given component shape.
    Slice(Box<ValueShape>),
    /// An n-dimensional array of the given element kind.
    NdArray(PrimitiveCode),
}

/// Read a value of the given `shape` from `src`.
///
/// # Errors
/// Returns [`MarshalError`] if the buffer is short or malformed.
pub fn read_value(src: &mut BytesMut, shape: &ValueShape) -> Result<Value, MarshalError> {
    match shape {
        ValueShape::Scalar(code) => read_scalar(src, *code),
        ValueShape::Str => Ok(Value::Str(read_utf16(src)?)),
        ValueShape::PrimitiveArray(code) => Ok(Value::PrimitiveArray(read_primitive_array(src, *code)?)),
        ValueShape::ObjectArray(element_type) => {
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            let count = src.get_u32() as usize;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                elements.push(read_value(src, &ValueShape::Reference)?);
            }
            Ok(Value::ObjectArray {
                element_type: *element_type,
                elements,
            })
        }
        ValueShape::Reference => {
            if src.remaining() < 8 {
                return Err(MarshalError::DanglingHandle(Handle::NULL));
            }
            Ok(Value::Reference(Handle(src.get_u64())))
        }
        ValueShape::ClientObject => {
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            Ok(Value::ClientObject(src.get_i32()))
        }
        ValueShape::Map(key_shape, value_shape) => {
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            let count = src.get_u32() as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_value(src, key_shape)?;
                let val = read_value(src, value_shape)?;
                entries.push((key, val));
            }
            Ok(Value::Map(entries))
        }
        ValueShape::Collection(element_shape, is_set) => {
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            let count = src.get_u32() as usize;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                elements.push(read_value(src, element_shape)?);
            }
            Ok(if *is_set {
                Value::Set(elements)
            } else {
                Value::List(elements)
            })
        }
        ValueShape::Slice(component_shape) => {
            let start = read_value(src, component_shape)?;
            let stop = read_value(src, component_shape)?;
            let step = read_value(src, component_shape)?;
            Ok(Value::Slice {
                start: Box::new(start),
                stop: Box::new(stop),
                step: Box::new(step),
            })
        }
        ValueShape::NdArray(_code) => {
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            let dim_count = src.get_u32() as usize;
            let mut shape = Vec::with_capacity(dim_count);
            for _ in 0..dim_count {
                if src.remaining() < 4 {
                    return Err(MarshalError::InvalidString);
                }
                shape.push(src.get_i32());
            }
            if src.remaining() < 4 {
                return Err(MarshalError::InvalidString);
            }
            let chunk_count = src.get_u32() as usize;
            let mut chunks = Vec::with_capacity(chunk_count);
            for _ in 0..chunk_count {
                if src.remaining() < 1 {
                    return Err(MarshalError::InvalidString);
                }
                let code = PrimitiveCode::from_code(src.get_u8())
                    .ok_or(MarshalError::UnknownEncoding(0))?;
                chunks.push(read_primitive_array(src, code)?);
            }
            Ok(Value::NdArray { shape, chunks })
        }
    }
}

/// Whether a string of `char_count` UTF-16 code units should be
/// opportunistically inlined alongside its handle (`spec.md` §4.5).
#[must_use]
pub const fn should_inline_string(char_count: usize) -> bool { char_count < INLINE_STRING_MAX_CHARS }

/// The four argument encoding discriminators (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgEncoding {
    /// By-reference via a 64-bit handle.
    Reference,
    /// By-value as a type ID plus raw bytes.
    Value,
    /// By a filesystem-backed shared-memory region.
    SharedMemory,
    /// By a method/constructor reference bound into a functional-interface
    /// proxy.
    MethodHandle,
    /// By an immediately-invoked lambda whose result becomes the argument.
    Lambda,
}

impl ArgEncoding {
    /// Wire discriminator byte for this encoding.
    #[must_use]
    pub const fn wire_byte(self) -> u8 {
        match self {
            Self::Reference => 0,
            Self::Value => 1,
            Self::SharedMemory => 2,
            Self::MethodHandle => 3,
            Self::Lambda => 4,
        }
    }

    /// Parse a wire discriminator byte.
    #[must_use]
    pub const fn from_wire_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Reference,
            1 => Self::Value,
            2 => Self::SharedMemory,
            3 => Self::MethodHandle,
            4 => Self::Lambda,
            _ => return None,
        })
    }
}

/// A method-handle argument: binds a callable into a functional-interface
/// proxy rather than passing a value directly (`spec.md` §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHandleArg {
    /// Whether `callable_index` names a constructor rather than a method.
    pub is_constructor: bool,
    /// The target functional interface the resulting proxy implements.
    pub interface_type: TypeId,
    /// The type declaring the bound callable.
    pub owning_type: TypeId,
    /// Index of the bound callable within its type.
    pub callable_index: u32,
    /// Instance the callable is bound to, if not static.
    pub bound_instance: Option<Handle>,
}

/// A shared-memory argument descriptor (`spec.md` §4.5, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryArg {
    /// Backing file name.
    pub filename: String,
    /// Element count.
    pub count: u32,
    /// Element type code; `char` is not eligible for this channel.
    pub code: PrimitiveCode,
}

/// Resolve a [`Value::Reference`] through a handle table, translating an
/// unknown handle into [`MarshalError::DanglingHandle`].
///
/// # Errors
/// Returns [`MarshalError::DanglingHandle`] if the handle is not live, or
/// [`MarshalError::ConversionFailure`] if `value` is not a reference.
pub fn resolve_reference(
    value: &Value,
    handles: &HandleTable,
    target_type: TypeId,
) -> Result<Option<std::sync::Arc<dyn crate::registry::HostObject>>, MarshalError> {
    let Value::Reference(handle) = value else {
        return Err(MarshalError::ConversionFailure { target_type });
    };
    if handle.is_null() {
        return Ok(None);
    }
    handles.lookup(*handle).map(Some).ok_or(MarshalError::DanglingHandle(*handle))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn round_trip(value: &Value, shape: &ValueShape) -> Value {
        let mut buf = BytesMut::new();
        write_value(&mut buf, value);
        read_value(&mut buf, shape).expect("round trip decodes")
    }

    #[rstest]
    #[case(Value::Boolean(true), ValueShape::Scalar(PrimitiveCode::Boolean))]
    #[case(Value::Byte(-12), ValueShape::Scalar(PrimitiveCode::Byte))]
    #[case(Value::Short(-4000), ValueShape::Scalar(PrimitiveCode::Short))]
    #[case(Value::Char(0x4e2d), ValueShape::Scalar(PrimitiveCode::Char))]
    #[case(Value::Int(-70_000), ValueShape::Scalar(PrimitiveCode::Int))]
    #[case(Value::Long(-9_000_000_000), ValueShape::Scalar(PrimitiveCode::Long))]
    #[case(Value::Float(1.5), ValueShape::Scalar(PrimitiveCode::Float))]
    #[case(Value::Double(2.25), ValueShape::Scalar(PrimitiveCode::Double))]
    fn primitives_round_trip(#[case] value: Value, #[case] shape: ValueShape) {
        assert_eq!(round_trip(&value, &shape), value);
    }

    #[rstest]
    #[case("")]
    #[case("a")]
    fn short_strings_round_trip(#[case] s: &str) {
        let value = Value::Str(s.to_owned());
        assert_eq!(round_trip(&value, &ValueShape::Str), value);
    }

    #[test]
    fn string_length_class_boundaries_round_trip() {
        for len in [0_usize, 1, 32_767, 32_768, 65_536] {
            let s: String = "a".repeat(len);
            let value = Value::Str(s);
            assert_eq!(round_trip(&value, &ValueShape::Str), value);
        }
    }

    #[test]
    fn re_marshalling_a_string_is_byte_exact() {
        let value = Value::Str("hello \u{4e2d}\u{6587}".to_owned());
        let mut first = BytesMut::new();
        write_value(&mut first, &value);
        let mut second = BytesMut::new();
        let decoded = read_value(&mut first.clone(), &ValueShape::Str).expect("decodes");
        write_value(&mut second, &decoded);
        assert_eq!(first, second);
    }

    #[test]
    fn typed_primitive_array_round_trips() {
        let array = PrimitiveArray {
            code: PrimitiveCode::Int,
            packed: {
                let mut buf = BytesMut::new();
                buf.put_i32(1);
                buf.put_i32(-2);
                buf.put_i32(3);
                buf.to_vec()
            },
        };
        let value = Value::PrimitiveArray(array);
        let decoded = round_trip(&value, &ValueShape::PrimitiveArray(PrimitiveCode::Int));
        assert_eq!(decoded, value);
        let Value::PrimitiveArray(decoded_array) = decoded else {
            unreachable!("shape guarantees a primitive array")
        };
        assert_eq!(decoded_array.len(), 3);
    }

    #[test]
    fn list_of_ints_round_trips() {
        let value = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let shape = ValueShape::Collection(Box::new(ValueShape::Scalar(PrimitiveCode::Int)), false);
        assert_eq!(round_trip(&value, &shape), value);
    }

    #[test]
    fn set_of_strings_round_trips() {
        let value = Value::Set(vec![Value::Str("a".to_owned()), Value::Str("b".to_owned())]);
        let shape = ValueShape::Collection(Box::new(ValueShape::Str), true);
        assert_eq!(round_trip(&value, &shape), value);
    }

    #[test]
    fn map_round_trips() {
        let value = Value::Map(vec![(Value::Str("k".to_owned()), Value::Int(1))]);
        let shape = ValueShape::Map(Box::new(ValueShape::Str), Box::new(ValueShape::Scalar(PrimitiveCode::Int)));
        assert_eq!(round_trip(&value, &shape), value);
    }

    #[test]
    fn slice_triple_round_trips() {
        let value = Value::Slice {
            start: Box::new(Value::Int(0)),
            stop: Box::new(Value::Int(10)),
            step: Box::new(Value::Int(2)),
        };
        let shape = ValueShape::Slice(Box::new(ValueShape::Scalar(PrimitiveCode::Int)));
        assert_eq!(round_trip(&value, &shape), value);
    }

    #[test]
    fn reference_round_trips_including_null() {
        let value = Value::Reference(Handle::NULL);
        assert_eq!(round_trip(&value, &ValueShape::Reference), value);
        let value = Value::Reference(Handle(42));
        assert_eq!(round_trip(&value, &ValueShape::Reference), value);
    }

    #[rstest]
    #[case(0, Some(ArgEncoding::Reference))]
    #[case(1, Some(ArgEncoding::Value))]
    #[case(4, Some(ArgEncoding::Lambda))]
    #[case(200, None)]
    fn arg_encoding_round_trips(#[case] byte: u8, #[case] expected: Option<ArgEncoding>) {
        assert_eq!(ArgEncoding::from_wire_byte(byte), expected);
        if let Some(encoding) = expected {
            assert_eq!(encoding.wire_byte(), byte);
        }
    }

    #[test]
    fn inline_threshold_matches_spec() {
        assert!(should_inline_string(0));
        assert!(should_inline_string(32_767));
        assert!(!should_inline_string(32_768));
    }

    #[test]
    fn shared_memory_excludes_char() {
        assert!(!PrimitiveCode::Char.is_shared_memory_eligible());
        assert!(PrimitiveCode::Double.is_shared_memory_eligible());
    }
}
