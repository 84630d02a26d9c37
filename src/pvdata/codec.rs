//! Binary encoding of pvData values, sizes and strings.
//!
//! Everything is little-endian. Sizes use the PVA compact form: a single byte
//! when less than 254, otherwise `0xFE` followed by an `i32`. A lone `0xFF`
//! encodes "null".

use bytes::BufMut;
use thiserror::Error;

use super::{
    ChangeBitSet, ScalarArray, ScalarType, Structure, StructureDesc, TypeDescriptor,
    TypeMismatch, UnionValue, Value, join_path,
};

const NULL_SIZE: u8 = 0xFF;
const LONG_SIZE: u8 = 0xFE;

/// What went wrong while decoding
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    #[error("Buffer truncated, needed {0} more bytes")]
    Truncated(usize),
    #[error("Invalid type code 0x{0:02X}")]
    InvalidTypeCode(u8),
    #[error("Reference to unknown type ID {0}")]
    UnknownTypeId(u16),
    #[error("Type ID {0} redefined with a different layout")]
    RegistryConflict(u16),
    #[error("Repeat-previous type marker with no previous field")]
    NoPreviousField,
    #[error("Invalid size encoding")]
    InvalidSize,
    #[error("String is not valid UTF-8")]
    InvalidString,
    #[error("Union selector {0} out of range")]
    InvalidSelector(usize),
    #[error("Unexpected null where a value was required")]
    UnexpectedNull,
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Type nested deeper than {0} levels")]
    TooDeep(usize),
}

/// A decoding failure, and where in the buffer it happened
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} at byte offset {offset}")]
pub struct DecodeError {
    pub offset: usize,
    pub kind: DecodeErrorKind,
}

/// Cursor over a received buffer that reports the offset of any failure
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
}

macro_rules! read_le {
    ($name:ident, $t:ty) => {
        pub fn $name(&mut self) -> Result<$t, DecodeError> {
            let mut bytes = [0u8; std::mem::size_of::<$t>()];
            bytes.copy_from_slice(self.take(std::mem::size_of::<$t>())?);
            Ok(<$t>::from_le_bytes(bytes))
        }
    };
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        WireReader { data, position: 0 }
    }

    pub fn offset(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            offset: self.position,
            kind,
        }
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count > self.remaining() {
            return Err(self.error(DecodeErrorKind::Truncated(count - self.remaining())));
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.position..];
        self.position = self.data.len();
        slice
    }

    read_le!(u8, u8);
    read_le!(i8, i8);
    read_le!(u16, u16);
    read_le!(i16, i16);
    read_le!(u32, u32);
    read_le!(i32, i32);
    read_le!(u64, u64);
    read_le!(i64, i64);
    read_le!(f32, f32);
    read_le!(f64, f64);

    /// Read a compact size; None means "null"
    pub fn size(&mut self) -> Result<Option<usize>, DecodeError> {
        match self.u8()? {
            NULL_SIZE => Ok(None),
            LONG_SIZE => {
                let start = self.position;
                let size = self.i32()?;
                usize::try_from(size).map(Some).map_err(|_| DecodeError {
                    offset: start,
                    kind: DecodeErrorKind::InvalidSize,
                })
            }
            small => Ok(Some(small as usize)),
        }
    }

    /// Read a size that is not allowed to be null
    pub fn required_size(&mut self) -> Result<usize, DecodeError> {
        let start = self.position;
        self.size()?.ok_or(DecodeError {
            offset: start,
            kind: DecodeErrorKind::UnexpectedNull,
        })
    }

    /// Read a count of items each at least `min_item_size` bytes long,
    /// refusing counts the buffer cannot possibly hold
    pub fn count(&mut self, min_item_size: usize) -> Result<usize, DecodeError> {
        let count = self.required_size()?;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(self.error(DecodeErrorKind::Truncated(
                count.saturating_mul(min_item_size.max(1)) - self.remaining(),
            )));
        }
        Ok(count)
    }

    /// Read a size-prefixed UTF-8 string. A null string reads as empty.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let Some(len) = self.size()? else {
            return Ok(String::new());
        };
        let start = self.position;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError {
            offset: start,
            kind: DecodeErrorKind::InvalidString,
        })
    }
}

pub fn put_size(buf: &mut impl BufMut, size: Option<usize>) {
    match size {
        None => buf.put_u8(NULL_SIZE),
        Some(n) if n < LONG_SIZE as usize => buf.put_u8(n as u8),
        Some(n) => {
            buf.put_u8(LONG_SIZE);
            buf.put_i32_le(n.min(i32::MAX as usize) as i32);
        }
    }
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_size(buf, Some(value.len()));
    buf.put_slice(value.as_bytes());
}

/// Number of bytes `put_size` will use
pub fn size_len(size: usize) -> usize {
    if size < LONG_SIZE as usize { 1 } else { 5 }
}

/// Serialize a value according to its descriptor
pub fn encode_value(
    desc: &TypeDescriptor,
    value: &Value,
    buf: &mut impl BufMut,
) -> Result<(), TypeMismatch> {
    encode_value_at(desc, value, buf, "")
}

fn encode_value_at(
    desc: &TypeDescriptor,
    value: &Value,
    buf: &mut impl BufMut,
    path: &str,
) -> Result<(), TypeMismatch> {
    let mismatch = || TypeMismatch {
        path: path.to_owned(),
        expected: desc.short_name(),
    };
    match (desc, value) {
        (TypeDescriptor::Scalar(t), v) if v.scalar_type() == Some(*t) => {
            encode_scalar(v, buf);
            Ok(())
        }
        (TypeDescriptor::BoundedString(_), Value::String(s)) => {
            put_string(buf, s);
            Ok(())
        }
        (TypeDescriptor::ScalarArray(t), Value::Array(array)) if array.element_type() == *t => {
            encode_array(array, buf);
            Ok(())
        }
        (TypeDescriptor::Structure(sd), Value::Structure(s)) => encode_structure(sd, s, buf, path),
        (TypeDescriptor::Union(sd), Value::Union(u)) => match &u.selected {
            None => {
                put_size(buf, None);
                Ok(())
            }
            Some((index, inner)) => {
                let (name, variant) = sd.fields.get(*index).ok_or_else(mismatch)?;
                put_size(buf, Some(*index));
                encode_value_at(variant, inner, buf, &join_path(path, name))
            }
        },
        (TypeDescriptor::StructureArray(element), Value::StructureArray(items)) => {
            let element = element.as_structure().ok_or_else(mismatch)?;
            put_size(buf, Some(items.len()));
            for (i, item) in items.iter().enumerate() {
                // Each element carries a non-null marker
                buf.put_u8(1);
                encode_structure(element, item, buf, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

fn encode_structure(
    desc: &StructureDesc,
    value: &Structure,
    buf: &mut impl BufMut,
    path: &str,
) -> Result<(), TypeMismatch> {
    if desc.fields.len() != value.len() {
        return Err(TypeMismatch {
            path: path.to_owned(),
            expected: format!("{} fields", desc.fields.len()),
        });
    }
    for ((name, field_desc), (_, field)) in desc.fields.iter().zip(value.fields()) {
        encode_value_at(field_desc, field, buf, &join_path(path, name))?;
    }
    Ok(())
}

fn encode_scalar(value: &Value, buf: &mut impl BufMut) {
    match value {
        Value::Bool(v) => buf.put_u8(*v as u8),
        Value::Byte(v) => buf.put_i8(*v),
        Value::Short(v) => buf.put_i16_le(*v),
        Value::Int(v) => buf.put_i32_le(*v),
        Value::Long(v) => buf.put_i64_le(*v),
        Value::UByte(v) => buf.put_u8(*v),
        Value::UShort(v) => buf.put_u16_le(*v),
        Value::UInt(v) => buf.put_u32_le(*v),
        Value::ULong(v) => buf.put_u64_le(*v),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(v) => put_string(buf, v),
        _ => (),
    }
}

fn encode_array(array: &ScalarArray, buf: &mut impl BufMut) {
    put_size(buf, Some(array.len()));
    match array {
        ScalarArray::Bool(v) => v.iter().for_each(|x| buf.put_u8(*x as u8)),
        ScalarArray::Byte(v) => v.iter().for_each(|x| buf.put_i8(*x)),
        ScalarArray::Short(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
        ScalarArray::Int(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
        ScalarArray::Long(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
        ScalarArray::UByte(v) => buf.put_slice(v),
        ScalarArray::UShort(v) => v.iter().for_each(|x| buf.put_u16_le(*x)),
        ScalarArray::UInt(v) => v.iter().for_each(|x| buf.put_u32_le(*x)),
        ScalarArray::ULong(v) => v.iter().for_each(|x| buf.put_u64_le(*x)),
        ScalarArray::Float(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
        ScalarArray::Double(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
        ScalarArray::String(v) => v.iter().for_each(|x| put_string(buf, x)),
    }
}

/// Deserialize a value of a known type
pub fn decode_value(desc: &TypeDescriptor, reader: &mut WireReader) -> Result<Value, DecodeError> {
    Ok(match desc {
        TypeDescriptor::Scalar(t) => decode_scalar(*t, reader)?,
        TypeDescriptor::BoundedString(_) => Value::String(reader.string()?),
        TypeDescriptor::ScalarArray(t) => Value::Array(decode_array(*t, reader)?),
        TypeDescriptor::Structure(sd) => Value::Structure(decode_structure(sd, reader)?),
        TypeDescriptor::Union(sd) => {
            let start = reader.offset();
            match reader.size()? {
                None => Value::Union(UnionValue::empty()),
                Some(index) => {
                    let (_, variant) = sd.fields.get(index).ok_or(DecodeError {
                        offset: start,
                        kind: DecodeErrorKind::InvalidSelector(index),
                    })?;
                    Value::Union(UnionValue::new(index, decode_value(variant, reader)?))
                }
            }
        }
        TypeDescriptor::StructureArray(element) => {
            let Some(element) = element.as_structure() else {
                return Err(reader.error(DecodeErrorKind::InvalidValue(
                    "structure array of non-structure".to_owned(),
                )));
            };
            let count = reader.count(1)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                if reader.u8()? == 0 {
                    // Null elements are stored as default structures
                    items.push(Structure::default_for(element));
                } else {
                    items.push(decode_structure(element, reader)?);
                }
            }
            Value::StructureArray(items)
        }
    })
}

pub(crate) fn decode_structure(
    desc: &StructureDesc,
    reader: &mut WireReader,
) -> Result<Structure, DecodeError> {
    let mut structure = Structure::named(&desc.name);
    for (name, field_desc) in &desc.fields {
        structure.push(name.clone(), decode_value(field_desc, reader)?);
    }
    Ok(structure)
}

fn decode_scalar(t: ScalarType, reader: &mut WireReader) -> Result<Value, DecodeError> {
    Ok(match t {
        ScalarType::Boolean => Value::Bool(reader.u8()? != 0),
        ScalarType::Byte => Value::Byte(reader.i8()?),
        ScalarType::Short => Value::Short(reader.i16()?),
        ScalarType::Int => Value::Int(reader.i32()?),
        ScalarType::Long => Value::Long(reader.i64()?),
        ScalarType::UByte => Value::UByte(reader.u8()?),
        ScalarType::UShort => Value::UShort(reader.u16()?),
        ScalarType::UInt => Value::UInt(reader.u32()?),
        ScalarType::ULong => Value::ULong(reader.u64()?),
        ScalarType::Float => Value::Float(reader.f32()?),
        ScalarType::Double => Value::Double(reader.f64()?),
        ScalarType::String => Value::String(reader.string()?),
    })
}

fn decode_array(t: ScalarType, reader: &mut WireReader) -> Result<ScalarArray, DecodeError> {
    let count = reader.count(t.element_size().unwrap_or(1))?;
    macro_rules! collect {
        ($variant:ident, $read:ident) => {
            ScalarArray::$variant(
                (0..count)
                    .map(|_| reader.$read())
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
    }
    Ok(match t {
        ScalarType::Boolean => ScalarArray::Bool(
            reader.take(count)?.iter().map(|b| *b != 0).collect(),
        ),
        ScalarType::Byte => collect!(Byte, i8),
        ScalarType::Short => collect!(Short, i16),
        ScalarType::Int => collect!(Int, i32),
        ScalarType::Long => collect!(Long, i64),
        ScalarType::UByte => ScalarArray::UByte(reader.take(count)?.to_vec()),
        ScalarType::UShort => collect!(UShort, u16),
        ScalarType::UInt => collect!(UInt, u32),
        ScalarType::ULong => collect!(ULong, u64),
        ScalarType::Float => collect!(Float, f32),
        ScalarType::Double => collect!(Double, f64),
        ScalarType::String => collect!(String, string),
    })
}

/// Serialize only the fields marked in `changes`.
///
/// A set bit on a structure means the whole sub-structure is written; the
/// receiver decodes it in full.
pub fn encode_changed(
    desc: &StructureDesc,
    value: &Structure,
    changes: &ChangeBitSet,
    buf: &mut impl BufMut,
) -> Result<(), TypeMismatch> {
    if changes.get(0) {
        return encode_structure(desc, value, buf, "");
    }
    let mut index = 1;
    encode_changed_fields(desc, value, changes, buf, &mut index, "")
}

fn encode_changed_fields(
    desc: &StructureDesc,
    value: &Structure,
    changes: &ChangeBitSet,
    buf: &mut impl BufMut,
    index: &mut usize,
    path: &str,
) -> Result<(), TypeMismatch> {
    if desc.fields.len() != value.len() {
        return Err(TypeMismatch {
            path: path.to_owned(),
            expected: format!("{} fields", desc.fields.len()),
        });
    }
    for ((name, field_desc), (_, field)) in desc.fields.iter().zip(value.fields()) {
        let field_path = join_path(path, name);
        let span = field_desc.index_count();
        if changes.get(*index) {
            encode_value_at(field_desc, field, buf, &field_path)?;
        } else if let (TypeDescriptor::Structure(sd), Value::Structure(s)) = (field_desc, field) {
            if changes.any_in(*index + 1, *index + span) {
                let mut inner = *index + 1;
                encode_changed_fields(sd, s, changes, buf, &mut inner, &field_path)?;
            }
        }
        *index += span;
    }
    Ok(())
}

/// Decode the fields marked in `changes` into an existing value
pub fn decode_changed(
    desc: &StructureDesc,
    value: &mut Structure,
    changes: &ChangeBitSet,
    reader: &mut WireReader,
) -> Result<(), DecodeError> {
    if changes.get(0) {
        *value = decode_structure(desc, reader)?;
        return Ok(());
    }
    let mut index = 1;
    decode_changed_fields(desc, value, changes, reader, &mut index)
}

fn decode_changed_fields(
    desc: &StructureDesc,
    value: &mut Structure,
    changes: &ChangeBitSet,
    reader: &mut WireReader,
    index: &mut usize,
) -> Result<(), DecodeError> {
    if desc.fields.len() != value.len() {
        return Err(reader.error(DecodeErrorKind::InvalidValue(
            "structure value does not match its description".to_owned(),
        )));
    }
    for ((_, field_desc), (_, field)) in desc.fields.iter().zip(value.fields_mut()) {
        let span = field_desc.index_count();
        if changes.get(*index) {
            *field = decode_value(field_desc, reader)?;
        } else if let (TypeDescriptor::Structure(sd), Value::Structure(s)) = (field_desc, field) {
            if changes.any_in(*index + 1, *index + span) {
                let mut inner = *index + 1;
                decode_changed_fields(sd, s, changes, reader, &mut inner)?;
            }
        }
        *index += span;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(desc: &TypeDescriptor, value: &Value) -> Value {
        let mut buf = Vec::new();
        encode_value(desc, value, &mut buf).unwrap();
        let mut reader = WireReader::new(&buf);
        let decoded = decode_value(desc, &mut reader).unwrap();
        assert!(reader.is_empty(), "Trailing bytes after decode");
        decoded
    }

    #[test]
    fn test_size_encoding() {
        let mut buf = Vec::new();
        put_size(&mut buf, Some(253));
        put_size(&mut buf, Some(254));
        put_size(&mut buf, None);
        assert_eq!(buf, vec![253, 0xFE, 254, 0, 0, 0, 0xFF]);
        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.size().unwrap(), Some(253));
        assert_eq!(reader.size().unwrap(), Some(254));
        assert_eq!(reader.size().unwrap(), None);
        assert_eq!(size_len(253), 1);
        assert_eq!(size_len(254), 5);
    }

    #[test]
    fn test_scalars_are_little_endian() {
        let mut buf = Vec::new();
        encode_value(
            &TypeDescriptor::Scalar(ScalarType::Int),
            &Value::Int(0x01020304),
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_nan_and_empty_arrays() {
        let desc = TypeDescriptor::Structure(
            StructureDesc::new("")
                .field("nan", TypeDescriptor::Scalar(ScalarType::Double))
                .field("fnan", TypeDescriptor::ScalarArray(ScalarType::Float))
                .field("empty", TypeDescriptor::ScalarArray(ScalarType::String))
                .field("nothing", TypeDescriptor::Structure(StructureDesc::new("")))
                .field("flags", TypeDescriptor::ScalarArray(ScalarType::Boolean)),
        );
        let value: Value = Structure::new()
            .with("nan", f64::from_bits(0x7FF8_0000_0000_1234))
            .with("fnan", vec![f32::NAN, -0.0f32])
            .with("empty", Vec::<String>::new())
            .with("nothing", Structure::new())
            .with("flags", vec![true, false])
            .into();
        let decoded = round_trip(&desc, &value);
        assert_eq!(decoded, value);
        let Some(Value::Double(nan)) = decoded.as_structure().unwrap().get("nan") else {
            panic!("Missing field");
        };
        assert_eq!(nan.to_bits(), 0x7FF8_0000_0000_1234);
    }

    #[test]
    fn test_nested_unions() {
        let inner = TypeDescriptor::Union(
            StructureDesc::new("")
                .field("i", TypeDescriptor::Scalar(ScalarType::Int))
                .field("s", TypeDescriptor::Scalar(ScalarType::String)),
        );
        let outer = TypeDescriptor::Union(
            StructureDesc::new("outer")
                .field("d", TypeDescriptor::Scalar(ScalarType::Double))
                .field("nested", inner),
        );
        let value: Value = UnionValue::new(1, UnionValue::new(1, "deep".into()).into()).into();
        assert_eq!(round_trip(&outer, &value), value);
        let empty: Value = UnionValue::empty().into();
        assert_eq!(round_trip(&outer, &empty), empty);
    }

    #[test]
    fn test_structure_array() {
        let element = StructureDesc::new("point")
            .field("x", TypeDescriptor::Scalar(ScalarType::Double))
            .field("name", TypeDescriptor::Scalar(ScalarType::String));
        let desc = TypeDescriptor::StructureArray(Box::new(TypeDescriptor::Structure(element)));
        let value = Value::StructureArray(vec![
            Structure::named("point").with("x", 1.0).with("name", "a"),
            Structure::named("point").with("x", 2.5).with("name", "b"),
        ]);
        assert_eq!(round_trip(&desc, &value), value);
    }

    #[test]
    fn test_mismatch_is_reported() {
        let desc = TypeDescriptor::Scalar(ScalarType::Double);
        let mut buf = Vec::new();
        assert!(encode_value(&desc, &Value::Int(1), &mut buf).is_err());
    }

    #[test]
    fn test_truncated_reports_offset() {
        let desc = TypeDescriptor::Structure(
            StructureDesc::new("")
                .field("a", TypeDescriptor::Scalar(ScalarType::Int))
                .field("b", TypeDescriptor::Scalar(ScalarType::Double)),
        );
        let data = [1, 0, 0, 0, 9, 9];
        let err = decode_value(&desc, &mut WireReader::new(&data)).unwrap_err();
        assert_eq!(err.offset, 4);
        assert_eq!(err.kind, DecodeErrorKind::Truncated(6));
    }

    #[test]
    fn test_oversized_array_count_rejected() {
        // Claims 2^30 doubles in a 5 byte buffer
        let data = [0xFE, 0, 0, 0, 0x40];
        let err = decode_value(
            &TypeDescriptor::ScalarArray(ScalarType::Double),
            &mut WireReader::new(&data),
        )
        .unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::Truncated(_)));
    }

    #[test]
    fn test_partial_encoding() {
        let desc = StructureDesc::new("")
            .field("value", TypeDescriptor::Scalar(ScalarType::Double))
            .field(
                "alarm",
                TypeDescriptor::Structure(
                    StructureDesc::new("alarm_t")
                        .field("severity", TypeDescriptor::Scalar(ScalarType::Int))
                        .field("message", TypeDescriptor::Scalar(ScalarType::String)),
                ),
            )
            .field("tag", TypeDescriptor::Scalar(ScalarType::String));
        let full = Structure::new()
            .with("value", 1.5)
            .with(
                "alarm",
                Structure::named("alarm_t")
                    .with("severity", 2i32)
                    .with("message", "HIHI"),
            )
            .with("tag", "x");

        // value is 1, alarm 2, alarm.severity 3, alarm.message 4, tag 5
        let changes: ChangeBitSet = [3, 5].into_iter().collect();
        let mut buf = Vec::new();
        encode_changed(&desc, &full, &changes, &mut buf).unwrap();
        assert_eq!(buf, vec![2, 0, 0, 0, 1, b'x']);

        let mut target = Structure::default_for(&desc);
        decode_changed(&desc, &mut target, &changes, &mut WireReader::new(&buf)).unwrap();
        assert_eq!(target.locate("alarm.severity"), Some(&Value::Int(2)));
        assert_eq!(target.get("tag"), Some(&Value::from("x")));
        assert_eq!(target.get("value"), Some(&Value::Double(0.0)));

        // A structure bit carries the whole sub-structure
        let changes: ChangeBitSet = [2].into_iter().collect();
        let mut buf = Vec::new();
        encode_changed(&desc, &full, &changes, &mut buf).unwrap();
        let mut target = Structure::default_for(&desc);
        decode_changed(&desc, &mut target, &changes, &mut WireReader::new(&buf)).unwrap();
        assert_eq!(target.get("alarm"), full.get("alarm"));
    }
}
