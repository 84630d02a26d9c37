//! Represent PVA "pvData", the self-describing typed data exchanged over PV Access.
//!
//! Every value transferred over PVA travels with a description of its type. The
//! type system is structural: a handful of scalar kinds, arrays of those scalars,
//! and named structures and unions that nest arbitrarily. This module models the
//! two halves separately:
//!
//! - [`TypeDescriptor`] describes the layout: [`TypeDescriptor::Scalar`],
//!   [`TypeDescriptor::ScalarArray`], [`TypeDescriptor::BoundedString`],
//!   [`TypeDescriptor::Structure`], [`TypeDescriptor::Union`] and
//!   [`TypeDescriptor::StructureArray`]. Structures and unions carry an optional
//!   type name (e.g. `epics:nt/NTScalar:1.0`) and an ordered field list.
//! - [`Value`] carries the data. Structures keep their field order, because the
//!   protocol addresses fields positionally (see [`ChangeBitSet`]).
//!
//! A top-level [`PvStructure`] pairs a descriptor with a matching [`Structure`];
//! this is what reads, RPC calls and server PVs deal in.
//!
//! Serialization lives in [`codec`] (values, sizes, strings) and [`registry`]
//! (type descriptions, which are cached per connection and referred to by small
//! integer IDs after first use). [`bitset`] holds the change-tracking bitsets and
//! the pre-order field numbering they rely on. [`convert`] translates between
//! scalar kinds, for when a client writes e.g. an integer into a `double` field.
//!
//! Floating point values compare by bit pattern in this module, so that a NaN
//! that survives a round trip through the codec compares equal to itself.

pub mod bitset;
pub mod codec;
pub mod convert;
pub mod registry;

use std::fmt::{self, Display};

use thiserror::Error;

pub use bitset::{ChangeBitSet, FieldLayout};
pub use codec::{DecodeError, DecodeErrorKind, WireReader};
pub use convert::ConversionError;
pub use registry::TypeRegistry;

/// The basic scalar kinds of pvData
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UByte,
    UShort,
    UInt,
    ULong,
    Float,
    Double,
    String,
}

impl ScalarType {
    /// The type code used on the wire for a single value of this kind
    pub fn type_code(&self) -> u8 {
        match self {
            ScalarType::Boolean => 0x00,
            ScalarType::Byte => 0x20,
            ScalarType::Short => 0x21,
            ScalarType::Int => 0x22,
            ScalarType::Long => 0x23,
            ScalarType::UByte => 0x24,
            ScalarType::UShort => 0x25,
            ScalarType::UInt => 0x26,
            ScalarType::ULong => 0x27,
            ScalarType::Float => 0x42,
            ScalarType::Double => 0x43,
            ScalarType::String => 0x60,
        }
    }

    pub fn from_type_code(code: u8) -> Option<ScalarType> {
        Some(match code {
            0x00 => ScalarType::Boolean,
            0x20 => ScalarType::Byte,
            0x21 => ScalarType::Short,
            0x22 => ScalarType::Int,
            0x23 => ScalarType::Long,
            0x24 => ScalarType::UByte,
            0x25 => ScalarType::UShort,
            0x26 => ScalarType::UInt,
            0x27 => ScalarType::ULong,
            0x42 => ScalarType::Float,
            0x43 => ScalarType::Double,
            0x60 => ScalarType::String,
            _ => return None,
        })
    }

    /// Size of one encoded element, or None for strings
    pub fn element_size(&self) -> Option<usize> {
        match self {
            ScalarType::Boolean | ScalarType::Byte | ScalarType::UByte => Some(1),
            ScalarType::Short | ScalarType::UShort => Some(2),
            ScalarType::Int | ScalarType::UInt | ScalarType::Float => Some(4),
            ScalarType::Long | ScalarType::ULong | ScalarType::Double => Some(8),
            ScalarType::String => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Byte => "byte",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::UByte => "ubyte",
            ScalarType::UShort => "ushort",
            ScalarType::UInt => "uint",
            ScalarType::ULong => "ulong",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::String => "string",
        }
    }
}

/// Layout of a structure or union: a type name, and ordered named members
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StructureDesc {
    pub name: String,
    pub fields: Vec<(String, TypeDescriptor)>,
}

impl StructureDesc {
    /// The type id, or `structure` when it has none
    pub fn short_name(&self) -> String {
        if self.name.is_empty() {
            "structure".to_owned()
        } else {
            self.name.clone()
        }
    }

    pub fn new(name: &str) -> Self {
        StructureDesc {
            name: name.to_owned(),
            fields: Vec::new(),
        }
    }

    /// Builder-style append of a field
    pub fn field(mut self, name: &str, desc: TypeDescriptor) -> Self {
        self.fields.push((name.to_owned(), desc));
        self
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Find a nested member by dotted path, e.g. `timeStamp.userTag`
    pub fn locate(&self, path: &str) -> Option<&TypeDescriptor> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let found = self.get(head)?;
        match rest {
            None => Some(found),
            Some(rest) => found.as_structure()?.locate(rest),
        }
    }
}

/// Describes the layout of a piece of pvData
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Scalar(ScalarType),
    ScalarArray(ScalarType),
    /// A string with a maximum length
    BoundedString(u32),
    Structure(StructureDesc),
    Union(StructureDesc),
    /// Array of structures; the contained descriptor is always a Structure
    StructureArray(Box<TypeDescriptor>),
}

impl TypeDescriptor {
    /// Structures and unions are the types that get registry IDs
    pub fn is_complex(&self) -> bool {
        matches!(self, TypeDescriptor::Structure(_) | TypeDescriptor::Union(_))
    }

    pub fn as_structure(&self) -> Option<&StructureDesc> {
        match self {
            TypeDescriptor::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// How many change-bit indices this type occupies in the pre-order numbering
    pub fn index_count(&self) -> usize {
        match self {
            TypeDescriptor::Structure(s) => {
                1 + s.fields.iter().map(|(_, d)| d.index_count()).sum::<usize>()
            }
            _ => 1,
        }
    }

    /// The value a freshly created field of this type holds
    pub fn default_value(&self) -> Value {
        match self {
            TypeDescriptor::Scalar(t) => Value::default_scalar(*t),
            TypeDescriptor::ScalarArray(t) => Value::Array(ScalarArray::empty(*t)),
            TypeDescriptor::BoundedString(_) => Value::String(String::new()),
            TypeDescriptor::Structure(s) => Value::Structure(Structure::default_for(s)),
            TypeDescriptor::Union(_) => Value::Union(UnionValue::empty()),
            TypeDescriptor::StructureArray(_) => Value::StructureArray(Vec::new()),
        }
    }

    /// Check that a value is laid out the way this descriptor says
    pub fn check(&self, value: &Value) -> Result<(), TypeMismatch> {
        self.check_at(value, "")
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), TypeMismatch> {
        let mismatch = || TypeMismatch {
            path: path.to_owned(),
            expected: self.short_name(),
        };
        match (self, value) {
            (TypeDescriptor::Scalar(t), v) if v.scalar_type() == Some(*t) => Ok(()),
            (TypeDescriptor::ScalarArray(t), Value::Array(a)) if a.element_type() == *t => Ok(()),
            (TypeDescriptor::BoundedString(bound), Value::String(s)) => {
                if s.len() <= *bound as usize {
                    Ok(())
                } else {
                    Err(mismatch())
                }
            }
            (TypeDescriptor::Structure(desc), Value::Structure(s)) => {
                desc.check_structure(s, path)
            }
            (TypeDescriptor::Union(desc), Value::Union(u)) => match &u.selected {
                None => Ok(()),
                Some((index, inner)) => match desc.fields.get(*index) {
                    Some((name, variant)) => variant.check_at(inner, &join_path(path, name)),
                    None => Err(mismatch()),
                },
            },
            (TypeDescriptor::StructureArray(element), Value::StructureArray(items)) => {
                let Some(element) = element.as_structure() else {
                    return Err(mismatch());
                };
                for (i, item) in items.iter().enumerate() {
                    element.check_structure(item, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    /// A one-line name for the type, e.g. `double[]` or `structure`
    pub fn short_name(&self) -> String {
        match self {
            TypeDescriptor::Scalar(t) => t.name().to_owned(),
            TypeDescriptor::ScalarArray(t) => format!("{}[]", t.name()),
            TypeDescriptor::BoundedString(n) => format!("string({n})"),
            TypeDescriptor::Structure(s) => s.short_name(),
            TypeDescriptor::Union(s) if s.name.is_empty() => "union".to_owned(),
            TypeDescriptor::Union(s) => s.name.clone(),
            TypeDescriptor::StructureArray(e) => format!("{}[]", e.short_name()),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, name: &str, level: usize) -> fmt::Result {
        write!(f, "{:indent$}{} {name}", "", self.short_name(), indent = level * 4)?;
        let members = match self {
            TypeDescriptor::Structure(s) | TypeDescriptor::Union(s) => &s.fields[..],
            TypeDescriptor::StructureArray(e) => match e.as_ref() {
                TypeDescriptor::Structure(s) => &s.fields[..],
                _ => &[],
            },
            _ => &[],
        };
        for (member, desc) in members {
            writeln!(f)?;
            desc.fmt_indented(f, member, level + 1)?;
        }
        Ok(())
    }
}

impl Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, "", 0)
    }
}

impl StructureDesc {
    fn check_structure(&self, value: &Structure, path: &str) -> Result<(), TypeMismatch> {
        if value.fields.len() != self.fields.len() {
            return Err(TypeMismatch {
                path: path.to_owned(),
                expected: format!("{} fields", self.fields.len()),
            });
        }
        for ((name, desc), (value_name, value)) in self.fields.iter().zip(value.fields.iter()) {
            let field_path = join_path(path, name);
            if name != value_name {
                return Err(TypeMismatch {
                    path: field_path,
                    expected: format!("field '{name}', got '{value_name}'"),
                });
            }
            desc.check_at(value, &field_path)?;
        }
        Ok(())
    }
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}.{name}")
    }
}

/// A value did not match the type it was supposed to have
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Value does not match type at '{path}': expected {expected}")]
pub struct TypeMismatch {
    pub path: String,
    pub expected: String,
}

/// Typed arrays of scalars
#[derive(Debug, Clone)]
pub enum ScalarArray {
    Bool(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    UByte(Vec<u8>),
    UShort(Vec<u16>),
    UInt(Vec<u32>),
    ULong(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

impl ScalarArray {
    pub fn empty(element: ScalarType) -> Self {
        match element {
            ScalarType::Boolean => ScalarArray::Bool(Vec::new()),
            ScalarType::Byte => ScalarArray::Byte(Vec::new()),
            ScalarType::Short => ScalarArray::Short(Vec::new()),
            ScalarType::Int => ScalarArray::Int(Vec::new()),
            ScalarType::Long => ScalarArray::Long(Vec::new()),
            ScalarType::UByte => ScalarArray::UByte(Vec::new()),
            ScalarType::UShort => ScalarArray::UShort(Vec::new()),
            ScalarType::UInt => ScalarArray::UInt(Vec::new()),
            ScalarType::ULong => ScalarArray::ULong(Vec::new()),
            ScalarType::Float => ScalarArray::Float(Vec::new()),
            ScalarType::Double => ScalarArray::Double(Vec::new()),
            ScalarType::String => ScalarArray::String(Vec::new()),
        }
    }

    pub fn element_type(&self) -> ScalarType {
        match self {
            ScalarArray::Bool(_) => ScalarType::Boolean,
            ScalarArray::Byte(_) => ScalarType::Byte,
            ScalarArray::Short(_) => ScalarType::Short,
            ScalarArray::Int(_) => ScalarType::Int,
            ScalarArray::Long(_) => ScalarType::Long,
            ScalarArray::UByte(_) => ScalarType::UByte,
            ScalarArray::UShort(_) => ScalarType::UShort,
            ScalarArray::UInt(_) => ScalarType::UInt,
            ScalarArray::ULong(_) => ScalarType::ULong,
            ScalarArray::Float(_) => ScalarType::Float,
            ScalarArray::Double(_) => ScalarType::Double,
            ScalarArray::String(_) => ScalarType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScalarArray::Bool(v) => v.len(),
            ScalarArray::Byte(v) => v.len(),
            ScalarArray::Short(v) => v.len(),
            ScalarArray::Int(v) => v.len(),
            ScalarArray::Long(v) => v.len(),
            ScalarArray::UByte(v) => v.len(),
            ScalarArray::UShort(v) => v.len(),
            ScalarArray::UInt(v) => v.len(),
            ScalarArray::ULong(v) => v.len(),
            ScalarArray::Float(v) => v.len(),
            ScalarArray::Double(v) => v.len(),
            ScalarArray::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into individual scalar values
    pub fn to_values(&self) -> Vec<Value> {
        match self {
            ScalarArray::Bool(v) => v.iter().map(|x| Value::Bool(*x)).collect(),
            ScalarArray::Byte(v) => v.iter().map(|x| Value::Byte(*x)).collect(),
            ScalarArray::Short(v) => v.iter().map(|x| Value::Short(*x)).collect(),
            ScalarArray::Int(v) => v.iter().map(|x| Value::Int(*x)).collect(),
            ScalarArray::Long(v) => v.iter().map(|x| Value::Long(*x)).collect(),
            ScalarArray::UByte(v) => v.iter().map(|x| Value::UByte(*x)).collect(),
            ScalarArray::UShort(v) => v.iter().map(|x| Value::UShort(*x)).collect(),
            ScalarArray::UInt(v) => v.iter().map(|x| Value::UInt(*x)).collect(),
            ScalarArray::ULong(v) => v.iter().map(|x| Value::ULong(*x)).collect(),
            ScalarArray::Float(v) => v.iter().map(|x| Value::Float(*x)).collect(),
            ScalarArray::Double(v) => v.iter().map(|x| Value::Double(*x)).collect(),
            ScalarArray::String(v) => v.iter().map(|x| Value::String(x.clone())).collect(),
        }
    }

    /// Gather scalars that are all already of the `element` kind
    pub fn from_values(element: ScalarType, values: Vec<Value>) -> Option<ScalarArray> {
        macro_rules! gather {
            ($variant:ident) => {
                ScalarArray::$variant(
                    values
                        .into_iter()
                        .map(|v| match v {
                            Value::$variant(x) => Some(x),
                            _ => None,
                        })
                        .collect::<Option<Vec<_>>>()?,
                )
            };
        }
        Some(match element {
            ScalarType::Boolean => gather!(Bool),
            ScalarType::Byte => gather!(Byte),
            ScalarType::Short => gather!(Short),
            ScalarType::Int => gather!(Int),
            ScalarType::Long => gather!(Long),
            ScalarType::UByte => gather!(UByte),
            ScalarType::UShort => gather!(UShort),
            ScalarType::UInt => gather!(UInt),
            ScalarType::ULong => gather!(ULong),
            ScalarType::Float => gather!(Float),
            ScalarType::Double => gather!(Double),
            ScalarType::String => gather!(String),
        })
    }
}

impl PartialEq for ScalarArray {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScalarArray::Float(a), ScalarArray::Float(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ScalarArray::Double(a), ScalarArray::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ScalarArray::Bool(a), ScalarArray::Bool(b)) => a == b,
            (ScalarArray::Byte(a), ScalarArray::Byte(b)) => a == b,
            (ScalarArray::Short(a), ScalarArray::Short(b)) => a == b,
            (ScalarArray::Int(a), ScalarArray::Int(b)) => a == b,
            (ScalarArray::Long(a), ScalarArray::Long(b)) => a == b,
            (ScalarArray::UByte(a), ScalarArray::UByte(b)) => a == b,
            (ScalarArray::UShort(a), ScalarArray::UShort(b)) => a == b,
            (ScalarArray::UInt(a), ScalarArray::UInt(b)) => a == b,
            (ScalarArray::ULong(a), ScalarArray::ULong(b)) => a == b,
            (ScalarArray::String(a), ScalarArray::String(b)) => a == b,
            _ => false,
        }
    }
}

/// A structure value: named fields, in wire order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Structure {
    pub type_name: String,
    fields: Vec<(String, Value)>,
}

impl Structure {
    pub fn new() -> Self {
        Structure::default()
    }

    /// Create an empty structure with a type name, e.g. `epics:nt/NTScalar:1.0`
    pub fn named(type_name: &str) -> Self {
        Structure {
            type_name: type_name.to_owned(),
            fields: Vec::new(),
        }
    }

    /// Builder-style append of a field
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.push((name.to_owned(), value.into()));
        self
    }

    /// A structure populated with default values for every member of `desc`
    pub fn default_for(desc: &StructureDesc) -> Self {
        Structure {
            type_name: desc.name.clone(),
            fields: desc
                .fields
                .iter()
                .map(|(name, d)| (name.clone(), d.default_value()))
                .collect(),
        }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut [(String, Value)] {
        &mut self.fields
    }

    pub(crate) fn push(&mut self, name: String, value: Value) {
        self.fields.push((name, value));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Find a nested value by dotted path
    pub fn locate(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, rest)) => match self.get(head)? {
                Value::Structure(s) => s.locate(rest),
                _ => None,
            },
        }
    }

    pub fn locate_mut(&mut self, path: &str) -> Option<&mut Value> {
        match path.split_once('.') {
            None => self.get_mut(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Structure(s) => s.locate_mut(rest),
                _ => None,
            },
        }
    }

    /// Infer a descriptor from the contents. Fails for unions and empty
    /// structure arrays, whose layout cannot be seen from the data alone.
    pub fn infer_type(&self) -> Option<StructureDesc> {
        Some(StructureDesc {
            name: self.type_name.clone(),
            fields: self
                .fields
                .iter()
                .map(|(name, v)| Some((name.clone(), v.infer_type()?)))
                .collect::<Option<Vec<_>>>()?,
        })
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:indent$}{name}", "", indent = level * 4)?;
            match value {
                Value::Structure(s) => {
                    if !s.is_empty() {
                        writeln!(f)?;
                        s.fmt_indented(f, level + 1)?;
                    }
                }
                other => write!(f, " {other}")?,
            }
        }
        Ok(())
    }
}

impl Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// A union value: which variant is selected (by index), and its value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnionValue {
    pub selected: Option<(usize, Box<Value>)>,
}

impl UnionValue {
    pub fn empty() -> Self {
        UnionValue { selected: None }
    }
    pub fn new(index: usize, value: Value) -> Self {
        UnionValue {
            selected: Some((index, Box::new(value))),
        }
    }
}

/// A piece of pvData
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
    Array(ScalarArray),
    Structure(Structure),
    Union(UnionValue),
    StructureArray(Vec<Structure>),
}

impl Value {
    pub fn default_scalar(t: ScalarType) -> Value {
        match t {
            ScalarType::Boolean => Value::Bool(false),
            ScalarType::Byte => Value::Byte(0),
            ScalarType::Short => Value::Short(0),
            ScalarType::Int => Value::Int(0),
            ScalarType::Long => Value::Long(0),
            ScalarType::UByte => Value::UByte(0),
            ScalarType::UShort => Value::UShort(0),
            ScalarType::UInt => Value::UInt(0),
            ScalarType::ULong => Value::ULong(0),
            ScalarType::Float => Value::Float(0.0),
            ScalarType::Double => Value::Double(0.0),
            ScalarType::String => Value::String(String::new()),
        }
    }

    /// The scalar kind, if this is a scalar
    pub fn scalar_type(&self) -> Option<ScalarType> {
        Some(match self {
            Value::Bool(_) => ScalarType::Boolean,
            Value::Byte(_) => ScalarType::Byte,
            Value::Short(_) => ScalarType::Short,
            Value::Int(_) => ScalarType::Int,
            Value::Long(_) => ScalarType::Long,
            Value::UByte(_) => ScalarType::UByte,
            Value::UShort(_) => ScalarType::UShort,
            Value::UInt(_) => ScalarType::UInt,
            Value::ULong(_) => ScalarType::ULong,
            Value::Float(_) => ScalarType::Float,
            Value::Double(_) => ScalarType::Double,
            Value::String(_) => ScalarType::String,
            _ => return None,
        })
    }

    pub fn infer_type(&self) -> Option<TypeDescriptor> {
        if let Some(t) = self.scalar_type() {
            return Some(TypeDescriptor::Scalar(t));
        }
        match self {
            Value::Array(a) => Some(TypeDescriptor::ScalarArray(a.element_type())),
            Value::Structure(s) => Some(TypeDescriptor::Structure(s.infer_type()?)),
            Value::StructureArray(items) => Some(TypeDescriptor::StructureArray(Box::new(
                TypeDescriptor::Structure(items.first()?.infer_type()?),
            ))),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&Structure> {
        match self {
            Value::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of a scalar, for convenience when displaying or comparing
    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            Value::Bool(b) => *b as u8 as f64,
            Value::Byte(v) => *v as f64,
            Value::Short(v) => *v as f64,
            Value::Int(v) => *v as f64,
            Value::Long(v) => *v as f64,
            Value::UByte(v) => *v as f64,
            Value::UShort(v) => *v as f64,
            Value::UInt(v) => *v as f64,
            Value::ULong(v) => *v as f64,
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            _ => return None,
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::UByte(a), Value::UByte(b)) => a == b,
            (Value::UShort(a), Value::UShort(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::ULong(a), Value::ULong(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Structure(a), Value::Structure(b)) => a == b,
            (Value::Union(a), Value::Union(b)) => a == b,
            (Value::StructureArray(a), Value::StructureArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::UByte(v) => write!(f, "{v}"),
            Value::UShort(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::ULong(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Array(a) => {
                let items: Vec<String> = a.to_values().iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Structure(s) => write!(f, "{s}"),
            Value::Union(u) => match &u.selected {
                None => write!(f, "(none)"),
                Some((i, v)) => write!(f, "({i}) {v}"),
            },
            Value::StructureArray(items) => write!(f, "[{} structures]", items.len()),
        }
    }
}

macro_rules! value_from {
    ($native:ty, $variant:ident) => {
        impl From<$native> for Value {
            fn from(value: $native) -> Self {
                Value::$variant(value)
            }
        }
        impl From<Vec<$native>> for Value {
            fn from(value: Vec<$native>) -> Self {
                Value::Array(ScalarArray::$variant(value))
            }
        }
    };
}
value_from!(bool, Bool);
value_from!(i8, Byte);
value_from!(i16, Short);
value_from!(i32, Int);
value_from!(i64, Long);
value_from!(u8, UByte);
value_from!(u16, UShort);
value_from!(u32, UInt);
value_from!(u64, ULong);
value_from!(f32, Float);
value_from!(f64, Double);
value_from!(String, String);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}
impl From<Structure> for Value {
    fn from(value: Structure) -> Self {
        Value::Structure(value)
    }
}
impl From<ScalarArray> for Value {
    fn from(value: ScalarArray) -> Self {
        Value::Array(value)
    }
}
impl From<UnionValue> for Value {
    fn from(value: UnionValue) -> Self {
        Value::Union(value)
    }
}

/// A top-level structure together with its type description
#[derive(Debug, Clone, PartialEq)]
pub struct PvStructure {
    desc: TypeDescriptor,
    value: Structure,
}

impl PvStructure {
    /// Pair a value with its description, checking that they match
    pub fn new(desc: StructureDesc, value: Structure) -> Result<Self, TypeMismatch> {
        let desc = TypeDescriptor::Structure(desc);
        desc.check_at(&Value::Structure(value.clone()), "")?;
        Ok(PvStructure { desc, value })
    }

    /// Build from a structure with no unions or empty structure arrays,
    /// inferring the descriptor.
    pub fn from_value(value: Structure) -> Result<Self, TypeMismatch> {
        let desc = value.infer_type().ok_or_else(|| TypeMismatch {
            path: String::new(),
            expected: "a structure whose type can be inferred".to_owned(),
        })?;
        Ok(PvStructure {
            desc: TypeDescriptor::Structure(desc),
            value,
        })
    }

    /// An empty, unnamed structure
    pub fn empty() -> Self {
        PvStructure {
            desc: TypeDescriptor::Structure(StructureDesc::default()),
            value: Structure::default(),
        }
    }

    pub(crate) fn new_unchecked(desc: TypeDescriptor, value: Structure) -> Self {
        debug_assert!(desc.as_structure().is_some());
        PvStructure { desc, value }
    }

    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.desc
    }

    pub fn structure_desc(&self) -> &StructureDesc {
        match &self.desc {
            TypeDescriptor::Structure(s) => s,
            _ => unreachable!("PvStructure is always constructed with a structure descriptor"),
        }
    }

    pub fn value(&self) -> &Structure {
        &self.value
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }

    pub fn locate(&self, path: &str) -> Option<&Value> {
        self.value.locate(path)
    }

    pub fn into_value(self) -> Structure {
        self.value
    }

    pub fn into_parts(self) -> (TypeDescriptor, Structure) {
        (self.desc, self.value)
    }
}

impl TryFrom<Structure> for PvStructure {
    type Error = TypeMismatch;
    fn try_from(value: Structure) -> Result<Self, Self::Error> {
        PvStructure::from_value(value)
    }
}

impl Display for PvStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> Structure {
        Structure::named("demo_t")
            .with("value", 3.13)
            .with("tag", "Hello!")
            .with("timeStamp", Structure::new().with("userTag", 0i32))
    }

    #[test]
    fn test_infer_and_check() {
        let pv = PvStructure::from_value(demo()).unwrap();
        let desc = pv.structure_desc();
        assert_eq!(desc.name, "demo_t");
        assert_eq!(
            desc.locate("timeStamp.userTag"),
            Some(&TypeDescriptor::Scalar(ScalarType::Int))
        );
        assert_eq!(pv.type_descriptor().index_count(), 5);

        // Same names, wrong kind
        let wrong = Structure::named("demo_t")
            .with("value", 3i32)
            .with("tag", "Hello!")
            .with("timeStamp", Structure::new().with("userTag", 0i32));
        let err = pv.type_descriptor().check(&wrong.into()).unwrap_err();
        assert_eq!(err.path, "value");
    }

    #[test]
    fn test_nan_equality_is_bitwise() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::from(vec![f32::NAN]), Value::from(vec![f32::NAN]));
    }

    #[test]
    fn test_locate() {
        let mut s = demo();
        assert_eq!(s.locate("timeStamp.userTag"), Some(&Value::Int(0)));
        *s.locate_mut("timeStamp.userTag").unwrap() = Value::Int(4);
        assert_eq!(s.locate("timeStamp.userTag"), Some(&Value::Int(4)));
        assert!(s.locate("value.nope").is_none());
    }

    #[test]
    fn test_union_check() {
        let desc = TypeDescriptor::Union(
            StructureDesc::new("")
                .field("d", TypeDescriptor::Scalar(ScalarType::Double))
                .field("s", TypeDescriptor::Scalar(ScalarType::String)),
        );
        assert!(desc.check(&UnionValue::new(1, "x".into()).into()).is_ok());
        assert!(desc.check(&UnionValue::new(0, "x".into()).into()).is_err());
        assert!(desc.check(&UnionValue::new(2, 1.0.into()).into()).is_err());
        assert!(desc.check(&UnionValue::empty().into()).is_ok());
    }

    #[test]
    fn test_display_type() {
        let pv = PvStructure::from_value(demo()).unwrap();
        let text = pv.type_descriptor().to_string();
        assert!(text.starts_with("demo_t"));
        assert!(text.contains("    double value"));
        assert!(text.contains("        int userTag"));
    }
}
