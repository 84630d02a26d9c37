//! Per-connection cache of structure and union type descriptions.
//!
//! The first time a structure layout is sent over a connection it is written in
//! full, prefixed with a freshly assigned ID. Afterwards only the ID is sent.
//! Each direction of a connection keeps its own registry: the sending side
//! assigns IDs, the receiving side records what the peer assigned.

use std::collections::HashMap;

use bytes::BufMut;

use super::{
    DecodeError, DecodeErrorKind, ScalarType, StructureDesc, TypeDescriptor, WireReader,
    codec::{put_size, put_string},
};

pub const NULL_TYPE_CODE: u8 = 0xFF;
pub const ONLY_ID_TYPE_CODE: u8 = 0xFE;
pub const FULL_WITH_ID_TYPE_CODE: u8 = 0xFD;
/// Field has the same complex type as the field before it
pub const SAME_AS_PREVIOUS_TYPE_CODE: u8 = 0xFC;

const STRUCTURE_CODE: u8 = 0x80;
const UNION_CODE: u8 = 0x81;
const BOUNDED_STRING_CODE: u8 = 0x83;
const STRUCTURE_ARRAY_CODE: u8 = 0x88;
const ARRAY_KIND_MASK: u8 = 0x18;
const VARIABLE_ARRAY_FLAG: u8 = 0x08;

/// Default number of IDs a connection will hand out
pub const DEFAULT_REGISTRY_SIZE: usize = 65535;
/// Deepest nesting of structures accepted from a peer
pub const MAX_TYPE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<Option<TypeDescriptor>>,
    lookup: HashMap<TypeDescriptor, u16>,
    capacity: usize,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::with_capacity(DEFAULT_REGISTRY_SIZE)
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// A registry that will assign at most `capacity` IDs. Once full,
    /// further layouts are sent as bare descriptions.
    pub fn with_capacity(capacity: usize) -> Self {
        TypeRegistry {
            types: Vec::new(),
            lookup: HashMap::new(),
            capacity: capacity.min(u16::MAX as usize),
        }
    }

    pub fn get(&self, id: u16) -> Option<&TypeDescriptor> {
        self.types.get(id as usize).and_then(|t| t.as_ref())
    }

    pub fn id_of(&self, desc: &TypeDescriptor) -> Option<u16> {
        self.lookup.get(desc).copied()
    }

    /// Number of bound IDs
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Assign the next free ID to a layout. ID 0 is never used.
    fn allocate(&mut self, desc: &TypeDescriptor) -> Option<u16> {
        if self.lookup.len() >= self.capacity {
            return None;
        }
        let id = self.types.len().max(1);
        let id = u16::try_from(id).ok()?;
        self.types.resize(id as usize + 1, None);
        self.types[id as usize] = Some(desc.clone());
        self.lookup.insert(desc.clone(), id);
        Some(id)
    }

    /// Record an ID assigned by the peer. Rebinding to the identical layout
    /// is harmless; rebinding to anything else is an error.
    pub fn bind(&mut self, id: u16, desc: TypeDescriptor) -> Result<(), DecodeErrorKind> {
        if let Some(existing) = self.get(id) {
            return if *existing == desc {
                Ok(())
            } else {
                Err(DecodeErrorKind::RegistryConflict(id))
            };
        }
        if self.types.len() <= id as usize {
            self.types.resize(id as usize + 1, None);
        }
        self.types[id as usize] = Some(desc.clone());
        self.lookup.entry(desc).or_insert(id);
        Ok(())
    }

    /// Write a type description, registering structure layouts as needed
    pub fn encode_type(&mut self, desc: &TypeDescriptor, buf: &mut impl BufMut) {
        match desc {
            TypeDescriptor::Scalar(t) => buf.put_u8(t.type_code()),
            TypeDescriptor::ScalarArray(t) => buf.put_u8(t.type_code() | VARIABLE_ARRAY_FLAG),
            TypeDescriptor::BoundedString(bound) => {
                buf.put_u8(BOUNDED_STRING_CODE);
                put_size(buf, Some(*bound as usize));
            }
            TypeDescriptor::StructureArray(element) => {
                buf.put_u8(STRUCTURE_ARRAY_CODE);
                self.encode_type(element, buf);
            }
            TypeDescriptor::Structure(sd) | TypeDescriptor::Union(sd) => {
                if let Some(id) = self.id_of(desc) {
                    buf.put_u8(ONLY_ID_TYPE_CODE);
                    buf.put_u16_le(id);
                    return;
                }
                if let Some(id) = self.allocate(desc) {
                    buf.put_u8(FULL_WITH_ID_TYPE_CODE);
                    buf.put_u16_le(id);
                }
                buf.put_u8(if matches!(desc, TypeDescriptor::Structure(_)) {
                    STRUCTURE_CODE
                } else {
                    UNION_CODE
                });
                self.encode_members(sd, buf);
            }
        }
    }

    fn encode_members(&mut self, sd: &StructureDesc, buf: &mut impl BufMut) {
        put_string(buf, &sd.name);
        put_size(buf, Some(sd.fields.len()));
        let mut previous: Option<&TypeDescriptor> = None;
        for (name, field) in &sd.fields {
            put_string(buf, name);
            if field.is_complex() && previous == Some(field) {
                buf.put_u8(SAME_AS_PREVIOUS_TYPE_CODE);
            } else {
                self.encode_type(field, buf);
            }
            previous = Some(field);
        }
    }

    /// Write an optional type, with None as the null type code
    pub fn encode_optional_type(&mut self, desc: Option<&TypeDescriptor>, buf: &mut impl BufMut) {
        match desc {
            Some(desc) => self.encode_type(desc, buf),
            None => buf.put_u8(NULL_TYPE_CODE),
        }
    }

    /// Read a type description, recording any IDs the peer defines
    pub fn decode_type(&mut self, reader: &mut WireReader) -> Result<TypeDescriptor, DecodeError> {
        self.decode_field_type(reader, None, 0)
    }

    /// Read a type that may be the null type code
    pub fn decode_optional_type(
        &mut self,
        reader: &mut WireReader,
    ) -> Result<Option<TypeDescriptor>, DecodeError> {
        let mut peek = reader.clone();
        if peek.u8()? == NULL_TYPE_CODE {
            *reader = peek;
            return Ok(None);
        }
        self.decode_type(reader).map(Some)
    }

    fn decode_field_type(
        &mut self,
        reader: &mut WireReader,
        previous: Option<&TypeDescriptor>,
        depth: usize,
    ) -> Result<TypeDescriptor, DecodeError> {
        let start = reader.offset();
        let at_start = |kind| DecodeError {
            offset: start,
            kind,
        };
        if depth > MAX_TYPE_DEPTH {
            return Err(at_start(DecodeErrorKind::TooDeep(MAX_TYPE_DEPTH)));
        }
        let code = reader.u8()?;
        match code {
            ONLY_ID_TYPE_CODE => {
                let id = reader.u16()?;
                self.get(id)
                    .cloned()
                    .ok_or(at_start(DecodeErrorKind::UnknownTypeId(id)))
            }
            FULL_WITH_ID_TYPE_CODE => {
                let id = reader.u16()?;
                let desc = self.decode_field_type(reader, None, depth + 1)?;
                if !desc.is_complex() {
                    return Err(at_start(DecodeErrorKind::InvalidTypeCode(code)));
                }
                self.bind(id, desc.clone()).map_err(at_start)?;
                Ok(desc)
            }
            SAME_AS_PREVIOUS_TYPE_CODE => previous
                .cloned()
                .ok_or(at_start(DecodeErrorKind::NoPreviousField)),
            STRUCTURE_CODE => Ok(TypeDescriptor::Structure(self.decode_members(reader, depth)?)),
            UNION_CODE => Ok(TypeDescriptor::Union(self.decode_members(reader, depth)?)),
            BOUNDED_STRING_CODE => {
                let bound = reader.required_size()?;
                Ok(TypeDescriptor::BoundedString(bound as u32))
            }
            STRUCTURE_ARRAY_CODE => {
                let element = self.decode_field_type(reader, None, depth + 1)?;
                if element.as_structure().is_none() {
                    return Err(at_start(DecodeErrorKind::InvalidTypeCode(code)));
                }
                Ok(TypeDescriptor::StructureArray(Box::new(element)))
            }
            c if c & ARRAY_KIND_MASK == VARIABLE_ARRAY_FLAG => {
                ScalarType::from_type_code(c & !ARRAY_KIND_MASK)
                    .map(TypeDescriptor::ScalarArray)
                    .ok_or(at_start(DecodeErrorKind::InvalidTypeCode(c)))
            }
            c => ScalarType::from_type_code(c)
                .map(TypeDescriptor::Scalar)
                .ok_or(at_start(DecodeErrorKind::InvalidTypeCode(c))),
        }
    }

    fn decode_members(
        &mut self,
        reader: &mut WireReader,
        depth: usize,
    ) -> Result<StructureDesc, DecodeError> {
        let name = reader.string()?;
        // Each member needs at least a name size and a type code
        let count = reader.count(2)?;
        let mut fields: Vec<(String, TypeDescriptor)> = Vec::with_capacity(count);
        for _ in 0..count {
            let field_name = reader.string()?;
            let previous = fields.last().map(|(_, d)| d);
            let desc = self.decode_field_type(reader, previous, depth + 1)?;
            fields.push((field_name, desc));
        }
        Ok(StructureDesc { name, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm() -> TypeDescriptor {
        TypeDescriptor::Structure(
            StructureDesc::new("alarm_t")
                .field("severity", TypeDescriptor::Scalar(ScalarType::Int))
                .field("status", TypeDescriptor::Scalar(ScalarType::Int))
                .field("message", TypeDescriptor::Scalar(ScalarType::String)),
        )
    }

    fn nt_scalar() -> TypeDescriptor {
        TypeDescriptor::Structure(
            StructureDesc::new("epics:nt/NTScalar:1.0")
                .field("value", TypeDescriptor::ScalarArray(ScalarType::Double))
                .field("alarm", alarm())
                .field("lowAlarm", alarm())
                .field("label", TypeDescriptor::BoundedString(40)),
        )
    }

    #[test]
    fn test_scalar_codes() {
        let mut registry = TypeRegistry::new();
        let mut buf = Vec::new();
        registry.encode_type(&TypeDescriptor::ScalarArray(ScalarType::Double), &mut buf);
        registry.encode_type(&TypeDescriptor::Scalar(ScalarType::String), &mut buf);
        assert_eq!(buf, vec![0x4B, 0x60]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_send_is_only_id() {
        let mut sender = TypeRegistry::new();
        let mut receiver = TypeRegistry::new();
        let desc = nt_scalar();

        let mut first = Vec::new();
        sender.encode_type(&desc, &mut first);
        assert_eq!(first[0], FULL_WITH_ID_TYPE_CODE);
        let mut second = Vec::new();
        sender.encode_type(&desc, &mut second);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0], ONLY_ID_TYPE_CODE);
        assert!(second.len() < first.len());

        let mut reader = WireReader::new(&first);
        assert_eq!(receiver.decode_type(&mut reader).unwrap(), desc);
        assert!(reader.is_empty());
        let mut reader = WireReader::new(&second);
        assert_eq!(receiver.decode_type(&mut reader).unwrap(), desc);
    }

    #[test]
    fn test_same_as_previous_marker() {
        let mut sender = TypeRegistry::new();
        let mut buf = Vec::new();
        sender.encode_type(&nt_scalar(), &mut buf);
        // lowAlarm repeats alarm's layout
        let marker = buf
            .windows(9)
            .position(|w| w == b"\x08lowAlarm")
            .map(|p| buf[p + 9]);
        assert_eq!(marker, Some(SAME_AS_PREVIOUS_TYPE_CODE));
    }

    #[test]
    fn test_full_registry_sends_bare_descriptions() {
        let mut sender = TypeRegistry::with_capacity(0);
        let mut receiver = TypeRegistry::new();
        let mut buf = Vec::new();
        sender.encode_type(&alarm(), &mut buf);
        assert_eq!(buf[0], STRUCTURE_CODE);
        assert_eq!(
            receiver.decode_type(&mut WireReader::new(&buf)).unwrap(),
            alarm()
        );
    }

    #[test]
    fn test_unknown_id() {
        let mut receiver = TypeRegistry::new();
        let err = receiver
            .decode_type(&mut WireReader::new(&[0xFE, 7, 0]))
            .unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnknownTypeId(7));
        assert_eq!(err.offset, 0);
    }

    /// Structures each holding one unnamed structure, `levels` deep
    fn nested(levels: usize) -> Vec<u8> {
        let mut buf = [STRUCTURE_CODE, 0, 1, 0].repeat(levels);
        buf.push(0x22);
        buf
    }

    #[test]
    fn test_nesting_is_bounded() {
        let mut receiver = TypeRegistry::new();
        let desc = receiver.decode_type(&mut WireReader::new(&nested(10))).unwrap();
        assert_eq!(desc.short_name(), "structure");

        let err = receiver
            .decode_type(&mut WireReader::new(&nested(200_000)))
            .unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::TooDeep(MAX_TYPE_DEPTH));
        assert_eq!(err.offset, (MAX_TYPE_DEPTH + 1) * 4);
    }

    #[test]
    fn test_redefinition_conflict() {
        let mut receiver = TypeRegistry::new();
        receiver.bind(1, alarm()).unwrap();
        receiver.bind(1, alarm()).unwrap();
        assert_eq!(
            receiver.bind(1, nt_scalar()),
            Err(DecodeErrorKind::RegistryConflict(1))
        );
        // The original binding survives
        assert_eq!(receiver.get(1), Some(&alarm()));
    }

    #[test]
    fn test_optional_type() {
        let mut registry = TypeRegistry::new();
        let mut buf = Vec::new();
        registry.encode_optional_type(None, &mut buf);
        registry.encode_optional_type(Some(&alarm()), &mut buf);
        let mut reader = WireReader::new(&buf);
        let mut receiver = TypeRegistry::new();
        assert_eq!(receiver.decode_optional_type(&mut reader).unwrap(), None);
        assert_eq!(
            receiver.decode_optional_type(&mut reader).unwrap(),
            Some(alarm())
        );
    }
}
