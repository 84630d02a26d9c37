//! Change tracking for structures.
//!
//! Fields of a structure are numbered in pre-order: 0 is the structure
//! itself, then each field in order, descending into sub-structures before
//! moving on. So for
//!
//! ```text
//! structure
//!     double value            1
//!     structure alarm         2
//!         int severity        3
//!         string message      4
//!     string tag              5
//! ```
//!
//! a [`ChangeBitSet`] of `{3, 5}` says `alarm.severity` and `tag` changed.
//! On the wire it is a size-prefixed little-endian byte array.

use std::fmt::{self, Display};

use bytes::BufMut;

use super::{
    DecodeError, Structure, StructureDesc, TypeDescriptor, Value, WireReader,
    codec::put_size, join_path,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChangeBitSet {
    words: Vec<u64>,
}

impl ChangeBitSet {
    pub fn new() -> Self {
        ChangeBitSet::default()
    }

    /// A set containing only bit 0, the whole structure
    pub fn whole() -> Self {
        [0].into_iter().collect()
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1u64 << (index % 64));
        }
        self.trim();
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    /// Is any bit in `start..end` set
    pub fn any_in(&self, start: usize, end: usize) -> bool {
        (start..end).any(|i| self.get(i))
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(n, word)| {
            (0..64)
                .filter(move |&bit| word & (1u64 << bit) != 0)
                .map(move |bit| n * 64 + bit)
        })
    }

    pub fn union_with(&mut self, other: &ChangeBitSet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            *mine |= theirs;
        }
    }

    pub fn intersection(&self, other: &ChangeBitSet) -> ChangeBitSet {
        let mut result = ChangeBitSet {
            words: self
                .words
                .iter()
                .zip(other.words.iter())
                .map(|(a, b)| a & b)
                .collect(),
        };
        result.trim();
        result
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let bytes = self.to_bytes();
        put_size(buf, Some(bytes.len()));
        buf.put_slice(&bytes);
    }

    pub fn decode(reader: &mut WireReader) -> Result<ChangeBitSet, DecodeError> {
        let len = reader.count(1)?;
        let bytes = reader.take(len)?;
        let mut set = ChangeBitSet {
            words: bytes
                .chunks(8)
                .map(|chunk| {
                    let mut word = [0u8; 8];
                    word[..chunk.len()].copy_from_slice(chunk);
                    u64::from_le_bytes(word)
                })
                .collect(),
        };
        set.trim();
        Ok(set)
    }
}

impl FromIterator<usize> for ChangeBitSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = ChangeBitSet::new();
        for index in iter {
            set.set(index);
        }
        set
    }
}

impl Display for ChangeBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.iter().map(|i| i.to_string()).collect();
        write!(f, "{{{}}}", items.join(", "))
    }
}

#[derive(Debug, Clone)]
struct LayoutEntry {
    path: String,
    /// One past the last index of this entry's subtree
    end: usize,
    is_structure: bool,
}

/// Pre-order index table for one structure layout
#[derive(Debug, Clone)]
pub struct FieldLayout {
    entries: Vec<LayoutEntry>,
}

impl FieldLayout {
    pub fn of(desc: &StructureDesc) -> Self {
        let mut entries = vec![LayoutEntry {
            path: String::new(),
            end: 0,
            is_structure: true,
        }];
        Self::walk(desc, "", &mut entries);
        entries[0].end = entries.len();
        FieldLayout { entries }
    }

    fn walk(desc: &StructureDesc, parent: &str, entries: &mut Vec<LayoutEntry>) {
        for (name, field) in &desc.fields {
            let path = join_path(parent, name);
            let index = entries.len();
            entries.push(LayoutEntry {
                path: path.clone(),
                end: index + 1,
                is_structure: matches!(field, TypeDescriptor::Structure(_)),
            });
            if let TypeDescriptor::Structure(sd) = field {
                Self::walk(sd, &path, entries);
                entries[index].end = entries.len();
            }
        }
    }

    /// Number of indices, including 0 for the whole structure
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn path(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.path.as_str())
    }

    pub fn index_of(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        self.entries.iter().position(|e| e.path == path)
    }

    pub fn is_structure(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.is_structure)
    }

    /// One past the last index inside the subtree rooted at `index`
    pub fn subtree_end(&self, index: usize) -> usize {
        self.entries.get(index).map_or(index, |e| e.end)
    }

    /// Every leaf index
    pub fn leaves(&self) -> ChangeBitSet {
        (0..self.len()).filter(|i| !self.is_structure(*i)).collect()
    }

    /// Replace structure bits with the leaves underneath them
    pub fn expand(&self, changes: &ChangeBitSet) -> ChangeBitSet {
        let mut result = ChangeBitSet::new();
        for index in changes.iter() {
            if index >= self.len() {
                continue;
            }
            if self.is_structure(index) {
                for inner in index..self.subtree_end(index) {
                    if !self.is_structure(inner) {
                        result.set(inner);
                    }
                }
            } else {
                result.set(index);
            }
        }
        result
    }

    /// Paths of the leaves a change set covers, in index order
    pub fn changed_paths(&self, changes: &ChangeBitSet) -> Vec<&str> {
        self.expand(changes)
            .iter()
            .filter_map(|i| self.path(i))
            .collect()
    }

    /// True if every index in `changes` exists in this layout
    pub fn contains_all(&self, changes: &ChangeBitSet) -> bool {
        changes.iter().all(|i| i < self.len())
    }
}

/// Leaf-level differences between two values of the same layout.
///
/// Sub-structures are compared field by field; everything else (including
/// arrays, unions and structure arrays) is compared as a whole.
pub fn diff(old: &Structure, new: &Structure) -> ChangeBitSet {
    let mut changes = ChangeBitSet::new();
    let mut index = 1;
    diff_fields(old, new, &mut index, &mut changes);
    changes
}

fn diff_fields(old: &Structure, new: &Structure, index: &mut usize, changes: &mut ChangeBitSet) {
    for ((_, a), (_, b)) in old.fields().iter().zip(new.fields()) {
        match (a, b) {
            (Value::Structure(sa), Value::Structure(sb)) => {
                *index += 1;
                diff_fields(sa, sb, index, changes);
            }
            _ => {
                if a != b {
                    changes.set(*index);
                }
                *index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::ScalarType;

    fn layout_desc() -> StructureDesc {
        StructureDesc::new("")
            .field("value", TypeDescriptor::Scalar(ScalarType::Double))
            .field(
                "alarm",
                TypeDescriptor::Structure(
                    StructureDesc::new("alarm_t")
                        .field("severity", TypeDescriptor::Scalar(ScalarType::Int))
                        .field("message", TypeDescriptor::Scalar(ScalarType::String)),
                ),
            )
            .field("tag", TypeDescriptor::Scalar(ScalarType::String))
    }

    #[test]
    fn test_wire_format_matches_java_bitset() {
        let set: ChangeBitSet = [1, 9].into_iter().collect();
        let mut buf = Vec::new();
        set.encode(&mut buf);
        assert_eq!(buf, vec![2, 0b0000_0010, 0b0000_0010]);
        assert_eq!(ChangeBitSet::decode(&mut WireReader::new(&buf)).unwrap(), set);

        let mut buf = Vec::new();
        ChangeBitSet::new().encode(&mut buf);
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn test_high_bits() {
        let set: ChangeBitSet = [0, 64, 200].into_iter().collect();
        let mut buf = Vec::new();
        set.encode(&mut buf);
        let decoded = ChangeBitSet::decode(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(decoded.iter().collect::<Vec<_>>(), vec![0, 64, 200]);
        assert_eq!(decoded.to_string(), "{0, 64, 200}");
    }

    #[test]
    fn test_layout() {
        let layout = FieldLayout::of(&layout_desc());
        assert_eq!(layout.len(), 6);
        assert_eq!(layout.index_of("alarm.message"), Some(4));
        assert_eq!(layout.path(5), Some("tag"));
        assert_eq!(layout.subtree_end(2), 5);
        assert_eq!(layout.subtree_end(0), 6);
        assert_eq!(
            layout.changed_paths(&[2].into_iter().collect()),
            vec!["alarm.severity", "alarm.message"]
        );
        assert_eq!(layout.leaves().iter().collect::<Vec<_>>(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_diff_is_leaf_level() {
        let old = Structure::default_for(&layout_desc());
        let mut new = old.clone();
        *new.get_mut("value").unwrap() = Value::Double(1.0);
        assert_eq!(diff(&old, &new).iter().collect::<Vec<_>>(), vec![1]);

        *new.locate_mut("alarm.message").unwrap() = Value::from("bad");
        assert_eq!(diff(&old, &new).iter().collect::<Vec<_>>(), vec![1, 4]);
        assert!(diff(&new, &new).is_empty());
    }

    #[test]
    fn test_union_and_clear() {
        let mut a: ChangeBitSet = [1, 3].into_iter().collect();
        a.union_with(&[3, 70].into_iter().collect());
        assert_eq!(a.count(), 3);
        a.clear(70);
        assert_eq!(a, [1, 3].into_iter().collect());
        assert_eq!(
            a.intersection(&[3, 4].into_iter().collect()),
            [3].into_iter().collect()
        );
    }
}
