//! Field requests: selecting the parts of a structure a client is interested in.
//!
//! A request string such as `field(value, timeStamp.userTag)` names the fields
//! to transfer; dotted paths reach into sub-structures. An empty string, or
//! `field()`, means everything. Options can be prefixed in a `record[...]`
//! clause, e.g. `record[pipeline=true,queueSize=4]field(value)`.
//!
//! On the wire a request travels as a "pvRequest" structure; see
//! [`FieldRequest::to_pv_request`]. A server resolves a request against a PV's
//! type into a [`Projection`], which maps between the full and the projected
//! layouts.

use std::{fmt::Display, str::FromStr};

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
};
use thiserror::Error;

use crate::pvdata::{
    ChangeBitSet, FieldLayout, PvStructure, Structure, StructureDesc, TypeDescriptor, Value,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Unterminated 'field(' at position {0}")]
    Unterminated(usize),
    #[error("Empty field name at position {0}")]
    EmptySegment(usize),
    #[error("Unexpected character '{1}' at position {0}")]
    UnexpectedCharacter(usize, char),
    #[error("Invalid request option at position {0}")]
    InvalidOption(usize),
    #[error("No field '{0}' in structure")]
    UnknownField(String),
}

impl RequestError {
    /// Where in the request text the problem was found
    pub fn position(&self) -> Option<usize> {
        match self {
            RequestError::Unterminated(p)
            | RequestError::EmptySegment(p)
            | RequestError::UnexpectedCharacter(p, _)
            | RequestError::InvalidOption(p) => Some(*p),
            RequestError::UnknownField(_) => None,
        }
    }
}

type ParseResult<'a, O> = IResult<&'a str, O, nom::error::Error<&'a str>>;

fn whitespace(input: &str) -> &str {
    let result: ParseResult<&str> = multispace0(input);
    result.map(|(rest, _)| rest).unwrap_or(input)
}

fn identifier(input: &str) -> ParseResult<'_, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_').parse(input)
}

fn option_value(input: &str) -> ParseResult<'_, &str> {
    take_while1(|c: char| c != ',' && c != ']' && !c.is_whitespace()).parse(input)
}

/// Tracks the full text so errors can report positions
struct RequestParser<'a> {
    text: &'a str,
}

impl<'a> RequestParser<'a> {
    fn position(&self, rest: &str) -> usize {
        self.text.len() - rest.len()
    }

    fn unexpected(&self, rest: &str) -> RequestError {
        match rest.chars().next() {
            Some(c) => RequestError::UnexpectedCharacter(self.position(rest), c),
            None => RequestError::Unterminated(self.text.len()),
        }
    }

    fn parse(&self) -> Result<FieldRequest, RequestError> {
        let mut request = FieldRequest::all();
        let mut rest = whitespace(self.text);

        let record: ParseResult<_> = (tag("record"), multispace0, char('[')).parse(rest);
        if let Ok((after, _)) = record {
            rest = whitespace(self.options(after, &mut request)?);
        }
        if rest.is_empty() {
            return Ok(request);
        }

        let field: ParseResult<_> = (tag("field"), multispace0, char('(')).parse(rest);
        if let Ok((after, _)) = field {
            rest = whitespace(after);
            if rest.is_empty() {
                return Err(RequestError::Unterminated(self.text.len()));
            }
            let close: ParseResult<_> = char(')').parse(rest);
            rest = match close {
                Ok((after, _)) => after,
                Err(_) => {
                    let after = whitespace(self.path_list(rest, &mut request)?);
                    let close: ParseResult<_> = char(')').parse(after);
                    match close {
                        Ok((after, _)) => after,
                        Err(_) if after.is_empty() => {
                            return Err(RequestError::Unterminated(self.text.len()));
                        }
                        Err(_) => return Err(self.unexpected(after)),
                    }
                }
            };
        } else {
            rest = self.path_list(rest, &mut request)?;
        }

        let rest = whitespace(rest);
        if !rest.is_empty() {
            return Err(self.unexpected(rest));
        }
        Ok(request)
    }

    fn path_list(&self, input: &'a str, request: &mut FieldRequest) -> Result<&'a str, RequestError> {
        let mut rest = self.path(input, request)?;
        loop {
            let after = whitespace(rest);
            let comma: ParseResult<_> = char(',').parse(after);
            match comma {
                Ok((after, _)) => rest = self.path(whitespace(after), request)?,
                Err(_) => return Ok(rest),
            }
        }
    }

    fn path(&self, input: &'a str, request: &mut FieldRequest) -> Result<&'a str, RequestError> {
        let mut rest = input;
        let mut segments = Vec::new();
        loop {
            let Ok((after, segment)) = identifier(rest) else {
                return Err(RequestError::EmptySegment(self.position(rest)));
            };
            segments.push(segment);
            rest = after;
            let dot: ParseResult<_> = char('.').parse(rest);
            match dot {
                Ok((after, _)) => rest = after,
                Err(_) => break,
            }
        }
        request.insert(segments.join("."));
        Ok(rest)
    }

    fn options(&self, input: &'a str, request: &mut FieldRequest) -> Result<&'a str, RequestError> {
        let mut rest = whitespace(input);
        loop {
            let close: ParseResult<_> = char(']').parse(rest);
            if let Ok((after, _)) = close {
                return Ok(after);
            }
            let entry: ParseResult<_> = (
                identifier,
                multispace0,
                char('='),
                multispace0,
                option_value,
            )
                .parse(rest);
            let Ok((after, (key, _, _, _, value))) = entry else {
                return Err(if rest.is_empty() {
                    RequestError::Unterminated(self.text.len())
                } else {
                    RequestError::InvalidOption(self.position(rest))
                });
            };
            request.set_option(key, value);
            rest = whitespace(after);
            let comma: ParseResult<_> = char(',').parse(rest);
            if let Ok((after, _)) = comma {
                rest = whitespace(after);
            }
        }
    }
}

/// A parsed field request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRequest {
    paths: Vec<String>,
    options: Vec<(String, String)>,
}

impl FieldRequest {
    /// Request every field
    pub fn all() -> Self {
        FieldRequest::default()
    }

    pub fn parse(text: &str) -> Result<Self, RequestError> {
        RequestParser { text }.parse()
    }

    /// Builder-style addition of a field path
    pub fn with_field(mut self, path: &str) -> Self {
        self.insert(path.to_owned());
        self
    }

    /// The requested paths, in first-seen order. Empty means everything.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_all(&self) -> bool {
        self.paths.is_empty()
    }

    /// Add a path, keeping the list free of duplicates and of paths that a
    /// requested parent already covers
    fn insert(&mut self, path: String) {
        let covers = |parent: &str, child: &str| {
            child == parent
                || (child.starts_with(parent) && child.as_bytes().get(parent.len()) == Some(&b'.'))
        };
        if self.paths.iter().any(|p| covers(p, &path)) {
            return;
        }
        match self.paths.iter().position(|p| covers(&path, p)) {
            Some(first) => {
                self.paths[first] = path.clone();
                let mut index = 0;
                self.paths.retain(|p| {
                    index += 1;
                    index - 1 == first || !covers(&path, p)
                });
            }
            None => self.paths.push(path),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_option(&mut self, key: &str, value: &str) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_owned(),
            None => self.options.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Whether the client asked for flow-controlled monitor updates
    pub fn pipeline(&self) -> bool {
        self.option("pipeline")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn queue_size(&self) -> Option<u32> {
        self.option("queueSize").and_then(|v| v.parse().ok())
    }

    /// Build the structure that carries this request on the wire
    pub fn to_pv_request(&self) -> PvStructure {
        let mut field_desc = StructureDesc::default();
        let mut field_value = Structure::new();
        for path in &self.paths {
            let segments: Vec<&str> = path.split('.').collect();
            add_request_path(&mut field_desc, &mut field_value, &segments);
        }
        let mut desc = StructureDesc::default().field("field", TypeDescriptor::Structure(field_desc));
        let mut value = Structure::new().with("field", field_value);

        if !self.options.is_empty() {
            let mut options_desc = StructureDesc::default();
            let mut options = Structure::new();
            for (key, option) in &self.options {
                options_desc = options_desc.field(key, TypeDescriptor::Scalar(crate::pvdata::ScalarType::String));
                options = options.with(key, option.as_str());
            }
            desc = desc.field(
                "record",
                TypeDescriptor::Structure(
                    StructureDesc::default().field("_options", TypeDescriptor::Structure(options_desc)),
                ),
            );
            value = value.with("record", Structure::new().with("_options", options));
        }
        PvStructure::new_unchecked(TypeDescriptor::Structure(desc), value)
    }

    /// Recover a request from a received pvRequest structure
    pub fn from_pv_request(value: &Structure) -> FieldRequest {
        let mut request = FieldRequest::all();
        if let Some(Value::Structure(field)) = value.get("field") {
            collect_request_paths(field, "", &mut request);
        }
        if let Some(Value::Structure(options)) = value.locate("record._options") {
            for (key, option) in options.fields() {
                request.set_option(key, &option.to_string());
            }
        }
        request
    }
}

fn add_request_path(desc: &mut StructureDesc, value: &mut Structure, segments: &[&str]) {
    let Some((head, tail)) = segments.split_first() else {
        return;
    };
    if desc.get(head).is_none() {
        desc.fields.push((
            head.to_string(),
            TypeDescriptor::Structure(StructureDesc::default()),
        ));
        value.push(head.to_string(), Value::Structure(Structure::new()));
    }
    let Some(index) = desc.index_of(head) else {
        return;
    };
    if let (TypeDescriptor::Structure(inner_desc), Some(Value::Structure(inner))) =
        (&mut desc.fields[index].1, value.get_mut(head))
    {
        add_request_path(inner_desc, inner, tail);
    }
}

fn collect_request_paths(field: &Structure, parent: &str, request: &mut FieldRequest) {
    for (name, value) in field.fields() {
        let path = crate::pvdata::join_path(parent, name);
        match value {
            Value::Structure(inner) if !inner.is_empty() => {
                collect_request_paths(inner, &path, request)
            }
            _ => request.insert(path),
        }
    }
}

impl FromStr for FieldRequest {
    type Err = RequestError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldRequest::parse(s)
    }
}

impl Display for FieldRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.options.is_empty() {
            let options: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "record[{}]", options.join(","))?;
        }
        if !self.paths.is_empty() {
            write!(f, "field({})", self.paths.join(","))?;
        }
        Ok(())
    }
}

/// A field request resolved against a concrete structure layout
#[derive(Debug, Clone)]
pub struct Projection {
    desc: StructureDesc,
    full_layout: FieldLayout,
    projected_layout: FieldLayout,
    /// Full index of each projected index
    to_full: Vec<usize>,
    /// Projected index of each full index, if selected
    to_projected: Vec<Option<usize>>,
    /// Selected leaves, in full numbering
    mask: ChangeBitSet,
}

impl Projection {
    pub fn new(full: &StructureDesc, request: &FieldRequest) -> Result<Projection, RequestError> {
        let full_layout = FieldLayout::of(full);
        let mut selected = ChangeBitSet::new();
        selected.set(0);
        if request.is_all() {
            for index in 0..full_layout.len() {
                selected.set(index);
            }
        }
        for path in request.paths() {
            let index = full_layout
                .index_of(path)
                .ok_or_else(|| RequestError::UnknownField(path.clone()))?;
            for inner in index..full_layout.subtree_end(index) {
                selected.set(inner);
            }
            // Parents of a selected field are kept as (partial) structures
            let mut prefix = path.as_str();
            while let Some((parent, _)) = prefix.rsplit_once('.') {
                if let Some(parent_index) = full_layout.index_of(parent) {
                    selected.set(parent_index);
                }
                prefix = parent;
            }
        }

        let mut to_full = vec![0];
        let mut index = 1;
        let desc = project_desc(full, &selected, &mut index, &mut to_full);
        let mut to_projected = vec![None; full_layout.len()];
        for (projected, full_index) in to_full.iter().enumerate() {
            to_projected[*full_index] = Some(projected);
        }
        let mask = selected.intersection(&full_layout.leaves());
        Ok(Projection {
            projected_layout: FieldLayout::of(&desc),
            desc,
            full_layout,
            to_full,
            to_projected,
            mask,
        })
    }

    /// The type a client using this projection sees
    pub fn desc(&self) -> &StructureDesc {
        &self.desc
    }

    pub fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::Structure(self.desc.clone())
    }

    /// Selected leaves, in full numbering
    pub fn mask(&self) -> &ChangeBitSet {
        &self.mask
    }

    /// Extract the selected fields from a full value
    pub fn project(&self, value: &Structure) -> Structure {
        project_value(&self.desc, value)
    }

    /// Translate full-layout changes into projected numbering. Changes
    /// outside the projection are dropped; bit 0 stays bit 0.
    pub fn map_changes(&self, changes: &ChangeBitSet) -> ChangeBitSet {
        if changes.get(0) {
            return ChangeBitSet::whole();
        }
        self.full_layout
            .expand(changes)
            .intersection(&self.mask)
            .iter()
            .filter_map(|i| self.to_projected.get(i).copied().flatten())
            .collect()
    }

    /// Translate projected changes back into full numbering, as leaves
    pub fn unmap_changes(&self, changes: &ChangeBitSet) -> ChangeBitSet {
        self.projected_layout
            .expand(changes)
            .iter()
            .filter_map(|i| self.to_full.get(i).copied())
            .collect()
    }

    /// Copy the changed fields of a projected value into a full value
    pub fn apply(&self, full: &mut Structure, projected: &Structure, changes: &ChangeBitSet) {
        for index in self.projected_layout.expand(changes).iter() {
            let Some(path) = self.projected_layout.path(index) else {
                continue;
            };
            if let (Some(target), Some(source)) = (full.locate_mut(path), projected.locate(path)) {
                *target = source.clone();
            }
        }
    }
}

fn project_desc(
    desc: &StructureDesc,
    selected: &ChangeBitSet,
    index: &mut usize,
    to_full: &mut Vec<usize>,
) -> StructureDesc {
    let mut projected = StructureDesc::new(&desc.name);
    for (name, field) in &desc.fields {
        let here = *index;
        let span = field.index_count();
        if selected.get(here) {
            to_full.push(here);
            match field {
                TypeDescriptor::Structure(inner) => {
                    *index += 1;
                    let inner = project_desc(inner, selected, index, to_full);
                    projected
                        .fields
                        .push((name.clone(), TypeDescriptor::Structure(inner)));
                }
                other => projected.fields.push((name.clone(), other.clone())),
            }
        }
        *index = here + span;
    }
    projected
}

fn project_value(desc: &StructureDesc, value: &Structure) -> Structure {
    let mut projected = Structure::named(&value.type_name);
    for (name, field_desc) in &desc.fields {
        let Some(field) = value.get(name) else {
            continue;
        };
        let field = match (field_desc, field) {
            (TypeDescriptor::Structure(inner_desc), Value::Structure(inner)) => {
                Value::Structure(project_value(inner_desc, inner))
            }
            (_, other) => other.clone(),
        };
        projected.push(name.clone(), field);
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::ScalarType;

    fn abcd() -> StructureDesc {
        StructureDesc::new("")
            .field("a", TypeDescriptor::Scalar(ScalarType::Int))
            .field(
                "b",
                TypeDescriptor::Structure(
                    StructureDesc::new("b_t")
                        .field("c", TypeDescriptor::Scalar(ScalarType::Double))
                        .field("d", TypeDescriptor::Scalar(ScalarType::String)),
                ),
            )
            .field("e", TypeDescriptor::Scalar(ScalarType::Int))
    }

    #[test]
    fn test_parse_forms() {
        assert!(FieldRequest::parse("").unwrap().is_all());
        assert!(FieldRequest::parse("  field()  ").unwrap().is_all());
        assert!(FieldRequest::parse("field( )").unwrap().is_all());
        assert_eq!(
            FieldRequest::parse("field(a, b.c)").unwrap().paths(),
            &["a", "b.c"]
        );
        assert_eq!(FieldRequest::parse("a,b.c").unwrap().paths(), &["a", "b.c"]);
        assert_eq!(
            FieldRequest::parse("fieldname").unwrap().paths(),
            &["fieldname"]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            FieldRequest::parse("field(a"),
            Err(RequestError::Unterminated(7))
        );
        assert_eq!(
            FieldRequest::parse("field("),
            Err(RequestError::Unterminated(6))
        );
        assert_eq!(
            FieldRequest::parse("field(a..b)"),
            Err(RequestError::EmptySegment(8))
        );
        assert_eq!(
            FieldRequest::parse("field(a,)"),
            Err(RequestError::EmptySegment(8))
        );
        assert_eq!(
            FieldRequest::parse("field(a) x"),
            Err(RequestError::UnexpectedCharacter(9, 'x'))
        );
        assert_eq!(
            FieldRequest::parse("field(a;b)"),
            Err(RequestError::UnexpectedCharacter(7, ';'))
        );
    }

    #[test]
    fn test_deduplication_is_stable() {
        let request = FieldRequest::parse("field(b.c, a, b.c, a)").unwrap();
        assert_eq!(request.paths(), &["b.c", "a"]);
        // A parent absorbs its children, taking the first child's place
        let request = FieldRequest::parse("field(b.c, a, b, b.d)").unwrap();
        assert_eq!(request.paths(), &["b", "a"]);
        // But a sibling with a shared prefix is not a child
        let request = FieldRequest::parse("field(b, bc)").unwrap();
        assert_eq!(request.paths(), &["b", "bc"]);
    }

    #[test]
    fn test_options() {
        let request = FieldRequest::parse("record[pipeline=true, queueSize=4]field(value)").unwrap();
        assert!(request.pipeline());
        assert_eq!(request.queue_size(), Some(4));
        assert_eq!(request.paths(), &["value"]);
        assert_eq!(
            request.to_string(),
            "record[pipeline=true,queueSize=4]field(value)"
        );
        assert!(matches!(
            FieldRequest::parse("record[pipeline]"),
            Err(RequestError::InvalidOption(7))
        ));
    }

    #[test]
    fn test_pv_request_round_trip() {
        let mut request = FieldRequest::parse("field(value, timeStamp.userTag, b.c)").unwrap();
        request.set_option("queueSize", "8");
        let pv = request.to_pv_request();
        assert!(pv.locate("field.timeStamp.userTag").is_some());
        assert_eq!(
            pv.locate("record._options.queueSize"),
            Some(&Value::from("8"))
        );
        assert_eq!(FieldRequest::from_pv_request(pv.value()), request);
        // The pvRequest of "everything" has an empty field structure
        let all = FieldRequest::all().to_pv_request();
        assert!(FieldRequest::from_pv_request(all.value()).is_all());
    }

    #[test]
    fn test_projection_selects_exact_fields() {
        let request = FieldRequest::parse("field(a,b.c)").unwrap();
        let projection = Projection::new(&abcd(), &request).unwrap();
        let expected = StructureDesc::new("")
            .field("a", TypeDescriptor::Scalar(ScalarType::Int))
            .field(
                "b",
                TypeDescriptor::Structure(
                    StructureDesc::new("b_t").field("c", TypeDescriptor::Scalar(ScalarType::Double)),
                ),
            );
        assert_eq!(projection.desc(), &expected);

        let value = Structure::default_for(&abcd());
        let projected = projection.project(&value);
        assert_eq!(projected.len(), 2);
        assert!(projected.locate("b.c").is_some());
        assert!(projected.locate("b.d").is_none());
        assert!(projected.get("e").is_none());

        // Full: a=1 b=2 b.c=3 b.d=4 e=5; projected: a=1 b=2 b.c=3
        assert_eq!(projection.mask(), &[1, 3].into_iter().collect());
        assert_eq!(
            projection.map_changes(&[3, 4, 5].into_iter().collect()),
            [3].into_iter().collect()
        );
        assert_eq!(
            projection.map_changes(&[2].into_iter().collect()),
            [3].into_iter().collect()
        );
        assert!(projection.map_changes(&[5].into_iter().collect()).is_empty());
        assert_eq!(
            projection.unmap_changes(&[2].into_iter().collect()),
            [3].into_iter().collect()
        );
    }

    #[test]
    fn test_unknown_field() {
        let request = FieldRequest::parse("field(b.x)").unwrap();
        assert_eq!(
            Projection::new(&abcd(), &request).unwrap_err(),
            RequestError::UnknownField("b.x".to_owned())
        );
    }

    #[test]
    fn test_apply_projected_write() {
        let projection = Projection::new(&abcd(), &FieldRequest::parse("b.c").unwrap()).unwrap();
        let mut full = Structure::default_for(&abcd());
        let mut projected = projection.project(&full);
        *projected.locate_mut("b.c").unwrap() = Value::Double(2.5);
        projection.apply(&mut full, &projected, &[2].into_iter().collect());
        assert_eq!(full.locate("b.c"), Some(&Value::Double(2.5)));
    }
}
