//! Fully qualified names: immutable hierarchical paths addressing cache nodes.
//!
//! A path is an ordered list of segments. The empty list is the root. Paths
//! can be built from one opaque name (no separator parsing) or parsed from a
//! `/`-delimited string; the two are deliberately not equivalent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, CacheResult};

/// Separator used by [`Fqn::parse`] and the `Display` form.
pub const SEPARATOR: char = '/';

/// One element of a path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Segment {
    /// Integer name.
    Int(i64),
    /// String name. May contain the separator when built with [`Fqn::from_name`].
    Str(String),
}

impl Segment {
    /// Returns the string form if this is a string segment.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Segment::Str(s) => Some(s),
            Segment::Int(_) => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Int(i) => write!(f, "{}", i),
            Segment::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Str(s.to_string())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment::Str(s)
    }
}

impl From<i64> for Segment {
    fn from(i: i64) -> Self {
        Segment::Int(i)
    }
}

/// Wire layout used by [`Fqn::encode`] and [`Fqn::decode`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathWireFormat {
    /// Whole segment list serialized as one opaque blob.
    Legacy,
    /// Segment count followed by each segment with its own length prefix.
    #[default]
    LengthPrefixed,
}

/// Immutable hierarchical name of a cache node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fqn {
    elements: Vec<Segment>,
}

impl Fqn {
    /// The root path (no segments).
    pub fn root() -> Self {
        Fqn {
            elements: Vec::new(),
        }
    }

    /// Builds a one-segment path from a single name. No separator parsing.
    pub fn from_name(name: impl Into<Segment>) -> Self {
        Fqn {
            elements: vec![name.into()],
        }
    }

    /// Builds a path from a list of segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        Fqn {
            elements: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds `base` followed by every segment of `relative`.
    pub fn from_relative(base: &Fqn, relative: &Fqn) -> Self {
        let mut elements = Vec::with_capacity(base.len() + relative.len());
        elements.extend(base.elements.iter().cloned());
        elements.extend(relative.elements.iter().cloned());
        Fqn { elements }
    }

    /// Builds `base` followed by each of `names`, treated as opaque segments.
    pub fn from_relative_names<I, S>(base: &Fqn, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        let mut elements = base.elements.clone();
        elements.extend(names.into_iter().map(Into::into));
        Fqn { elements }
    }

    /// Parses a `/`-delimited string. Empty tokens are dropped, so `""`,
    /// `"/"` and `"//"` all yield the root.
    pub fn parse(s: &str) -> Self {
        Fqn {
            elements: s
                .split(SEPARATOR)
                .filter(|t| !t.is_empty())
                .map(Segment::from)
                .collect(),
        }
    }

    /// Returns this path extended by one child name.
    pub fn child(&self, name: impl Into<Segment>) -> Self {
        let mut elements = self.elements.clone();
        elements.push(name.into());
        Fqn { elements }
    }

    /// Parent path. The root's parent is the root.
    pub fn parent(&self) -> Fqn {
        match self.elements.split_last() {
            Some((_, rest)) => Fqn {
                elements: rest.to_vec(),
            },
            None => Fqn::root(),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Segment at `index`.
    pub fn get(&self, index: usize) -> CacheResult<&Segment> {
        self.elements.get(index).ok_or(CacheError::IndexOutOfRange {
            index,
            len: self.elements.len(),
        })
    }

    /// Last segment, i.e. the node's name. `None` for the root.
    pub fn last_segment(&self) -> Option<&Segment> {
        self.elements.last()
    }

    /// All segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.elements
    }

    /// Prefix of the first `len` segments.
    pub fn prefix(&self, len: usize) -> Fqn {
        Fqn {
            elements: self.elements[..len.min(self.elements.len())].to_vec(),
        }
    }

    /// True if this path is a strict descendant of `parent`.
    pub fn is_child_of(&self, parent: &Fqn) -> bool {
        self.len() > parent.len() && self.elements.starts_with(&parent.elements)
    }

    /// True if this path equals `parent` or descends from it.
    pub fn is_child_or_equal_to(&self, parent: &Fqn) -> bool {
        self.len() >= parent.len() && self.elements.starts_with(&parent.elements)
    }

    /// True if any segment equals `segment`.
    pub fn has_element(&self, segment: &Segment) -> bool {
        self.elements.contains(segment)
    }

    /// Re-roots this path: strips `from` and prepends `to`. Returns `None`
    /// if this path does not lie under `from`.
    pub fn replace_ancestor(&self, from: &Fqn, to: &Fqn) -> Option<Fqn> {
        if !self.is_child_or_equal_to(from) {
            return None;
        }
        let mut elements = to.elements.clone();
        elements.extend(self.elements[from.len()..].iter().cloned());
        Some(Fqn { elements })
    }

    /// Delimited string form; parses back to an equal path when every
    /// segment is a string without separators.
    pub fn to_delimited_string(&self) -> String {
        self.to_string()
    }

    /// Serializes the path using the given wire layout.
    pub fn encode(&self, format: PathWireFormat) -> CacheResult<Vec<u8>> {
        match format {
            PathWireFormat::Legacy => Ok(bincode::serialize(&self.elements)?),
            PathWireFormat::LengthPrefixed => {
                let mut out = Vec::new();
                out.extend_from_slice(&(self.elements.len() as u32).to_le_bytes());
                for segment in &self.elements {
                    let bytes = bincode::serialize(segment)?;
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(&bytes);
                }
                Ok(out)
            }
        }
    }

    /// Deserializes a path written by [`Fqn::encode`] with the same layout.
    pub fn decode(bytes: &[u8], format: PathWireFormat) -> CacheResult<Fqn> {
        match format {
            PathWireFormat::Legacy => Ok(Fqn {
                elements: bincode::deserialize(bytes)?,
            }),
            PathWireFormat::LengthPrefixed => {
                let mut cursor = bytes;
                let count = read_u32(&mut cursor)? as usize;
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let len = read_u32(&mut cursor)? as usize;
                    if cursor.len() < len {
                        return Err(wire_error("truncated segment"));
                    }
                    let (segment, rest) = cursor.split_at(len);
                    elements.push(bincode::deserialize(segment)?);
                    cursor = rest;
                }
                if !cursor.is_empty() {
                    return Err(wire_error("trailing bytes after path"));
                }
                Ok(Fqn { elements })
            }
        }
    }
}

fn read_u32(cursor: &mut &[u8]) -> CacheResult<u32> {
    if cursor.len() < 4 {
        return Err(wire_error("truncated length prefix"));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

fn wire_error(msg: &str) -> CacheError {
    CacheError::Serialization(Box::new(bincode::ErrorKind::Custom(msg.to_string())))
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elements.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for segment in &self.elements {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for Fqn {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Fqn::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drops_empty_tokens() {
        let fqn = Fqn::parse("//a///b/");
        assert_eq!(fqn, Fqn::from_segments(["a", "b"]));
        assert_eq!(fqn.len(), 2);
    }

    #[test]
    fn test_parse_empty_is_root() {
        assert!(Fqn::parse("").is_root());
        assert!(Fqn::parse("/").is_root());
        assert_eq!(Fqn::root().to_string(), "/");
    }

    #[test]
    fn test_from_name_does_not_split() {
        let single = Fqn::from_name("a/b");
        assert_eq!(single.len(), 1);
        assert_ne!(single, Fqn::parse("a/b"));
        assert_eq!(single.last_segment(), Some(&Segment::from("a/b")));
    }

    #[test]
    fn test_parent_of_root_is_root() {
        assert_eq!(Fqn::root().parent(), Fqn::root());
        assert_eq!(Fqn::parse("/a/b").parent(), Fqn::parse("/a"));
        assert_eq!(Fqn::parse("/a").parent(), Fqn::root());
    }

    #[test]
    fn test_child_relations() {
        let a = Fqn::parse("/a");
        let ab = Fqn::parse("/a/b");
        let abc = Fqn::parse("/a/b/c");
        let ax = Fqn::parse("/ax");

        assert!(ab.is_child_of(&a));
        assert!(abc.is_child_of(&a));
        assert!(!a.is_child_of(&a));
        assert!(a.is_child_or_equal_to(&a));
        assert!(!ax.is_child_of(&a));
        assert!(a.is_child_of(&Fqn::root()));
        assert!(!Fqn::root().is_child_of(&Fqn::root()));
    }

    #[test]
    fn test_get_out_of_range() {
        let fqn = Fqn::parse("/a/b");
        assert_eq!(fqn.get(1).unwrap(), &Segment::from("b"));
        match fqn.get(2) {
            Err(CacheError::IndexOutOfRange { index: 2, len: 2 }) => {}
            other => panic!("expected IndexOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_relative_construction() {
        let base = Fqn::parse("/a");
        let rel = Fqn::parse("/b/c");
        assert_eq!(Fqn::from_relative(&base, &rel), Fqn::parse("/a/b/c"));

        let names = Fqn::from_relative_names(&base, ["x/y", "z"]);
        assert_eq!(names.len(), 3);
        assert_eq!(names.get(1).unwrap(), &Segment::from("x/y"));
    }

    #[test]
    fn test_has_element_and_int_segments() {
        let fqn = Fqn::from_segments([Segment::from("users"), Segment::Int(42)]);
        assert!(fqn.has_element(&Segment::Int(42)));
        assert!(!fqn.has_element(&Segment::from("42")));
        assert_eq!(fqn.to_string(), "/users/42");
    }

    #[test]
    fn test_replace_ancestor() {
        let fqn = Fqn::parse("/a/b/c");
        let moved = fqn
            .replace_ancestor(&Fqn::parse("/a"), &Fqn::parse("/backup/m1"))
            .unwrap();
        assert_eq!(moved, Fqn::parse("/backup/m1/b/c"));
        assert!(fqn.replace_ancestor(&Fqn::parse("/x"), &Fqn::root()).is_none());
    }

    #[test]
    fn test_both_wire_formats_decode_identically() {
        let fqn = Fqn::from_segments([
            Segment::from("a"),
            Segment::Int(-7),
            Segment::from("with/slash"),
        ]);
        for format in [PathWireFormat::Legacy, PathWireFormat::LengthPrefixed] {
            let bytes = fqn.encode(format).unwrap();
            assert_eq!(Fqn::decode(&bytes, format).unwrap(), fqn);
        }
        let root = Fqn::root();
        let bytes = root.encode(PathWireFormat::LengthPrefixed).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(
            Fqn::decode(&bytes, PathWireFormat::LengthPrefixed).unwrap(),
            root
        );
    }

    #[test]
    fn test_length_prefixed_rejects_truncation() {
        let bytes = Fqn::parse("/a/b")
            .encode(PathWireFormat::LengthPrefixed)
            .unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(Fqn::decode(truncated, PathWireFormat::LengthPrefixed).is_err());
        assert!(Fqn::decode(&[1, 0], PathWireFormat::LengthPrefixed).is_err());
    }
}
