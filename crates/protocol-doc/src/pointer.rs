//! Pointer paths for addressing within protocol documents
//!
//! Provides [`DocPath`], an RFC 6901 JSON pointer extended with id-addressed
//! segments (`/activities/@id:ACT_1/name`). Id segments are resolved to a
//! positional index against a concrete document before a patch operation
//! touches it.

use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const ID_PREFIX: &str = "@id:";

/// One segment of a [`DocPath`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// Object key, array index or `-` (append), interpreted by the target
    Token(String),
    /// Array element whose `id` field equals the value
    Id(String),
}

impl Segment {
    /// Token segment
    #[inline]
    #[must_use]
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token(value.into())
    }

    /// Id-addressed segment
    #[inline]
    #[must_use]
    pub fn id(value: impl Into<String>) -> Self {
        Self::Id(value.into())
    }
}

/// Path within a protocol document
///
/// # Examples
/// - `""` → document root
/// - `/studyDesigns/0/activities/@id:ACT_1/name`
/// - `/studyDesigns/0/scheduleTimelines/0/instances/-`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPath(Vec<Segment>);

impl DocPath {
    /// Create path from segments
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Empty path (document root)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is the document root
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a token segment, returning new path
    #[must_use]
    pub fn key(&self, token: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(Segment::Token(token.into()));
        new
    }

    /// Append an array index segment, returning new path
    #[must_use]
    pub fn index(&self, index: usize) -> Self {
        self.key(index.to_string())
    }

    /// Append an id-addressed segment, returning new path
    #[must_use]
    pub fn id(&self, id: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(Segment::Id(id.into()));
        new
    }

    /// Append the `-` (end of array) segment, returning new path
    #[must_use]
    pub fn append(&self) -> Self {
        self.key("-")
    }

    /// Parent path (if not root)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Last segment (if not root)
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    /// Check if this path is a prefix of another
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.0 == other.0[..self.0.len()]
    }

    /// Resolve id segments against `document`, yielding plain pointer tokens
    ///
    /// Token segments are passed through untouched; navigation past a
    /// missing intermediate node only fails when a later id segment needs
    /// the node to search in.
    ///
    /// # Errors
    /// [`PointerError::UnresolvedId`] if an id segment matches no element,
    /// [`PointerError::NotAnArray`] if it is applied to a non-array
    pub fn resolve(&self, document: &Value) -> Result<Vec<String>, PointerError> {
        let mut tokens = Vec::with_capacity(self.0.len());
        let mut current = Some(document);

        for segment in &self.0 {
            match segment {
                Segment::Token(token) => {
                    current = current.and_then(|node| child(node, token));
                    tokens.push(token.clone());
                }
                Segment::Id(id) => {
                    let Some(node) = current else {
                        return Err(PointerError::UnresolvedId {
                            id: id.clone(),
                            path: self.to_string(),
                        });
                    };
                    let Value::Array(items) = node else {
                        return Err(PointerError::NotAnArray {
                            path: self.to_string(),
                        });
                    };
                    let index = position_of_id(items, id).ok_or_else(|| {
                        PointerError::UnresolvedId {
                            id: id.clone(),
                            path: self.to_string(),
                        }
                    })?;
                    current = items.get(index);
                    tokens.push(index.to_string());
                }
            }
        }

        Ok(tokens)
    }

    /// Look up the value at this path
    ///
    /// Returns `None` for missing nodes and unresolved ids.
    #[must_use]
    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        let tokens = self.resolve(document).ok()?;
        get_tokens(document, &tokens)
    }
}

/// Index of the array element whose `id` equals `id`
#[must_use]
pub(crate) fn position_of_id(items: &[Value], id: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| item.get("id").and_then(Value::as_str) == Some(id))
}

/// Navigate resolved tokens
#[must_use]
pub(crate) fn get_tokens<'a>(document: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens
        .iter()
        .try_fold(document, |node, token| child(node, token))
}

/// Mutable navigation of resolved tokens
pub(crate) fn get_tokens_mut<'a>(document: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut node = document;
    for token in tokens {
        node = match node {
            Value::Object(map) => map.get_mut(token)?,
            Value::Array(items) => items.get_mut(parse_index(token)?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn child<'a>(node: &'a Value, token: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(token),
        Value::Array(items) => items.get(parse_index(token)?),
        _ => None,
    }
}

/// Parse an array index token (no sign, no leading zeros)
#[must_use]
pub(crate) fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(raw: &str, pointer: &str) -> Result<String, PointerError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => {
                    return Err(PointerError::InvalidEscape {
                        pointer: pointer.to_string(),
                    })
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

impl Display for DocPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                Segment::Token(token) => write!(f, "/{}", escape(token))?,
                Segment::Id(id) => write!(f, "/{ID_PREFIX}{}", escape(id))?,
            }
        }
        Ok(())
    }
}

impl FromStr for DocPath {
    type Err = PointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(PointerError::MissingLeadingSlash {
                pointer: s.to_string(),
            });
        };

        let mut segments = Vec::new();
        for raw in rest.split('/') {
            let token = unescape(raw, s)?;
            match token.strip_prefix(ID_PREFIX) {
                Some("") => {
                    return Err(PointerError::EmptyId {
                        pointer: s.to_string(),
                    })
                }
                Some(id) => segments.push(Segment::Id(id.to_string())),
                None => segments.push(Segment::Token(token)),
            }
        }
        Ok(Self(segments))
    }
}

impl serde::Serialize for DocPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DocPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors from parsing or resolving pointer paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    /// Non-root pointer without a leading `/`
    #[error("pointer '{pointer}' must start with '/'")]
    MissingLeadingSlash { pointer: String },

    /// `~` not followed by `0` or `1`
    #[error("invalid escape sequence in pointer '{pointer}'")]
    InvalidEscape { pointer: String },

    /// `@id:` with nothing after it
    #[error("empty id segment in pointer '{pointer}'")]
    EmptyId { pointer: String },

    /// No element carries the id
    #[error("id '{id}' not found while resolving '{path}'")]
    UnresolvedId { id: String, path: String },

    /// Id segment applied to something other than an array
    #[error("id segment applied to a non-array in '{path}'")]
    NotAnArray { path: String },
}
