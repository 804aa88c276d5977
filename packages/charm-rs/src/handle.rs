//! Hierarchical addresses for stateful objects.
//!
//! A [`Handle`] is an ordered list of `(kind, key)` segments. Its string form is the
//! segments joined by `/`, with keys in brackets:
//!
//! ```text
//! Unit/Relation[db:4]/RemoteApp
//! ```
//!
//! The string form is the persisted identity of an object, so rendering and parsing
//! must be exact inverses, and a kind is restricted to characters that cannot be
//! confused with the separator or the key brackets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use crate::error::AddressError;

/// Separator between segments in a rendered handle.
pub const SEPARATOR: char = '/';

/// One step in a [`Handle`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    kind: String,
    key: Option<String>,
}

impl Segment {
    /// Build a validated segment.
    pub fn new(kind: &str, key: Option<&str>) -> Result<Self, AddressError> {
        validate_kind(kind)?;
        if let Some(key) = key {
            validate_key(key)?;
        }
        Ok(Self {
            kind: kind.to_string(),
            key: key.map(str::to_string),
        })
    }

    /// The segment kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The sibling-distinguishing key, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn parse(path: &str, raw: &str) -> Result<Self, AddressError> {
        let malformed = || AddressError::Malformed {
            path: path.to_string(),
            segment: raw.to_string(),
        };

        match raw.find('[') {
            None => Segment::new(raw, None),
            Some(open) => {
                let key = raw[open + 1..].strip_suffix(']').ok_or_else(malformed)?;
                Segment::new(&raw[..open], Some(key))
            }
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}[{}]", self.kind, key),
            None => f.write_str(&self.kind),
        }
    }
}

fn validate_kind(kind: &str) -> Result<(), AddressError> {
    let reason = if kind.is_empty() {
        "kind must not be empty"
    } else if kind.contains(SEPARATOR) {
        "kind must not contain '/'"
    } else if kind.contains(['[', ']']) {
        "kind must not contain '[' or ']'"
    } else {
        return Ok(());
    };
    Err(AddressError::InvalidKind {
        kind: kind.to_string(),
        reason,
    })
}

fn validate_key(key: &str) -> Result<(), AddressError> {
    let reason = if key.is_empty() {
        "key must not be empty; omit it instead"
    } else if key.contains(SEPARATOR) {
        "key must not contain '/'"
    } else {
        return Ok(());
    };
    Err(AddressError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

// =============================================================================
// Handle
// =============================================================================

/// Stable, reconstructible address of an object or event source.
///
/// Two handles are equal iff their segment sequences are equal. Ordering is
/// lexicographic over segments, so a parent always sorts before its children.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    segments: SmallVec<[Segment; 4]>,
}

impl Handle {
    /// A single-segment handle: the top of an object tree.
    pub fn root(kind: &str) -> Result<Self, AddressError> {
        let mut segments = SmallVec::new();
        segments.push(Segment::new(kind, None)?);
        Ok(Self { segments })
    }

    /// Derive the address of a child object.
    pub fn child(&self, kind: &str, key: Option<&str>) -> Result<Self, AddressError> {
        let mut segments = self.segments.clone();
        segments.push(Segment::new(kind, key)?);
        Ok(Self { segments })
    }

    /// The handle this one was derived from, or `None` for a root.
    pub fn parent(&self) -> Option<Handle> {
        if self.segments.len() < 2 {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    fn last(&self) -> &Segment {
        // Constructors never produce an empty handle.
        &self.segments[self.segments.len() - 1]
    }

    /// Kind of the last segment.
    pub fn kind(&self) -> &str {
        self.last().kind()
    }

    /// Key of the last segment.
    pub fn key(&self) -> Option<&str> {
        self.last().key()
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True for a single-segment handle.
    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// True if `other` lives strictly below this handle.
    pub fn is_ancestor_of(&self, other: &Handle) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// All segments, root first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The rendered path.
    pub fn path(&self) -> String {
        self.to_string()
    }
}

/// Derive a child address; the free-function form of [`Handle::child`].
pub fn child_handle(parent: &Handle, kind: &str, key: Option<&str>) -> Result<Handle, AddressError> {
    parent.child(kind, key)
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", SEPARATOR)?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self)
    }
}

impl FromStr for Handle {
    type Err = AddressError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        if path.is_empty() {
            return Err(AddressError::Empty);
        }
        let segments = path
            .split(SEPARATOR)
            .map(|raw| Segment::parse(path, raw))
            .collect::<Result<SmallVec<[Segment; 4]>, _>>()?;
        Ok(Self { segments })
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        path.parse().map_err(serde::de::Error::custom)
    }
}
