//! Object references
//!
//! Backups are structured as a collection of objects stored inside
//! segments. A reference names either a stored object (`<segment>/<tag>`,
//! where `<segment>` is a UUID and `<tag>` a zero-padded lowercase
//! hexadecimal sequence number) or the distinguished zero object, which
//! denotes a run of zero bytes without any physical storage.
//!
//! The textual forms:
//!
//! ```text
//! cf47429e-a503-43ac-9c31-bb3175fbb820/0000002b
//! zero
//! zero[1048576]
//! ```
//!
//! An absent reference is expressed as `Option<ObjectReference>` at API
//! boundaries rather than a variant here.

use uuid::Uuid;

/// Generate a fresh lowercase UUID, suitable for use as a segment name.
pub fn generate_segment_name() -> String {
    Uuid::new_v4().to_string()
}

/// A reference to a stored object, or a special non-stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectReference {
    /// A run of zero bytes; `size` is the length when known.
    Zero { size: Option<u64> },
    /// An object stored at `<segment>/<sequence>`.
    Normal { segment: String, sequence: String },
}

impl ObjectReference {
    /// Reference to an object by segment name and sequence tag.
    pub fn normal(segment: impl Into<String>, sequence: impl Into<String>) -> Self {
        ObjectReference::Normal {
            segment: segment.into(),
            sequence: sequence.into(),
        }
    }

    /// Reference to an object by segment name and numeric sequence id.
    /// The tag is the zero-padded base-16 form of the id.
    pub fn from_sequence_id(segment: impl Into<String>, id: u32) -> Self {
        ObjectReference::Normal {
            segment: segment.into(),
            sequence: format!("{:08x}", id),
        }
    }

    /// The zero reference with no recorded length.
    pub fn zero() -> Self {
        ObjectReference::Zero { size: None }
    }

    /// The zero reference denoting `size` zero bytes.
    pub fn zero_with_size(size: u64) -> Self {
        ObjectReference::Zero { size: Some(size) }
    }

    /// True for references that name a stored object. Special references
    /// (zero) have no backing storage and are always available.
    pub fn is_normal(&self) -> bool {
        matches!(self, ObjectReference::Normal { .. })
    }

    /// Segment name for normal references.
    pub fn segment(&self) -> Option<&str> {
        match self {
            ObjectReference::Normal { segment, .. } => Some(segment),
            ObjectReference::Zero { .. } => None,
        }
    }

    /// Sequence tag for normal references.
    pub fn sequence(&self) -> Option<&str> {
        match self {
            ObjectReference::Normal { sequence, .. } => Some(sequence),
            ObjectReference::Zero { .. } => None,
        }
    }

    /// Parse the canonical textual form. Returns `None` on syntax errors.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "zero" {
            return Some(ObjectReference::zero());
        }
        if let Some(rest) = s.strip_prefix("zero[") {
            let digits = rest.strip_suffix(']')?;
            let size = digits.parse::<u64>().ok()?;
            return Some(ObjectReference::zero_with_size(size));
        }

        let (segment, sequence) = s.split_once('/')?;
        if segment.is_empty() || sequence.is_empty() {
            return None;
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b) || b == b'-')
        {
            return None;
        }
        if !sequence
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        Some(ObjectReference::normal(segment, sequence))
    }
}

impl std::fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectReference::Zero { size: None } => write!(f, "zero"),
            ObjectReference::Zero { size: Some(n) } => write!(f, "zero[{}]", n),
            ObjectReference::Normal { segment, sequence } => {
                write!(f, "{}/{}", segment, sequence)
            }
        }
    }
}
