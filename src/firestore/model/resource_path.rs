use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect();
        Self::new(segments)
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }

        if path.contains("//") {
            return Err(invalid_argument("Found empty segment in resource path"));
        }

        Ok(Self::from_segments(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut new_segments = self.segments.clone();
        new_segments.extend(segments.into_iter().map(Into::into));
        Self::new(new_segments)
    }

    pub fn without_last(&self) -> Self {
        if self.segments.is_empty() {
            return Self::root();
        }
        Self::new(self.segments[..self.segments.len() - 1].to_vec())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments.iter().zip(other.segments.iter()).all(|(l, r)| l == r)
    }

    /// True when `other` is a direct child of this path.
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match compare_segments(l, r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

/// Segments of the form `__id<n>__` are auto-generated numeric ids. They sort
/// numerically among themselves and before every other segment.
fn compare_segments(left: &str, right: &str) -> Ordering {
    match (numeric_id(left), numeric_id(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.as_bytes().cmp(right.as_bytes()),
    }
}

fn numeric_id(segment: &str) -> Option<i64> {
    segment
        .strip_prefix("__id")
        .and_then(|rest| rest.strip_suffix("__"))
        .and_then(|digits| digits.parse::<i64>().ok())
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn numeric_segments_sort_numerically() {
        let two = ResourcePath::from_string("c/__id2__").unwrap();
        let ten = ResourcePath::from_string("c/__id10__").unwrap();
        let plain = ResourcePath::from_string("c/a").unwrap();
        assert!(two < ten);
        assert!(ten < plain);
        let a = ResourcePath::from_string("c/10").unwrap();
        let b = ResourcePath::from_string("c/2").unwrap();
        assert!(a < b);
    }

    #[test]
    fn prefix_and_parent_checks() {
        let parent = ResourcePath::from_string("rooms").unwrap();
        let child = ResourcePath::from_string("rooms/a").unwrap();
        let grandchild = ResourcePath::from_string("rooms/a/messages/m").unwrap();
        assert!(parent.is_immediate_parent_of(&child));
        assert!(!parent.is_immediate_parent_of(&grandchild));
        assert!(parent.is_prefix_of(&grandchild));
        assert_eq!(grandchild.without_last().canonical_string(), "rooms/a/messages");
    }
}
