use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

const TYPE_KEY: &str = "__type__";
const VECTOR_TYPE: &str = "__vector__";
const VECTOR_VALUE_KEY: &str = "value";

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Write-time placeholders that become field transforms once a write is prepared.
#[derive(Clone, Debug, PartialEq)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self { kind: ValueKind::Null }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    /// A dense vector of doubles, stored as a tagged map.
    pub fn vector(values: Vec<f64>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(TYPE_KEY.to_string(), FirestoreValue::from_string(VECTOR_TYPE));
        map.insert(
            VECTOR_VALUE_KEY.to_string(),
            FirestoreValue::from_array(values.into_iter().map(FirestoreValue::from_double).collect()),
        );
        Self::from_map(map)
    }

    pub fn server_timestamp() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ServerTimestamp),
        }
    }

    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)),
        }
    }

    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)),
        }
    }

    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))),
        }
    }

    /// Marks a field for deletion in an update.
    pub fn delete_field() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::Delete),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, ValueKind::Sentinel(_))
    }

    pub fn is_vector(&self) -> bool {
        self.as_map()
            .and_then(|map| map.fields().get(TYPE_KEY))
            .map(|tag| matches!(tag.kind(), ValueKind::String(s) if s == VECTOR_TYPE))
            .unwrap_or(false)
    }

    fn type_order(&self) -> u8 {
        match &self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::Sentinel(_) => 4,
            ValueKind::String(_) => 5,
            ValueKind::Bytes(_) => 6,
            ValueKind::Reference(_) => 7,
            ValueKind::GeoPoint(_) => 8,
            ValueKind::Array(_) => 9,
            ValueKind::Map(_) if self.is_vector() => 10,
            ValueKind::Map(_) => 11,
        }
    }

    /// Total order across value types, used by query ordering and range filters.
    pub fn compare(&self, other: &FirestoreValue) -> Ordering {
        let by_type = self.type_order().cmp(&other.type_order());
        if by_type != Ordering::Equal {
            return by_type;
        }
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
            (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
            (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
            (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
            (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude())),
            (ValueKind::Array(l), ValueKind::Array(r)) => compare_arrays(l.values(), r.values()),
            (ValueKind::Map(l), ValueKind::Map(r)) if self.is_vector() => compare_vectors(l, r),
            (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
            _ => Ordering::Equal,
        }
    }
}

/// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    left_segments.cmp(right_segments)
}

fn compare_arrays(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = l.compare(r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn compare_vectors(left: &MapValue, right: &MapValue) -> Ordering {
    let values = |map: &MapValue| {
        map.fields()
            .get(VECTOR_VALUE_KEY)
            .and_then(|value| value.as_array().map(|array| array.values().to_vec()))
            .unwrap_or_default()
    };
    let (l, r) = (values(left), values(right));
    l.len().cmp(&r.len()).then_with(|| compare_arrays(&l, &r))
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.as_bytes().cmp(rk.as_bytes()).then_with(|| lv.compare(rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}
