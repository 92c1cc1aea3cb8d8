use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// How a `set` treats fields already present on the document.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Merge every field in the data instead of replacing the document.
    pub merge: bool,
    /// Merge only these fields. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut unique = Vec::new();
        let mut seen = BTreeSet::new();
        for field in fields {
            if seen.insert(field.clone()) {
                unique.push(field);
            }
        }
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

/// User data split into plain values and write-time transforms.
struct ParsedData {
    map: MapValue,
    /// Leaf paths carrying a plain value.
    value_paths: Vec<FieldPath>,
    delete_paths: Vec<FieldPath>,
    transforms: Vec<FieldTransform>,
}

/// Builds the mutation for `set`. A merge becomes a patch restricted to the
/// merged fields; anything else replaces the whole document.
pub(crate) fn set_mutation(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let mut parsed = ParsedData::empty();
    for (field, value) in &data {
        parsed.parse_value(FieldPath::new([field.clone()])?, value)?;
    }

    if !options.is_merge() {
        if let Some(path) = parsed.delete_paths.first() {
            return Err(invalid_argument(format!(
                "delete_field() can only be used with update or a merging set (field '{}')",
                path.canonical_string()
            )));
        }
        return Ok(Mutation::Set {
            key,
            value: parsed.map,
            precondition: Precondition::None,
            field_transforms: parsed.transforms,
        });
    }

    let mask = match &options.merge_fields {
        Some(fields) => {
            let available: BTreeSet<&FieldPath> = parsed
                .value_paths
                .iter()
                .chain(parsed.delete_paths.iter())
                .chain(parsed.transforms.iter().map(FieldTransform::field_path))
                .collect();
            for field in fields {
                if !available.iter().any(|path| field.is_prefix_of(path)) {
                    return Err(invalid_argument(format!(
                        "field '{}' is listed in merge_fields but missing from the data",
                        field.canonical_string()
                    )));
                }
            }
            let mask = FieldMask::new(fields.iter().cloned());
            parsed
                .transforms
                .retain(|transform| mask.covers(transform.field_path()));
            mask
        }
        None => FieldMask::new(parsed.value_paths.into_iter().chain(parsed.delete_paths)),
    };
    Ok(Mutation::Patch {
        key,
        value: parsed.map,
        mask,
        precondition: Precondition::None,
        field_transforms: parsed.transforms,
    })
}

/// Builds the mutation for `update`. Keys are dot-separated field paths and
/// the document must exist.
pub(crate) fn update_mutation(key: DocumentKey, data: BTreeMap<String, FirestoreValue>) -> FirestoreResult<Mutation> {
    if data.is_empty() {
        return Err(invalid_argument("update requires at least one field"));
    }
    let mut parsed = ParsedData::empty();
    let mut seen: Vec<FieldPath> = Vec::new();
    for (field, value) in &data {
        let path = FieldPath::from_dot_separated(field)?;
        if let Some(conflict) = seen
            .iter()
            .find(|other| other.is_prefix_of(&path) || path.is_prefix_of(other))
        {
            return Err(invalid_argument(format!(
                "field '{}' conflicts with field '{}'",
                path.canonical_string(),
                conflict.canonical_string()
            )));
        }
        seen.push(path.clone());
        match value.kind() {
            // An update replaces a nested map wholesale.
            ValueKind::Map(map) if !map.is_empty() => {
                assert_no_sentinel(value, &path)?;
                parsed.map.set(&path, value.clone());
                parsed.value_paths.push(path);
            }
            _ => parsed.parse_value(path, value)?,
        }
    }
    Ok(Mutation::Patch {
        key,
        value: parsed.map,
        mask: FieldMask::new(parsed.value_paths.into_iter().chain(parsed.delete_paths)),
        precondition: Precondition::Exists(true),
        field_transforms: parsed.transforms,
    })
}

/// Fails the whole batch unless the document exists.
pub(crate) fn verify_mutation(key: DocumentKey) -> Mutation {
    Mutation::Verify {
        key,
        precondition: Precondition::Exists(true),
    }
}

impl ParsedData {
    fn empty() -> Self {
        Self {
            map: MapValue::empty(),
            value_paths: Vec::new(),
            delete_paths: Vec::new(),
            transforms: Vec::new(),
        }
    }

    fn parse_value(&mut self, path: FieldPath, value: &FirestoreValue) -> FirestoreResult<()> {
        match value.kind() {
            ValueKind::Sentinel(SentinelValue::Delete) => self.delete_paths.push(path),
            ValueKind::Sentinel(sentinel) => {
                let operation = transform_operation(sentinel, &path)?;
                self.transforms.push(FieldTransform::new(path, operation));
            }
            ValueKind::Map(map) if !map.is_empty() => {
                for (child, child_value) in map.fields() {
                    let mut segments = path.segments().to_vec();
                    segments.push(child.clone());
                    self.parse_value(FieldPath::new(segments)?, child_value)?;
                }
            }
            _ => {
                assert_no_sentinel(value, &path)?;
                self.map.set(&path, value.clone());
                self.value_paths.push(path);
            }
        }
        Ok(())
    }
}

fn transform_operation(sentinel: &SentinelValue, path: &FieldPath) -> FirestoreResult<TransformOperation> {
    Ok(match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            for element in elements {
                assert_no_sentinel(element, path)?;
            }
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                assert_no_sentinel(element, path)?;
            }
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => match operand.kind() {
            ValueKind::Integer(_) | ValueKind::Double(_) => TransformOperation::NumericIncrement((**operand).clone()),
            _ => return Err(invalid_argument("increment requires a numeric operand")),
        },
        SentinelValue::Delete => {
            return Err(invalid_argument(format!(
                "delete_field() cannot be used here (field '{}')",
                path.canonical_string()
            )))
        }
    })
}

fn assert_no_sentinel(value: &FirestoreValue, context: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "sentinel values cannot be nested in arrays or replaced maps (field '{}')",
            context.canonical_string()
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, context)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    fn key() -> DocumentKey {
        DocumentKey::from_string("cities/sf").unwrap()
    }

    fn path(dotted: &str) -> FieldPath {
        FieldPath::from_dot_separated(dotted).unwrap()
    }

    #[test]
    fn plain_set_replaces_the_document() {
        let data = BTreeMap::from([
            ("name".to_string(), FirestoreValue::from_string("SF")),
            ("updated".to_string(), FirestoreValue::server_timestamp()),
        ]);
        let mutation = set_mutation(key(), data, &SetOptions::default()).unwrap();
        let Mutation::Set { value, field_transforms, .. } = mutation else {
            panic!("expected a set");
        };
        assert_eq!(value.get(&path("name")), Some(&FirestoreValue::from_string("SF")));
        assert!(value.get(&path("updated")).is_none());
        assert_eq!(field_transforms.len(), 1);
    }

    #[test]
    fn merge_set_masks_leaf_fields() {
        let nested = FirestoreValue::from_map(BTreeMap::from([(
            "population".to_string(),
            FirestoreValue::from_integer(5),
        )]));
        let data = BTreeMap::from([
            ("stats".to_string(), nested),
            ("old".to_string(), FirestoreValue::delete_field()),
        ]);
        let mutation = set_mutation(key(), data, &SetOptions::merge_all()).unwrap();
        let Mutation::Patch { mask, precondition, .. } = mutation else {
            panic!("expected a patch");
        };
        assert_eq!(mask.to_vec(), vec![path("old"), path("stats.population")]);
        assert_eq!(precondition, Precondition::None);
    }

    #[test]
    fn merge_fields_must_exist_in_data() {
        let data = BTreeMap::from([("a".to_string(), FirestoreValue::from_integer(1))]);
        let options = SetOptions::merge_fields([path("b")]).unwrap();
        let err = set_mutation(key(), data, &options).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn delete_field_needs_merge_or_update() {
        let data = BTreeMap::from([("a".to_string(), FirestoreValue::delete_field())]);
        assert!(set_mutation(key(), data.clone(), &SetOptions::default()).is_err());
        let Mutation::Patch { mask, precondition, .. } = update_mutation(key(), data).unwrap() else {
            panic!("expected a patch");
        };
        assert!(mask.covers(&path("a")));
        assert_eq!(precondition, Precondition::Exists(true));
    }

    #[test]
    fn update_keys_are_field_paths() {
        let data = BTreeMap::from([("stats.count".to_string(), FirestoreValue::from_integer(2))]);
        let Mutation::Patch { value, mask, .. } = update_mutation(key(), data).unwrap() else {
            panic!("expected a patch");
        };
        assert_eq!(value.get(&path("stats.count")), Some(&FirestoreValue::from_integer(2)));
        assert_eq!(mask.to_vec(), vec![path("stats.count")]);
    }

    #[test]
    fn update_rejects_overlapping_paths_and_bad_operands() {
        let overlapping = BTreeMap::from([
            ("a".to_string(), FirestoreValue::from_integer(1)),
            ("a.b".to_string(), FirestoreValue::from_integer(2)),
        ]);
        assert!(update_mutation(key(), overlapping).is_err());

        let bad = BTreeMap::from([(
            "total".to_string(),
            FirestoreValue::numeric_increment(FirestoreValue::from_string("five")),
        )]);
        assert_eq!(
            update_mutation(key(), bad).unwrap_err().code_str(),
            "firestore/invalid-argument"
        );
    }

    #[test]
    fn arrays_reject_nested_sentinels() {
        let data = BTreeMap::from([(
            "values".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
        )]);
        assert!(set_mutation(key(), data, &SetOptions::default()).is_err());
    }
}
