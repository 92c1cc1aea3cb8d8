use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reads the value at a dotted field path, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Writes `value` at `path`, replacing any non-map value on the way down.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Parent maps left empty are kept.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Copies the fields named in `mask` from `source`, deleting those absent there.
    pub fn apply_mask_from(&mut self, source: &MapValue, mask: &[FieldPath]) {
        for path in mask {
            match source.get(path) {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }

    /// Every leaf field path present in this map. Empty nested maps count as leaves.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child_fields = match fields.get(first).map(|existing| existing.kind()) {
        Some(ValueKind::Map(map)) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(ValueKind::Map(child)) = fields.get(first).map(|value| value.kind()) {
        let mut child_fields = child.fields().clone();
        delete_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    acc: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.is_empty() && !value.is_vector() => {
                collect_leaf_paths(map.fields(), prefix, acc)
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    acc.push(path);
                }
            }
        }
        prefix.pop();
    }
}
