use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{assertion_failed, FirestoreResult};
use crate::firestore::model::{BatchId, Document, DocumentKey, DocumentMap, FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, doc: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found(),
            Precondition::UpdateTime(time) => doc.is_found() && doc.version() == *time,
        }
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I: IntoIterator<Item = &'a FieldPath>>(mut self, extra: I) -> Self {
        self.fields.extend(extra.into_iter().cloned());
        self
    }

    pub fn to_vec(&self) -> Vec<FieldPath> {
        self.fields.iter().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Local estimate of the transform. Server timestamps resolve to the
    /// batch's local write time until acknowledged.
    pub fn apply_to_local_view(&self, previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self { field_path, operation }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// A single document write.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        value: MapValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            value,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set { field_transforms, .. } | Mutation::Patch { field_transforms, .. } => field_transforms,
            _ => &[],
        }
    }

    /// Applies the acknowledged mutation to the remote document cache entry.
    pub fn apply_to_remote_document(&self, doc: &mut Document, result: &MutationResult) {
        match self {
            Mutation::Set { value, field_transforms, .. } => {
                let mut data = value.clone();
                let transform_results =
                    server_transform_results(field_transforms, doc, &result.transform_results, result.version);
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                doc.convert_to_found(result.version, data).set_has_committed_mutations();
            }
            Mutation::Patch {
                value,
                mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(doc) {
                    // The base document is not cached; its contents after the write are unknown.
                    doc.convert_to_unknown(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(field_transforms, doc, &result.transform_results, result.version);
                let mut data = doc.data();
                data.apply_mask_from(value, &mask.to_vec());
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                doc.convert_to_found(result.version, data).set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(result.version).set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the mutation to a local view of `doc`. Returns the accumulated
    /// mask of changed fields, or `None` when the whole document was replaced.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(doc) {
            return previous_mask;
        }
        match self {
            Mutation::Set { value, field_transforms, .. } => {
                let mut data = value.clone();
                for (path, value) in local_transform_results(field_transforms, doc, local_write_time) {
                    data.set(&path, value);
                }
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            Mutation::Patch {
                value,
                mask,
                field_transforms,
                ..
            } => {
                let transform_results = local_transform_results(field_transforms, doc, local_write_time);
                let mut data = doc.data();
                data.apply_mask_from(value, &mask.to_vec());
                for (path, value) in transform_results {
                    data.set(&path, value);
                }
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields())
                        .union_with(field_transforms.iter().map(FieldTransform::field_path))
                })
            }
            Mutation::Delete { .. } => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }
}

fn local_transform_results(
    transforms: &[FieldTransform],
    doc: &Document,
    local_write_time: Timestamp,
) -> Vec<(FieldPath, FirestoreValue)> {
    transforms
        .iter()
        .map(|transform| {
            let previous = doc.field(transform.field_path());
            (
                transform.field_path().clone(),
                transform.operation().apply_to_local_view(previous, local_write_time),
            )
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    doc: &Document,
    server_results: &[FirestoreValue],
    commit_version: Timestamp,
) -> Vec<(FieldPath, FirestoreValue)> {
    if server_results.len() != transforms.len() {
        if !server_results.is_empty() {
            log::warn!(
                "server returned {} transform results for {} transforms; using local estimates",
                server_results.len(),
                transforms.len()
            );
        }
        return local_transform_results(transforms, doc, commit_version);
    }
    transforms
        .iter()
        .zip(server_results.iter())
        .map(|(transform, value)| (transform.field_path().clone(), value.clone()))
        .collect()
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();
    FirestoreValue::from_array(
        values
            .into_iter()
            .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
            .collect(),
    )
}

/// Non-numeric previous values count as zero. Integer overflow falls back to a double.
fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => match current.checked_add(*delta) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => FirestoreValue::from_double(*current as f64 + delta),
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => FirestoreValue::from_double(current + *delta as f64),
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => FirestoreValue::from_double(current + delta),
        (_, ValueKind::Integer(_)) | (_, ValueKind::Double(_)) => operand.clone(),
        _ => FirestoreValue::from_integer(0),
    }
}

/// Computes the single mutation that turns the remote version of `doc` into
/// its current local view, given the fields changed by pending batches.
pub fn calculate_overlay_mutation(doc: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !doc.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if doc.is_no_document() {
            Mutation::delete(doc.key().clone())
        } else {
            Mutation::set(doc.key().clone(), doc.data())
        });
    };

    let data = doc.data();
    let mut patch_value = MapValue::empty();
    let mut mask_set = BTreeSet::new();
    for path in mask.fields() {
        if mask_set.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.get(&path).cloned();
        if value.is_none() && path.len() > 1 {
            // The leaf was deleted. Store the parent so the overlay still removes it.
            if let Ok(parent) = FieldPath::new(path.segments()[..path.len() - 1].to_vec()) {
                path = parent;
                value = data.get(&path).cloned();
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }
    Some(Mutation::Patch {
        key: doc.key().clone(),
        value: patch_value,
        mask: FieldMask::new(mask_set),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

/// Mutations written together by one local commit.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|mutation| mutation.key().clone()).collect()
    }

    pub fn apply_to_remote_document(&self, doc: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results.iter()) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, mutation_result);
            }
        }
    }

    pub fn apply_to_local_view(&self, doc: &mut Document, mask: Option<FieldMask>) -> Option<FieldMask> {
        let mut mask = mask;
        for mutation in &self.mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to already-overlaid documents and returns the new
    /// overlay for every key the batch touches. Keys in
    /// `documents_without_remote_version` get full-document overlays.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut DocumentMap,
        masks: &mut BTreeMap<DocumentKey, Option<FieldMask>>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let key = mutation.key();
            let doc = documents
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key.clone()));
            let previous = masks.remove(key).unwrap_or_else(|| Some(FieldMask::default()));
            let mut mask = self.apply_to_local_view(doc, previous);
            if documents_without_remote_version.contains(key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(doc, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !doc.is_valid() {
                doc.convert_to_no_document(Timestamp::min());
            }
            masks.insert(key.clone(), mask);
        }
        overlays
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: Timestamp,
    pub transform_results: Vec<FirestoreValue>,
}

/// A batch paired with the server's acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: Timestamp,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, Timestamp>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: Timestamp,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(assertion_failed(format!(
                "batch {} has {} mutations but {} results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

/// The folded effect of every pending batch on one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut map = MapValue::empty();
        for (path, value) in entries {
            map.set(&field(path), value.clone());
        }
        map
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = Document::new_found(key("c/a"), Timestamp::new(1, 0), map(&[("old", FirestoreValue::from_integer(1))]));
        let mutation = Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0));
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data(), map(&[("x", FirestoreValue::from_integer(2))]));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = Document::new_no_document(key("c/a"), Timestamp::new(1, 0));
        let patch = Mutation::patch(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]), FieldMask::new([field("x")]));
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0));
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(doc.is_no_document());
    }

    #[test]
    fn patch_merges_and_accumulates_mask() {
        let mut doc = Document::new_found(
            key("c/a"),
            Timestamp::new(1, 0),
            map(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]),
        );
        let patch = Mutation::Patch {
            key: key("c/a"),
            value: map(&[("b", FirestoreValue::from_integer(3))]),
            mask: FieldMask::new([field("b"), field("gone")]),
            precondition: Precondition::Exists(true),
            field_transforms: vec![FieldTransform::new(
                field("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(5)),
            )],
        };
        let mask = patch
            .apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0))
            .unwrap();
        assert_eq!(mask.to_vec(), vec![field("b"), field("gone"), field("n")]);
        assert_eq!(doc.field(&field("a")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(doc.field(&field("b")), Some(&FirestoreValue::from_integer(3)));
        assert_eq!(doc.field(&field("n")), Some(&FirestoreValue::from_integer(5)));
    }

    #[test]
    fn server_timestamp_uses_local_write_time() {
        let mut doc = Document::new_invalid(key("c/a"));
        let mutation = Mutation::Set {
            key: key("c/a"),
            value: MapValue::empty(),
            precondition: Precondition::None,
            field_transforms: vec![FieldTransform::new(field("at"), TransformOperation::ServerTimestamp)],
        };
        mutation.apply_to_local_view(&mut doc, None, Timestamp::new(42, 0));
        assert_eq!(doc.field(&field("at")), Some(&FirestoreValue::from_timestamp(Timestamp::new(42, 0))));
    }

    #[test]
    fn increment_overflow_becomes_double() {
        let value = numeric_increment(Some(&FirestoreValue::from_integer(i64::MAX)), &FirestoreValue::from_integer(1));
        assert!(matches!(value.kind(), ValueKind::Double(_)));
        let value = numeric_increment(Some(&FirestoreValue::from_string("x")), &FirestoreValue::from_integer(3));
        assert_eq!(value, FirestoreValue::from_integer(3));
    }

    #[test]
    fn array_transforms() {
        let existing = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]);
        let union = array_union(Some(&existing), &[FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        assert_eq!(union.as_array().unwrap().values().len(), 3);
        let removed = array_remove(Some(&existing), &[FirestoreValue::from_integer(1)]);
        assert_eq!(removed.as_array().unwrap().values(), &[FirestoreValue::from_integer(2)]);
    }

    #[test]
    fn acknowledged_patch_without_base_becomes_unknown() {
        let mut doc = Document::new_invalid(key("c/a"));
        let patch = Mutation::patch(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]), FieldMask::new([field("x")]));
        patch.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: Timestamp::new(9, 0),
                transform_results: Vec::new(),
            },
        );
        assert!(doc.is_unknown());
        assert_eq!(doc.version(), Timestamp::new(9, 0));
    }

    #[test]
    fn acknowledged_set_uses_server_transform_results() {
        let mut doc = Document::new_invalid(key("c/a"));
        let mutation = Mutation::Set {
            key: key("c/a"),
            value: MapValue::empty(),
            precondition: Precondition::None,
            field_transforms: vec![FieldTransform::new(field("at"), TransformOperation::ServerTimestamp)],
        };
        let server_time = FirestoreValue::from_timestamp(Timestamp::new(100, 0));
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: Timestamp::new(100, 0),
                transform_results: vec![server_time.clone()],
            },
        );
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.field(&field("at")), Some(&server_time));
    }

    #[test]
    fn overlay_for_deleted_leaf_uses_parent() {
        let mut doc = Document::new_found(key("c/a"), Timestamp::new(1, 0), map(&[("a.b", FirestoreValue::from_integer(1))]));
        let patch = Mutation::Patch {
            key: key("c/a"),
            value: MapValue::empty(),
            mask: FieldMask::new([field("a.b")]),
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        };
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(2, 0));
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch { mask, value, .. } => {
                assert_eq!(mask.to_vec(), vec![field("a")]);
                assert_eq!(value.get(&field("a")), Some(&FirestoreValue::from_map(BTreeMap::new())));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn batch_result_requires_matching_lengths() {
        let batch = MutationBatch::new(1, Timestamp::new(1, 0), vec![Mutation::delete(key("c/a"))]);
        assert!(MutationBatchResult::from(batch.clone(), Timestamp::new(2, 0), Vec::new(), Vec::new()).is_err());
        let result = MutationBatchResult::from(
            batch,
            Timestamp::new(2, 0),
            vec![MutationResult {
                version: Timestamp::new(2, 0),
                transform_results: Vec::new(),
            }],
            vec![1],
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&Timestamp::new(2, 0)));
    }
}
