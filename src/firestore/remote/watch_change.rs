use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, TargetId, Timestamp};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message from the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Timestamp,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: Timestamp::min(),
            cause: None,
        }
    }

    /// A global `NoChange` carrying a read time marks a consistent snapshot.
    pub fn is_global_snapshot(&self) -> bool {
        self.state == TargetChangeState::NoChange && self.target_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: Document,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Timestamp,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: Timestamp,
    pub removed_target_ids: Vec<TargetId>,
}

/// Raw bloom filter parameters as sent by the server; validated later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(serializer, filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = serializer.decode_bytes(value.get("resumeToken"))?;
    let read_time = serializer.decode_version(value.get("readTime"))?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_rpc_status(cause.code),
                cause.message.unwrap_or_else(|| "watch target failed".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let updated_target_ids = numeric_array(value.get("targetIds"));
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_found_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids,
        removed_target_ids,
        document,
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentDelete(DocumentDelete {
        key,
        read_time,
        removed_target_ids,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("documentRemove missing document"))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = serializer.decode_version(value.get("readTime"))?;
    let removed_target_ids = numeric_array(value.get("removedTargetIds"));

    Ok(WatchChange::DocumentRemove(DocumentRemove {
        key,
        read_time,
        removed_target_ids,
    }))
}

fn decode_filter_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => {
            let bits = names.get("bits");
            Some(BloomFilterParams {
                bitmap: serializer.decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
                padding: bits
                    .and_then(|bits| bits.get("padding"))
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0) as i32,
                hash_count: names
                    .get("hashCount")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0) as i32,
            })
        }
        None => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Added,
        "REMOVE" => TargetChangeState::Removed,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": "AQID",
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(!change.is_global_snapshot());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [3],
                "targetChangeType": "REMOVE",
                "cause": {"code": 7, "message": "denied"}
            }
        });
        let Some(WatchChange::TargetChange(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn decodes_document_change() {
        let change = json!({
            "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "fields": {"n": {"integerValue": "1"}},
                    "updateTime": "2024-01-01T00:00:01Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });
        let Some(WatchChange::DocumentChange(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected document change");
        };
        assert_eq!(change.document.key().to_string(), "rooms/a");
        assert!(change.document.is_found());
        assert_eq!(change.updated_target_ids, vec![2]);
        assert_eq!(change.removed_target_ids, vec![4]);
    }

    #[test]
    fn decodes_existence_filter_with_bloom() {
        let change = json!({
            "filter": {
                "targetId": 5,
                "count": 2,
                "unchangedNames": {"bits": {"bitmap": "/w==", "padding": 1}, "hashCount": 3}
            }
        });
        let Some(WatchChange::ExistenceFilter(filter)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected filter");
        };
        assert_eq!(filter.target_id, 5);
        assert_eq!(filter.count, 2);
        assert_eq!(
            filter.unchanged_names,
            Some(BloomFilterParams {
                bitmap: vec![0xff],
                padding: 1,
                hash_count: 3
            })
        );
    }

    #[test]
    fn unknown_messages_are_ignored() {
        assert!(decode_watch_change(&serializer(), &json!({"other": {}})).unwrap().is_none());
    }
}
