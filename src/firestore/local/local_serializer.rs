use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::{BundleMetadata, NamedQuery};
use crate::firestore::local::target_cache::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DatabaseId, Document, DocumentContents, ListenSequenceNumber, MutationBatch, Overlay,
    TargetId, Timestamp,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbRemoteDocument {
    kind: DbDocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fields: Option<JsonValue>,
    version: String,
    read_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create_time: Option<String>,
    #[serde(default)]
    has_committed_mutations: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum DbDocumentKind {
    Found,
    NoDocument,
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbMutationBatch {
    batch_id: BatchId,
    local_write_time: String,
    mutations: Vec<JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbOverlay {
    largest_batch_id: BatchId,
    mutation: JsonValue,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbTarget {
    target_id: TargetId,
    canonical_id: String,
    query: JsonValue,
    purpose: String,
    sequence_number: ListenSequenceNumber,
    snapshot_version: String,
    last_limbo_free_snapshot_version: String,
    #[serde(default)]
    resume_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected_count: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbNamedQuery {
    name: String,
    query: JsonValue,
    read_time: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbBundle {
    id: String,
    create_time: String,
    version: i32,
}

/// Encodes model objects into the JSON text stored in persistence rows.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            remote: JsonProtoSerializer::new(database_id),
        }
    }

    pub fn encode_document(&self, document: &Document) -> FirestoreResult<String> {
        let (kind, fields) = match document.contents() {
            DocumentContents::Found { data } => (DbDocumentKind::Found, Some(self.remote.encode_fields(data))),
            DocumentContents::NoDocument => (DbDocumentKind::NoDocument, None),
            DocumentContents::Unknown => (DbDocumentKind::Unknown, None),
            DocumentContents::Invalid => {
                return Err(internal_error(format!(
                    "cannot persist invalid document {}",
                    document.key()
                )))
            }
        };
        let row = DbRemoteDocument {
            kind,
            fields,
            version: document.version().to_rfc3339(),
            read_time: document.read_time().to_rfc3339(),
            create_time: document.create_time().map(|time| time.to_rfc3339()),
            has_committed_mutations: document.has_committed_mutations(),
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_document(&self, key: &crate::firestore::model::DocumentKey, text: &str) -> FirestoreResult<Document> {
        let row: DbRemoteDocument = serde_json::from_str(text)?;
        let version = Timestamp::parse_rfc3339(&row.version)?;
        let mut document = match row.kind {
            DbDocumentKind::Found => {
                let fields = row.fields.unwrap_or_else(|| json!({}));
                let data = self.remote.decode_map_value(&json!({ "fields": fields }))?;
                Document::new_found(key.clone(), version, data)
            }
            DbDocumentKind::NoDocument => Document::new_no_document(key.clone(), version),
            DbDocumentKind::Unknown => Document::new_unknown(key.clone(), version),
        };
        document.set_read_time(Timestamp::parse_rfc3339(&row.read_time)?);
        if let Some(create_time) = row.create_time {
            document.set_create_time(Some(Timestamp::parse_rfc3339(&create_time)?));
        }
        if row.has_committed_mutations {
            document.set_has_committed_mutations();
        }
        Ok(document)
    }

    pub fn encode_mutation_batch(&self, batch: &MutationBatch) -> FirestoreResult<String> {
        let row = DbMutationBatch {
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time.to_rfc3339(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_mutation_batch(&self, text: &str) -> FirestoreResult<MutationBatch> {
        let row: DbMutationBatch = serde_json::from_str(text)?;
        let mutations = row
            .mutations
            .iter()
            .map(|mutation| self.remote.decode_mutation(mutation))
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(MutationBatch::new(
            row.batch_id,
            Timestamp::parse_rfc3339(&row.local_write_time)?,
            mutations,
        ))
    }

    pub fn encode_overlay(&self, overlay: &Overlay) -> FirestoreResult<String> {
        let row = DbOverlay {
            largest_batch_id: overlay.largest_batch_id,
            mutation: self.remote.encode_mutation(&overlay.mutation),
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_overlay(&self, text: &str) -> FirestoreResult<Overlay> {
        let row: DbOverlay = serde_json::from_str(text)?;
        Ok(Overlay {
            largest_batch_id: row.largest_batch_id,
            mutation: self.remote.decode_mutation(&row.mutation)?,
        })
    }

    pub fn encode_target(&self, target: &TargetData) -> FirestoreResult<String> {
        let resume_token = match self.remote.encode_bytes(&target.resume_token) {
            JsonValue::String(text) => text,
            _ => String::new(),
        };
        let row = DbTarget {
            target_id: target.target_id,
            canonical_id: target.canonical_id(),
            query: self.remote.encode_persisted_query(&target.target),
            purpose: target.purpose.name().to_string(),
            sequence_number: target.sequence_number,
            snapshot_version: target.snapshot_version.to_rfc3339(),
            last_limbo_free_snapshot_version: target.last_limbo_free_snapshot_version.to_rfc3339(),
            resume_token,
            expected_count: target.expected_count,
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_target(&self, text: &str) -> FirestoreResult<TargetData> {
        let row: DbTarget = serde_json::from_str(text)?;
        let query = self.remote.decode_persisted_query(&row.query)?;
        Ok(TargetData {
            target: query,
            target_id: row.target_id,
            purpose: TargetPurpose::from_name(&row.purpose),
            sequence_number: row.sequence_number,
            snapshot_version: Timestamp::parse_rfc3339(&row.snapshot_version)?,
            last_limbo_free_snapshot_version: Timestamp::parse_rfc3339(
                &row.last_limbo_free_snapshot_version,
            )?,
            resume_token: self
                .remote
                .decode_bytes(Some(&JsonValue::String(row.resume_token)))?,
            expected_count: row.expected_count,
        })
    }

    pub fn encode_named_query(&self, query: &NamedQuery) -> FirestoreResult<String> {
        let row = DbNamedQuery {
            name: query.name.clone(),
            query: self.remote.encode_persisted_query(&query.query),
            read_time: query.read_time.to_rfc3339(),
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_named_query(&self, text: &str) -> FirestoreResult<NamedQuery> {
        let row: DbNamedQuery = serde_json::from_str(text)?;
        Ok(NamedQuery {
            name: row.name,
            query: self.remote.decode_persisted_query(&row.query)?,
            read_time: Timestamp::parse_rfc3339(&row.read_time)?,
        })
    }

    pub fn encode_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<String> {
        let row = DbBundle {
            id: metadata.id.clone(),
            create_time: metadata.create_time.to_rfc3339(),
            version: metadata.version,
        };
        Ok(serde_json::to_string(&row)?)
    }

    pub fn decode_bundle(&self, text: &str) -> FirestoreResult<BundleMetadata> {
        let row: DbBundle = serde_json::from_str(text)?;
        Ok(BundleMetadata {
            id: row.id,
            create_time: Timestamp::parse_rfc3339(&row.create_time)?,
            version: row.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{OrderDirection, Query};
    use crate::firestore::model::{DocumentKey, FieldPath, Mutation};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(DatabaseId::new("p", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn committed_document_keeps_its_flags() {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(1));
        let mut doc = Document::new_found(key("a/1"), Timestamp::new(5, 0), data);
        doc.set_read_time(Timestamp::new(6, 0));
        doc.set_has_committed_mutations();
        let text = serializer().encode_document(&doc).unwrap();
        let decoded = serializer().decode_document(&key("a/1"), &text).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn invalid_documents_are_not_persisted() {
        assert!(serializer()
            .encode_document(&Document::new_invalid(key("a/1")))
            .is_err());
    }

    #[test]
    fn target_keeps_resume_state() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("n").unwrap(), OrderDirection::Descending)
            .limit(3);
        let target = TargetData::new(query, 4, TargetPurpose::ExistenceFilterMismatchBloom, 9)
            .with_resume_token(vec![1, 2, 3], Timestamp::new(7, 1))
            .with_expected_count(2);
        let text = serializer().encode_target(&target).unwrap();
        assert_eq!(serializer().decode_target(&text).unwrap(), target);
    }

    #[test]
    fn batch_preserves_mutation_order() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 500),
            vec![Mutation::delete(key("a/1")), Mutation::set(key("a/2"), MapValue::empty())],
        );
        let text = serializer().encode_mutation_batch(&batch).unwrap();
        assert_eq!(serializer().decode_mutation_batch(&text).unwrap(), batch);
    }
}
