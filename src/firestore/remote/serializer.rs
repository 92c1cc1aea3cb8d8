use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::core::query::{
    Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, Mutation,
    MutationResult, Precondition, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between model types and the JSON shapes used on the wire and in
/// persisted rows.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

/// Decoded body of a write-stream response.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Timestamp,
    pub write_results: Vec<MutationResult>,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.resource_name(key.path())
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.database_id.relative_path(name)?)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    /// Decodes the `fields` member of a document or map value.
    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> JsonValue {
        JsonValue::String(timestamp.to_rfc3339())
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        Timestamp::parse_rfc3339(value)
    }

    /// Reads an optional timestamp member, defaulting to the minimum version.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<Timestamp> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Timestamp::parse_rfc3339(text),
            None => Ok(Timestamp::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> JsonValue {
        JsonValue::String(BASE64_STANDARD.encode(bytes))
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => BASE64_STANDARD
                .decode(text)
                .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    pub fn encode_document(&self, key: &DocumentKey, fields: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(fields),
        })
    }

    /// Decodes a `{name, fields, updateTime, createTime}` document.
    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document is missing its name"))?;
        let key = self.document_key_from_name(name)?;
        let fields = decode_map_value(value)?;
        let version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument("found document is missing its updateTime"));
        }
        let create_time = value
            .get("createTime")
            .and_then(JsonValue::as_str)
            .map(Timestamp::parse_rfc3339)
            .transpose()?;
        let mut document = Document::new_found(key, version, fields);
        document.set_create_time(create_time);
        Ok(document)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set {
                key,
                value,
                field_transforms,
                ..
            } => {
                write.insert("update".into(), self.encode_document(key, value));
                self.insert_transforms(&mut write, field_transforms);
            }
            Mutation::Patch {
                key,
                value,
                mask,
                field_transforms,
                ..
            } => {
                write.insert("update".into(), self.encode_document(key, value));
                let paths: Vec<String> = mask.fields().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
                self.insert_transforms(&mut write, field_transforms);
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".into(), JsonValue::String(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".into(), JsonValue::String(self.document_name(key)));
            }
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => self.decode_precondition(current)?,
            None => Precondition::None,
        };
        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write is missing the document name"))?;
            let key = self.document_key_from_name(name)?;
            let fields = decode_map_value(update)?;
            let field_transforms = match value.get("updateTransforms").and_then(JsonValue::as_array)
            {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_field_transform(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(match value.get("updateMask") {
                Some(mask) => {
                    let paths = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(|paths| {
                            paths
                                .iter()
                                .filter_map(JsonValue::as_str)
                                .map(FieldPath::from_dot_separated)
                                .collect::<FirestoreResult<Vec<_>>>()
                        })
                        .transpose()?
                        .unwrap_or_default();
                    Mutation::Patch {
                        key,
                        value: fields,
                        mask: FieldMask::new(paths),
                        precondition,
                        field_transforms,
                    }
                }
                None => Mutation::Set {
                    key,
                    value: fields,
                    precondition,
                    field_transforms,
                },
            });
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::Delete {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::Verify {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }
        Err(invalid_argument("unknown write type"))
    }

    fn insert_transforms(&self, write: &mut JsonMap<String, JsonValue>, transforms: &[FieldTransform]) {
        if transforms.is_empty() {
            return;
        }
        let encoded: Vec<JsonValue> = transforms
            .iter()
            .map(|transform| self.encode_field_transform(transform))
            .collect();
        write.insert("updateTransforms".into(), JsonValue::Array(encoded));
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform is missing fieldPath"))?;
        let field_path = FieldPath::from_dot_separated(field_path)?;
        let array_values = |member: &JsonValue| -> FirestoreResult<Vec<FirestoreValue>> {
            member
                .get("values")
                .and_then(JsonValue::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(member) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(array_values(member)?)
        } else if let Some(member) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(array_values(member)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument("unknown field transform"));
        };
        Ok(FieldTransform::new(field_path, operation))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(time) => Some(json!({ "updateTime": time.to_rfc3339() })),
        }
    }

    fn decode_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if let Some(update_time) = value.get("updateTime").and_then(JsonValue::as_str) {
            return Ok(Precondition::UpdateTime(Timestamp::parse_rfc3339(update_time)?));
        }
        Ok(Precondition::None)
    }

    /// Encodes the `query` or `documents` member of a listen target as sent
    /// to the server. Limit-to-last queries are sent with their ordering and
    /// cursors flipped.
    pub fn encode_query_target(&self, query: &Query) -> JsonValue {
        if let Some(key) = query.document_key() {
            return json!({ "documents": { "documents": [self.document_name(&key)] } });
        }
        json!({ "query": self.encode_structured_query(query, true) })
    }

    /// Encodes a query for local storage, preserving it exactly.
    pub fn encode_persisted_query(&self, query: &Query) -> JsonValue {
        let mut encoded = self.encode_structured_query(query, false);
        if let JsonValue::Object(object) = &mut encoded {
            let limit_type = match query.limit_type() {
                LimitType::First => "FIRST",
                LimitType::Last => "LAST",
            };
            object.insert("limitType".into(), JsonValue::String(limit_type.into()));
        }
        encoded
    }

    fn encode_structured_query(&self, query: &Query, for_wire: bool) -> JsonValue {
        let (parent, collection_id, all_descendants) = match query.collection_group_id() {
            Some(group) => (query.path().clone(), group.to_string(), true),
            None => (
                query.path().without_last(),
                query.path().last_segment().unwrap_or_default().to_string(),
                false,
            ),
        };
        let flip = for_wire && query.limit_type() == LimitType::Last;
        let mut structured = JsonMap::new();
        structured.insert(
            "from".into(),
            json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
        );

        let filters: Vec<JsonValue> = query
            .filters()
            .iter()
            .map(|filter| {
                json!({
                    "fieldFilter": {
                        "field": { "fieldPath": filter.field().canonical_string() },
                        "op": operator_name(filter.operator()),
                        "value": encode_value(filter.value()),
                    }
                })
            })
            .collect();
        match filters.len() {
            0 => {}
            1 => {
                structured.insert("where".into(), filters.into_iter().next().unwrap_or_default());
            }
            _ => {
                structured.insert(
                    "where".into(),
                    json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
                );
            }
        }

        let order_by = if for_wire {
            query.normalized_order_by()
        } else {
            query.explicit_order_by().to_vec()
        };
        if !order_by.is_empty() {
            let encoded: Vec<JsonValue> = order_by
                .iter()
                .map(|order| {
                    let direction = match (order.direction(), flip) {
                        (OrderDirection::Ascending, false) | (OrderDirection::Descending, true) => {
                            "ASCENDING"
                        }
                        _ => "DESCENDING",
                    };
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": direction,
                    })
                })
                .collect();
            structured.insert("orderBy".into(), JsonValue::Array(encoded));
        }

        if let Some(limit) = query.limit_value() {
            structured.insert("limit".into(), json!(limit));
        }

        let (start, end) = if flip {
            (query.end_bound(), query.start_bound())
        } else {
            (query.start_bound(), query.end_bound())
        };
        if let Some(bound) = start {
            structured.insert("startAt".into(), encode_cursor(bound, bound.inclusive()));
        }
        if let Some(bound) = end {
            structured.insert("endAt".into(), encode_cursor(bound, !bound.inclusive()));
        }

        json!({
            "parent": self.database_id.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    /// Decodes a target written by [`encode_persisted_query`](Self::encode_persisted_query)
    /// or a `documents` target.
    pub fn decode_persisted_query(&self, value: &JsonValue) -> FirestoreResult<Query> {
        if let Some(documents) = value.get("documents") {
            let name = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .and_then(|names| names.first())
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("documents target needs exactly one name"))?;
            return Ok(Query::document(&self.document_key_from_name(name)?));
        }

        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("query target is missing its parent"))?;
        let parent = self.database_id.relative_path(parent)?;
        let structured = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("query target is missing structuredQuery"))?;

        let from = structured
            .get("from")
            .and_then(JsonValue::as_array)
            .and_then(|from| from.first())
            .ok_or_else(|| invalid_argument("structuredQuery needs one collection selector"))?;
        let collection_id = from
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let all_descendants = from
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let (path, collection_group) = if all_descendants {
            (parent, Some(collection_id))
        } else {
            (parent.child([collection_id]), None)
        };

        let mut filters = Vec::new();
        if let Some(filter) = structured.get("where") {
            self.decode_filter(filter, &mut filters)?;
        }

        let mut order_by = Vec::new();
        if let Some(entries) = structured.get("orderBy").and_then(JsonValue::as_array) {
            for entry in entries {
                let field = entry
                    .get("field")
                    .and_then(|field| field.get("fieldPath"))
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid_argument("orderBy entry is missing its field"))?;
                let direction = match entry.get("direction").and_then(JsonValue::as_str) {
                    Some("DESCENDING") => OrderDirection::Descending,
                    _ => OrderDirection::Ascending,
                };
                order_by.push(OrderBy::new(FieldPath::from_dot_separated(field)?, direction));
            }
        }

        let limit = structured
            .get("limit")
            .and_then(JsonValue::as_u64)
            .map(|limit| limit as u32);
        let limit_type = match value.get("limitType").and_then(JsonValue::as_str) {
            Some("LAST") => LimitType::Last,
            _ => LimitType::First,
        };
        let start_at = structured
            .get("startAt")
            .map(|cursor| decode_cursor(cursor, false))
            .transpose()?;
        let end_at = structured
            .get("endAt")
            .map(|cursor| decode_cursor(cursor, true))
            .transpose()?;

        Ok(Query::from_parts(
            path,
            collection_group,
            filters,
            order_by,
            limit,
            limit_type,
            start_at,
            end_at,
        ))
    }

    fn decode_filter(&self, value: &JsonValue, out: &mut Vec<FieldFilter>) -> FirestoreResult<()> {
        if let Some(composite) = value.get("compositeFilter") {
            if let Some(filters) = composite.get("filters").and_then(JsonValue::as_array) {
                for filter in filters {
                    self.decode_filter(filter, out)?;
                }
            }
            return Ok(());
        }
        let field_filter = value
            .get("fieldFilter")
            .ok_or_else(|| invalid_argument("unsupported filter"))?;
        let field = field_filter
            .get("field")
            .and_then(|field| field.get("fieldPath"))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field filter is missing its field"))?;
        let operator = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .and_then(operator_from_name)
            .ok_or_else(|| invalid_argument("field filter has an unknown operator"))?;
        let operand = field_filter
            .get("value")
            .ok_or_else(|| invalid_argument("field filter is missing its value"))?;
        out.push(FieldFilter::new(
            FieldPath::from_dot_separated(field)?,
            operator,
            decode_value(operand)?,
        )?);
        Ok(())
    }

    /// Body of an `addTarget` listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut target = match self.encode_query_target(&target_data.target) {
            JsonValue::Object(object) => object,
            _ => JsonMap::new(),
        };
        target.insert("targetId".into(), json!(target_data.target_id));
        if !target_data.resume_token.is_empty() {
            target.insert("resumeToken".into(), self.encode_bytes(&target_data.resume_token));
            if let Some(count) = target_data.expected_count {
                target.insert("expectedCount".into(), json!(count));
            }
        } else if !target_data.snapshot_version.is_min() {
            target.insert(
                "readTime".into(),
                self.encode_timestamp(&target_data.snapshot_version),
            );
            if let Some(count) = target_data.expected_count {
                target.insert("expectedCount".into(), json!(count));
            }
        }
        JsonValue::Object(target)
    }

    pub fn encode_listen_labels(&self, purpose: TargetPurpose) -> Option<JsonValue> {
        let tag = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(json!({ "goog-listen-tags": tag }))
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = self.decode_bytes(value.get("streamToken"))?;
        let commit_version = self.decode_version(value.get("commitTime"))?;
        let write_results = match value.get("writeResults").and_then(JsonValue::as_array) {
            Some(results) => results
                .iter()
                .map(|result| {
                    let mut version = self.decode_version(result.get("updateTime"))?;
                    if version.is_min() {
                        version = commit_version;
                    }
                    let transform_results = match result
                        .get("transformResults")
                        .and_then(JsonValue::as_array)
                    {
                        Some(values) => values
                            .iter()
                            .map(decode_value)
                            .collect::<FirestoreResult<Vec<_>>>()?,
                        None => Vec::new(),
                    };
                    Ok(MutationResult {
                        version,
                        transform_results,
                    })
                })
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }
}

fn encode_cursor(bound: &Bound, before: bool) -> JsonValue {
    json!({
        "values": bound.values().iter().map(encode_value).collect::<Vec<_>>(),
        "before": before,
    })
}

fn decode_cursor(value: &JsonValue, is_end: bool) -> FirestoreResult<Bound> {
    let values = value
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
    let inclusive = if is_end { !before } else { before };
    Ok(Bound::new(values, inclusive))
}

fn operator_name(operator: FilterOperator) -> &'static str {
    match operator {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn operator_from_name(name: &str) -> Option<FilterOperator> {
    Some(match name {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "IN" => FilterOperator::In,
        "NOT_IN" => FilterOperator::NotIn,
        _ => return None,
    })
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = JsonMap::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else {
                // JSON numbers cannot carry NaN or infinities.
                json!({ "doubleValue": double.to_string() })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
        ValueKind::Sentinel(_) => {
            // Sentinels are turned into transforms before a write is queued.
            log::warn!("sentinel value reached the serializer; encoding as null");
            json!({ "nullValue": JsonValue::Null })
        }
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::parse_rfc3339(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            latitude, longitude,
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        return Ok(FirestoreValue::from_map(map.into_fields()));
    }

    Err(invalid_argument("Unknown value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::ListenSequenceNumber;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn patch_with_transforms_survives_storage() {
        let mut value = MapValue::empty();
        value.set(&field("a.b"), FirestoreValue::from_integer(1));
        let mutation = Mutation::Patch {
            key: key("rooms/r1"),
            value,
            mask: FieldMask::new([field("a.b")]),
            precondition: Precondition::Exists(true),
            field_transforms: vec![
                FieldTransform::new(field("ts"), TransformOperation::ServerTimestamp),
                FieldTransform::new(
                    field("n"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
                ),
            ],
        };
        let serializer = serializer();
        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(encoded["currentDocument"]["exists"], json!(true));
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["a.b"]));
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn delete_encodes_document_name() {
        let encoded = serializer().encode_mutation(&Mutation::delete(key("rooms/r1")));
        assert_eq!(
            encoded["delete"],
            json!("projects/project/databases/(default)/documents/rooms/r1")
        );
        assert!(encoded.get("currentDocument").is_none());
    }

    #[test]
    fn limit_to_last_is_flipped_on_the_wire() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(field("age"), OrderDirection::Ascending)
            .start_at(Bound::new(vec![FirestoreValue::from_integer(1)], true))
            .limit_to_last(2)
            .unwrap();
        let encoded = serializer().encode_query_target(&query);
        let structured = &encoded["query"]["structuredQuery"];
        assert_eq!(structured["orderBy"][0]["direction"], json!("DESCENDING"));
        assert_eq!(structured["orderBy"][1]["field"]["fieldPath"], json!("__name__"));
        assert!(structured.get("startAt").is_none());
        assert_eq!(structured["endAt"]["before"], json!(false));
        assert_eq!(encoded["query"]["parent"], json!("projects/project/databases/(default)/documents"));
    }

    #[test]
    fn persisted_queries_keep_their_identity() {
        let serializer = serializer();
        let query = Query::collection_group("messages")
            .unwrap()
            .filter(field("score"), FilterOperator::GreaterThan, FirestoreValue::from_integer(3))
            .unwrap()
            .filter(field("tag"), FilterOperator::Equal, FirestoreValue::from_string("x"))
            .unwrap()
            .end_at(Bound::new(vec![FirestoreValue::from_integer(9)], false))
            .limit(5);
        let decoded = serializer
            .decode_persisted_query(&serializer.encode_persisted_query(&query))
            .unwrap();
        assert_eq!(decoded.canonical_id(), query.canonical_id());

        let doc_query = Query::document(&key("rooms/r1"));
        let encoded = serializer.encode_query_target(&doc_query);
        let decoded = serializer.decode_persisted_query(&encoded).unwrap();
        assert_eq!(decoded.document_key(), Some(key("rooms/r1")));
    }

    #[test]
    fn target_prefers_resume_token_over_read_time() {
        let serializer = serializer();
        let mut target = TargetData::new(
            Query::collection("rooms").unwrap(),
            4,
            TargetPurpose::ExistenceFilterMismatchBloom,
            1 as ListenSequenceNumber,
        );
        target.snapshot_version = Timestamp::new(10, 0);
        let encoded = serializer.encode_target(&target);
        assert_eq!(encoded["targetId"], json!(4));
        assert!(encoded.get("readTime").is_some());

        target.resume_token = vec![1, 2];
        target.expected_count = Some(3);
        let encoded = serializer.encode_target(&target);
        assert_eq!(encoded["resumeToken"], json!("AQI="));
        assert_eq!(encoded["expectedCount"], json!(3));
        assert!(encoded.get("readTime").is_none());
        assert_eq!(
            serializer.encode_listen_labels(target.purpose),
            Some(json!({"goog-listen-tags": "existence-filter-mismatch-bloom"}))
        );
    }

    #[test]
    fn write_results_default_to_commit_time() {
        let response = serializer()
            .decode_write_response(&json!({
                "streamToken": "AQ==",
                "commitTime": "2024-01-01T00:00:05Z",
                "writeResults": [
                    {},
                    {"updateTime": "2024-01-01T00:00:01Z", "transformResults": [{"integerValue": "7"}]}
                ]
            }))
            .unwrap();
        assert_eq!(response.stream_token, vec![1]);
        assert_eq!(response.write_results[0].version, response.commit_version);
        assert_eq!(
            response.write_results[1].transform_results,
            vec![FirestoreValue::from_integer(7)]
        );
    }

    #[test]
    fn non_finite_doubles_survive() {
        let encoded = encode_value(&FirestoreValue::from_double(f64::INFINITY));
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(decoded, FirestoreValue::from_double(f64::INFINITY));
    }
}
