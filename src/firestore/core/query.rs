use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let needs_array = matches!(
            operator,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "'{}' filters require an array value",
                operator.as_str()
            )));
        }
        if value.is_sentinel() {
            return Err(invalid_argument("Sentinel values cannot be used in filters"));
        }
        Ok(Self { field, operator, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let Some(value) = field_value(doc, &self.field) else {
            return false;
        };
        let value = &value;
        match self.operator {
            FilterOperator::Equal => same_type(value, &self.value) && value.compare(&self.value) == Ordering::Equal,
            FilterOperator::NotEqual => {
                !matches!(value.kind(), ValueKind::Null) && value.compare(&self.value) != Ordering::Equal
            }
            FilterOperator::LessThan => same_type(value, &self.value) && value.compare(&self.value) == Ordering::Less,
            FilterOperator::LessThanOrEqual => {
                same_type(value, &self.value) && value.compare(&self.value) != Ordering::Greater
            }
            FilterOperator::GreaterThan => {
                same_type(value, &self.value) && value.compare(&self.value) == Ordering::Greater
            }
            FilterOperator::GreaterThanOrEqual => {
                same_type(value, &self.value) && value.compare(&self.value) != Ordering::Less
            }
            FilterOperator::ArrayContains => value
                .as_array()
                .map(|array| array.values().iter().any(|v| v.compare(&self.value) == Ordering::Equal))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (value.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => needles
                    .values()
                    .iter()
                    .any(|needle| array.values().iter().any(|v| v.compare(needle) == Ordering::Equal)),
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .map(|list| list.values().iter().any(|v| v.compare(value) == Ordering::Equal && same_type(v, value)))
                .unwrap_or(false),
            FilterOperator::NotIn => {
                !matches!(value.kind(), ValueKind::Null)
                    && self
                        .value
                        .as_array()
                        .map(|list| list.values().iter().all(|v| v.compare(value) != Ordering::Equal))
                        .unwrap_or(false)
            }
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}{}", self.field.canonical_string(), self.operator.as_str(), canonical_value(&self.value))
    }
}

/// Numbers compare across integer and double; every other pairing must share a type.
fn same_type(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    (left.is_number() && right.is_number()) || std::mem::discriminant(left.kind()) == std::mem::discriminant(right.kind())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (field_value(left, &self.field), field_value(right, &self.field)) {
                (Some(l), Some(r)) => l.compare(&r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A cursor position expressed as values for the query's order-by fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to(&self, doc: &Document, order_by: &[OrderBy]) -> Ordering {
        for (order, bound_value) in order_by.iter().zip(self.values.iter()) {
            let ordering = if order.field.is_key_field() {
                match bound_value.kind() {
                    ValueKind::Reference(path) | ValueKind::String(path) => DocumentKey::from_string(path)
                        .map(|key| doc.key().cmp(&key))
                        .unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            } else {
                field_value(doc, &order.field)
                    .unwrap_or_else(FirestoreValue::null)
                    .compare(bound_value)
            };
            let ordering = match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// A query over a collection, a collection group, or a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for every document in a collection (or a single document when
    /// `path` has an even number of segments).
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Rebuilds a query from already-validated parts, as read back from storage.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        explicit_order_by: Vec<OrderBy>,
        limit: Option<u32>,
        limit_type: LimitType,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            explicit_order_by,
            limit,
            limit_type,
            start_at,
            end_at,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 != 1 {
            return Err(invalid_argument(format!(
                "Collection paths must have an odd number of segments: '{path}'"
            )));
        }
        Ok(Self::at_path(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument("Collection group ids must be a single non-empty segment"));
        }
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn filter(mut self, field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        let filter = FieldFilter::new(field, operator, value)?;
        if operator.is_inequality() {
            if let Some(existing) = self.inequality_field() {
                if existing != filter.field() {
                    return Err(invalid_argument(format!(
                        "Inequality filters on '{}' and '{}' cannot be combined",
                        existing,
                        filter.field()
                    )));
                }
            }
        }
        self.filters.push(filter);
        Ok(self)
    }

    pub fn order_by(mut self, field: FieldPath, direction: OrderDirection) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> FirestoreResult<Self> {
        if self.explicit_order_by.is_empty() {
            return Err(invalid_argument("limit_to_last() queries require an explicit order_by"));
        }
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        Ok(self)
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn document_key(&self) -> Option<DocumentKey> {
        if self.is_document_query() {
            DocumentKey::from_path(self.path.clone()).ok()
        } else {
            None
        }
    }

    fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.operator.is_inequality())
            .map(|filter| &filter.field)
    }

    /// Explicit ordering, led by the inequality field when none is given and
    /// always terminated by the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.inequality_field() {
                if !field.is_key_field() {
                    order_by.push(OrderBy::new(field.clone(), OrderDirection::Ascending));
                }
            }
        }
        if !order_by.iter().any(|order| order.field.is_key_field()) {
            let direction = order_by
                .last()
                .map(|order| order.direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    /// Stable textual identity. Equal queries share one listen target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in self.normalized_order_by() {
            let dir = match order.direction {
                OrderDirection::Ascending => "asc",
                OrderDirection::Descending => "desc",
            };
            let _ = write!(id, "{}{}", order.field.canonical_string(), dir);
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
            if self.limit_type == LimitType::Last {
                id.push_str("|lt:l");
            }
        }
        for (label, bound) in [("lb", &self.start_at), ("ub", &self.end_at)] {
            if let Some(bound) = bound {
                let _ = write!(id, "|{label}:{}", if bound.inclusive { "b:" } else { "a:" });
                for value in &bound.values {
                    id.push_str(&canonical_value(value));
                }
            }
        }
        id
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_found()
            && self.matches_path(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        if let Some(group) = &self.collection_group {
            return key.has_collection_id(group) && self.path.is_prefix_of(key.path());
        }
        if DocumentKey::is_document_path(&self.path) {
            return &self.path == key.path();
        }
        self.path.is_immediate_parent_of(key.path())
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .filter(|order| !order.field.is_key_field())
            .all(|order| doc.field(&order.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            let ordering = bound.compare_to(doc, &order_by);
            if ordering == Ordering::Less || (!bound.inclusive && ordering == Ordering::Equal) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            let ordering = bound.compare_to(doc, &order_by);
            if ordering == Ordering::Greater || (!bound.inclusive && ordering == Ordering::Equal) {
                return false;
            }
        }
        true
    }

    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Filters, sorts and limits a candidate set.
    pub fn apply_to_documents<I>(&self, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut results: Vec<Document> = documents.into_iter().filter(|doc| self.matches(doc)).collect();
        results.sort_by(|l, r| self.compare_documents(l, r));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if results.len() > limit {
                match self.limit_type {
                    LimitType::First => results.truncate(limit),
                    LimitType::Last => {
                        results.drain(0..results.len() - limit);
                    }
                }
            }
        }
        results
    }
}

fn field_value(doc: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(doc.key().path().canonical_string()));
    }
    doc.field(field).cloned()
}

fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => format!("{d:?}"),
        ValueKind::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => {
            let items: Vec<String> = array.values().iter().map(canonical_value).collect();
            format!("[{}]", items.join(","))
        }
        ValueKind::Map(map) => {
            let items: Vec<String> = map
                .fields()
                .iter()
                .map(|(k, v)| format!("{k}:{}", canonical_value(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        ValueKind::Sentinel(_) => "sentinel".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::MapValue;

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (name, value) in fields {
            data.set(&FieldPath::from_dot_separated(name).unwrap(), value.clone());
        }
        Document::new_found(DocumentKey::from_string(path).unwrap(), Timestamp::new(1, 0), data)
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    #[test]
    fn applies_limit_and_ordering() {
        let query = Query::collection("cities")
            .unwrap()
            .order_by(field("population"), OrderDirection::Ascending)
            .limit(2);
        let docs = vec![
            doc("cities/sf", &[("population", FirestoreValue::from_integer(100))]),
            doc("cities/nyc", &[("population", FirestoreValue::from_integer(50))]),
            doc("cities/la", &[("population", FirestoreValue::from_integer(75))]),
        ];
        let result = query.apply_to_documents(docs);
        let ids: Vec<&str> = result.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["nyc", "la"]);
    }

    #[test]
    fn limit_to_last_keeps_tail() {
        let query = Query::collection("cities")
            .unwrap()
            .order_by(field("population"), OrderDirection::Ascending)
            .limit_to_last(1)
            .unwrap();
        let docs = vec![
            doc("cities/sf", &[("population", FirestoreValue::from_integer(100))]),
            doc("cities/nyc", &[("population", FirestoreValue::from_integer(50))]),
        ];
        let result = query.apply_to_documents(docs);
        assert_eq!(result[0].key().id(), "sf");
    }

    #[test]
    fn filters_match_by_type() {
        let query = Query::collection("c")
            .unwrap()
            .filter(field("n"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1))
            .unwrap();
        assert!(query.matches(&doc("c/a", &[("n", FirestoreValue::from_double(1.5))])));
        assert!(!query.matches(&doc("c/b", &[("n", FirestoreValue::from_string("z"))])));
        assert!(!query.matches(&doc("c/c", &[])));
        assert!(!query.matches(&doc("other/c", &[("n", FirestoreValue::from_integer(5))])));
    }

    #[test]
    fn array_and_membership_filters() {
        let tags = FirestoreValue::from_array(vec![FirestoreValue::from_string("a"), FirestoreValue::from_string("b")]);
        let d = doc("c/x", &[("tags", tags), ("n", FirestoreValue::from_integer(3))]);
        let contains = Query::collection("c")
            .unwrap()
            .filter(field("tags"), FilterOperator::ArrayContains, FirestoreValue::from_string("b"))
            .unwrap();
        assert!(contains.matches(&d));
        let in_query = Query::collection("c")
            .unwrap()
            .filter(
                field("n"),
                FilterOperator::In,
                FirestoreValue::from_array(vec![FirestoreValue::from_integer(3)]),
            )
            .unwrap();
        assert!(in_query.matches(&d));
        let not_in = Query::collection("c")
            .unwrap()
            .filter(
                field("n"),
                FilterOperator::NotIn,
                FirestoreValue::from_array(vec![FirestoreValue::from_integer(3)]),
            )
            .unwrap();
        assert!(!not_in.matches(&d));
        assert!(FieldFilter::new(field("n"), FilterOperator::In, FirestoreValue::from_integer(1)).is_err());
    }

    #[test]
    fn canonical_id_is_stable_and_distinct() {
        let a = Query::collection("c").unwrap().limit(5);
        let b = Query::collection("c").unwrap().limit(5);
        let c = Query::collection("c").unwrap().limit(6);
        assert_eq!(a.canonical_id(), b.canonical_id());
        assert_ne!(a.canonical_id(), c.canonical_id());
        assert_eq!(
            Query::collection("c").unwrap().canonical_id(),
            Query::collection("c")
                .unwrap()
                .order_by(FieldPath::document_id(), OrderDirection::Ascending)
                .canonical_id()
        );
    }

    #[test]
    fn document_and_group_queries() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let query = Query::document(&key);
        assert!(query.is_document_query());
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/b", &[])));

        let group = Query::collection_group("messages").unwrap();
        assert!(group.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!group.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn bounds_restrict_results() {
        let query = Query::collection("c")
            .unwrap()
            .order_by(field("n"), OrderDirection::Ascending)
            .start_at(Bound::new(vec![FirestoreValue::from_integer(2)], false));
        assert!(!query.matches(&doc("c/a", &[("n", FirestoreValue::from_integer(2))])));
        assert!(query.matches(&doc("c/b", &[("n", FirestoreValue::from_integer(3))])));
    }

    #[test]
    fn rejects_multiple_inequality_fields() {
        let err = Query::collection("c")
            .unwrap()
            .filter(field("a"), FilterOperator::LessThan, FirestoreValue::from_integer(1))
            .unwrap()
            .filter(field("b"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
