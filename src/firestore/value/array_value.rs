use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| value == needle)
    }
}
