mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod resource_path;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentContents, DocumentMap};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationBatch,
    MutationBatchResult, MutationResult, Overlay, Precondition, TransformOperation, BATCH_ID_UNKNOWN,
};
pub use resource_path::ResourcePath;
pub use timestamp::Timestamp;

/// Identifies a mutation batch. Assigned in increasing order per user.
pub type BatchId = i32;

/// Identifies a listen target.
pub type TargetId = i32;

/// Monotonic counter used to order target and document use for garbage collection.
pub type ListenSequenceNumber = i64;
