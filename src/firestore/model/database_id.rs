use crate::app::AppOptions;
use crate::firestore::error::{invalid_argument, missing_project_id, FirestoreResult};
use crate::firestore::model::ResourcePath;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn from_options(options: &AppOptions) -> FirestoreResult<Self> {
        let project_id = options.project_id.clone().ok_or_else(missing_project_id)?;
        let database = options
            .database_id
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE_ID.to_string());
        Ok(Self::new(project_id, database))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Prefix under which document names live on the wire.
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    /// Fully qualified name of a document or collection path.
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    /// Strips the database prefix from a fully qualified name.
    pub fn relative_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in database {root}")))?;
        ResourcePath::from_string(relative.trim_start_matches('/'))
    }

    /// Directory-safe identifier used to name on-disk caches.
    pub fn persistence_key(&self) -> String {
        format!("{}.{}", self.project_id, self.database)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}
