use std::fmt;

/// The principal whose writes and cache the engine is operating on.
///
/// Mutation queues are partitioned by [`User::storage_key`], so switching
/// users switches the set of pending writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
    is_anonymous: bool,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            is_anonymous: false,
        }
    }

    pub fn anonymous(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            is_anonymous: true,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    pub fn is_anonymous(&self) -> bool {
        self.is_anonymous
    }

    /// Key used to partition per-user persisted state. Empty when signed out.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "<unauthenticated>"),
        }
    }
}
