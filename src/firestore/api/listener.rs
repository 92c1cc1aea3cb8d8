use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::firestore::core::event_manager::QueryListener;
use crate::firestore::core::firestore_client::FirestoreClient;

/// Keeps a snapshot listener attached. Call [`remove`](Self::remove) or drop
/// the registration to stop receiving events.
pub struct ListenerRegistration {
    client: Weak<FirestoreClient>,
    listener: Arc<QueryListener>,
    removed: AtomicBool,
}

impl ListenerRegistration {
    pub(crate) fn new(client: &Arc<FirestoreClient>, listener: Arc<QueryListener>) -> Self {
        Self {
            client: Arc::downgrade(client),
            listener,
            removed: AtomicBool::new(false),
        }
    }

    /// Detaches the listener. Further calls are no-ops.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if client.is_terminated() {
            return;
        }
        client.unlisten(Arc::clone(&self.listener));
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("listener", &self.listener.id())
            .field("removed", &self.is_removed())
            .finish()
    }
}
