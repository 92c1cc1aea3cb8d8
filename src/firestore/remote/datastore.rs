use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::CredentialsProvider;
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream};
use crate::util::backoff::BackoffConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "watch",
            StreamKind::Write => "write",
        }
    }
}

/// First frame of every logical stream: what it is for and on whose behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

/// Reconnect and idle policy shared by the watch and write streams.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// A stream with nothing to do is closed after this long.
    pub idle_timeout: Duration,
    /// An open stream that has not produced a message within this window is
    /// torn down and reopened.
    pub health_check_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
        }
    }
}

impl RetrySettings {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            backoff_factor: self.multiplier,
            max_delay: self.max_delay,
        }
    }
}

/// Opens authenticated logical streams to the backend over a shared
/// multiplexed connection.
pub struct Datastore {
    connection: Arc<MultiplexedConnection>,
    credentials: Arc<dyn CredentialsProvider>,
    serializer: JsonProtoSerializer,
    terminated: AtomicBool,
}

impl Datastore {
    pub fn new(
        connection: Arc<MultiplexedConnection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            connection,
            credentials,
            serializer,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub async fn fetch_token(&self) -> FirestoreResult<Option<String>> {
        self.ensure_running()?;
        Ok(self.credentials.get_token().await?)
    }

    pub fn invalidate_token(&self) {
        self.credentials.invalidate_token();
    }

    pub async fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<String>,
    ) -> FirestoreResult<MultiplexedStream> {
        self.ensure_running()?;
        let header = StreamHeader {
            kind,
            database: self.serializer.database_name(),
            authorization: token.map(|token| format!("Bearer {token}")),
        };
        self.connection.open_stream(serde_json::to_vec(&header)?).await
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition("the client has already been terminated"));
        }
        Ok(())
    }
}
