//! Boundaries to the systems the session core consumes but does not own.

use async_trait::async_trait;
use log::{debug, info};
use network::media::LocalMedia;
use session_core::{Error, Role, SessionId, SessionIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Identity and role claim issued by the authentication provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: SessionIdentity,
    pub display_name: String,
    pub role: Role,
}

impl Credentials {
    pub fn new(
        identity: impl Into<SessionIdentity>,
        display_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// Durable record of a session, read once at join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// The teacher hosting the session
    pub host: SessionIdentity,
    /// Enrolled participants
    pub roster: Vec<SessionIdentity>,
    pub ended: bool,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, host: impl Into<SessionIdentity>) -> Self {
        Self {
            session_id,
            host: host.into(),
            roster: Vec::new(),
            ended: false,
        }
    }
}

#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    async fn load(&self, session: &SessionId) -> Result<SessionRecord, Error>;

    /// Written once, by the teacher, when the session ends
    async fn mark_ended(&self, session: &SessionId) -> Result<(), Error>;
}

/// In-memory persistence shared by every client of a process
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    records: Arc<Mutex<HashMap<SessionId, SessionRecord>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: SessionRecord) {
        debug!("Storing record for session {}", record.session_id);
        self.records
            .lock()
            .await
            .insert(record.session_id.clone(), record);
    }
}

#[async_trait]
impl PersistenceLayer for MemoryPersistence {
    async fn load(&self, session: &SessionId) -> Result<SessionRecord, Error> {
        self.records
            .lock()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Session {}", session)))
    }

    async fn mark_ended(&self, session: &SessionId) -> Result<(), Error> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(session)
            .ok_or_else(|| Error::NotFound(format!("Session {}", session)))?;
        record.ended = true;
        info!("Session {} marked ended", session);
        Ok(())
    }
}

/// Local audio/video acquisition.
///
/// `acquire` may wait indefinitely for the user to answer a permission
/// prompt. A refusal is `Error::PermissionDenied`.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, Error>;
}

/// Camera and microphone tracks fed by the embedding application
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMediaSource;

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, Error> {
        Ok(LocalMedia::camera_and_microphone())
    }
}
