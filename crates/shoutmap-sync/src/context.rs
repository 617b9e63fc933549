//! The shared sync context.
//!
//! Created once at startup and handed to every store. It owns the channel
//! registry and the invalidation bus so there is exactly one of each per
//! signed-in session.

use std::sync::Arc;

use shoutmap_backend::{Backend, MEDIA_BUCKET, RealtimeTransport};
use tracing::info;

use crate::{ChannelRegistry, InvalidationBus, InvalidationHandle, SyncConfig, SyncError};

pub struct SyncContext {
    backend: Arc<dyn Backend>,
    registry: Arc<ChannelRegistry>,
    bus: Arc<InvalidationBus>,
    viewer: Option<String>,
    config: SyncConfig,
}

impl SyncContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn RealtimeTransport>,
        viewer: Option<String>,
    ) -> Arc<Self> {
        Self::with_config(backend, transport, viewer, SyncConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn RealtimeTransport>,
        viewer: Option<String>,
        config: SyncConfig,
    ) -> Arc<Self> {
        info!(viewer = ?viewer, "sync context created");
        Arc::new(Self {
            backend,
            registry: ChannelRegistry::new(transport),
            bus: InvalidationBus::new(),
            viewer,
            config,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    /// Handle for registering and triggering refetch callbacks.
    pub fn invalidation(&self) -> InvalidationHandle {
        InvalidationHandle::new(Arc::clone(&self.bus))
    }

    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    /// The signed-in viewer, or [`SyncError::NotSignedIn`].
    pub fn require_viewer(&self) -> Result<&str, SyncError> {
        self.viewer().ok_or(SyncError::NotSignedIn)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Upload media for a shout or event and return its public URL.
    ///
    /// Objects are stored under the viewer's id so storage policies can
    /// scope writes per user.
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload_media(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SyncError> {
        let viewer = self.require_viewer()?;
        if bytes.is_empty() {
            return Err(SyncError::Rejected("empty upload".to_string()));
        }
        let path = format!("{}/{}-{}", viewer, uuid::Uuid::new_v4(), file_name);
        let url = self
            .backend
            .upload(MEDIA_BUCKET, &path, bytes, content_type)
            .await?;
        info!(path = %path, "uploaded media");
        Ok(url)
    }
}
