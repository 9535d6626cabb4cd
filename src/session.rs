//! Session lifecycle and single-writer arbitration.
//!
//! A session binds one video to one engine state. Sessions live in an
//! explicit registry keyed by id; every operation takes the session as a
//! parameter, so multiple concurrent sessions are safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::engine::{MemoryOffload, SegmentationEngine};
use crate::error::{Error, Result};
use crate::frames::{FrameSource, ImageDirSource, VideoProperties};
use crate::masks::MaskBuffer;

pub type SessionId = Uuid;

/// One annotation workflow instance: the bound video, the engine handle and
/// the accumulated masks.
pub struct Session {
    id: SessionId,
    video_path: PathBuf,
    props: VideoProperties,
    source: Arc<dyn FrameSource>,
    engine: Mutex<Box<dyn SegmentationEngine>>,
    masks: Mutex<MaskBuffer>,
    busy: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The engine and frame source are trait objects that don't implement
        // Debug; show the plain identifying fields instead.
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("video_path", &self.video_path)
            .field("props", &self.props)
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    pub fn properties(&self) -> VideoProperties {
        self.props
    }

    pub fn frame_source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn masks(&self) -> MutexGuard<'_, MaskBuffer> {
        self.masks.lock()
    }

    pub(crate) fn engine(&self) -> MutexGuard<'_, Box<dyn SegmentationEngine>> {
        self.engine.lock()
    }

    /// Whether a propagation is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Claim the single propagation slot, failing `SessionBusy` if another
    /// propagation or submission holds it. The slot is released when the
    /// returned guard drops.
    pub fn try_begin(self: &Arc<Self>) -> Result<BusyGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SessionBusy);
        }
        Ok(BusyGuard {
            session: Arc::clone(self),
        })
    }

    /// Discard accumulated masks and reinitialize the engine state, keeping
    /// the video binding.
    ///
    /// Blocks until any in-flight propagation has released the engine; to
    /// abandon one first, drop its event receiver and let the worker notice.
    pub fn reset(&self) -> Result<()> {
        tracing::info!("Resetting session {}", self.id);
        let mut engine = self.engine.lock();
        engine.abort_propagation();
        engine.reset()?;
        self.masks.lock().clear();
        Ok(())
    }
}

/// RAII claim on a session's propagation slot.
pub struct BusyGuard {
    session: Arc<Session>,
}

impl BusyGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::SeqCst);
    }
}

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session over a frame directory, probing the video and binding
    /// the engine. Fails `VideoUnreadable` when the directory cannot be
    /// opened or probed.
    pub fn create(
        &self,
        video_path: &Path,
        engine: Box<dyn SegmentationEngine>,
        offload: MemoryOffload,
    ) -> Result<Arc<Session>> {
        let source = Arc::new(ImageDirSource::open(video_path)?);
        self.create_with_source(video_path, source, engine, offload)
    }

    /// Create a session over an already-opened frame source. The engine is
    /// bound to the same video path.
    pub fn create_with_source(
        &self,
        video_path: &Path,
        source: Arc<dyn FrameSource>,
        mut engine: Box<dyn SegmentationEngine>,
        offload: MemoryOffload,
    ) -> Result<Arc<Session>> {
        engine.bind(video_path, offload)?;
        let props = source.properties();

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            video_path: video_path.to_path_buf(),
            props,
            source,
            engine: Mutex::new(engine),
            masks: Mutex::new(MaskBuffer::new(props.width, props.height)),
            busy: AtomicBool::new(false),
        });

        tracing::info!(
            "Session {} created for {} ({} frames at {}x{})",
            session.id,
            video_path.display(),
            props.frame_count,
            props.width,
            props.height
        );

        self.sessions.write().insert(session.id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Remove a session from the registry, releasing its resources once the
    /// last outstanding reference drops.
    pub fn end(&self, id: SessionId) -> Result<()> {
        match self.sessions.write().remove(&id) {
            Some(_) => {
                tracing::info!("Session {} ended", id);
                Ok(())
            }
            None => Err(Error::SessionNotFound(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fails_on_unreadable_video() {
        let store = SessionStore::new();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-video");

        // No engine is ever bound when the probe fails
        let err = store
            .create(&missing, Box::new(crate::engine::test_stub()), MemoryOffload::default())
            .unwrap_err();
        assert!(matches!(err, Error::VideoUnreadable { .. }));
        assert!(store.is_empty());
    }
}
