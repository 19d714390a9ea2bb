//! Relative path → live file actor.
//!
//! Files are opened on first join and dropped from the map once their actor
//! has stopped. The map lock is only held to look up or insert a handle,
//! never while waiting on an actor.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessel_core::{SessionError, SessionFile};
use tokio::sync::Mutex;

use crate::broadcast::PeerHub;
use crate::error::CoordinatorError;
use crate::file_actor::{FileActor, FileHandle, FileRequest};

pub struct FileRegistry {
    root: PathBuf,
    files: Mutex<HashMap<PathBuf, FileHandle>>,
    hub: Arc<PeerHub>,
    queue_capacity: usize,
    next_actor_id: AtomicU64,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>, hub: Arc<PeerHub>, queue_capacity: usize) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
            hub,
            queue_capacity,
            next_actor_id: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a client-supplied path. It must stay inside the root.
    pub fn resolve(&self, file_path: &str) -> Result<PathBuf, CoordinatorError> {
        let mut resolved = PathBuf::new();
        for component in Path::new(file_path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(CoordinatorError::FileNotPresent(file_path.to_string())),
            }
        }
        if resolved.as_os_str().is_empty() {
            return Err(CoordinatorError::FileNotPresent(file_path.to_string()));
        }
        Ok(resolved)
    }

    /// Route a request for `path` (already resolved) to its actor.
    pub async fn dispatch(
        &self,
        user: &str,
        path: &Path,
        request: FileRequest,
    ) -> Result<(), CoordinatorError> {
        if request == FileRequest::Join {
            return self.join(user, path).await;
        }

        let handle = self
            .files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinatorError::FileNotLoaded(path.display().to_string()))?;
        let result = handle.request(user, request).await;
        self.forget_if_stopped(path, &handle).await;
        match result {
            Err(CoordinatorError::ActorGone) => {
                Err(CoordinatorError::FileNotLoaded(path.display().to_string()))
            }
            other => other,
        }
    }

    /// Force `user` out of every file in `paths`, e.g. after a disconnect.
    pub async fn disconnect<'a>(&self, user: &str, paths: impl IntoIterator<Item = &'a PathBuf>) {
        for path in paths {
            if let Err(e) = self.dispatch(user, path, FileRequest::Leave { force: true }).await {
                log::warn!("Forced leave of {user} from {} failed: {e}", path.display());
            }
        }
    }

    pub async fn open_files(&self) -> usize {
        self.files.lock().await.values().filter(|h| !h.is_closed()).count()
    }

    pub async fn is_open(&self, path: &Path) -> bool {
        self.files.lock().await.get(path).is_some_and(|h| !h.is_closed())
    }

    async fn join(&self, user: &str, path: &Path) -> Result<(), CoordinatorError> {
        // One retry: the actor found may stop between lookup and request.
        for _ in 0..2 {
            let handle = self.handle_for(path).await?;
            match handle.request(user, FileRequest::Join).await {
                Err(CoordinatorError::ActorGone) => self.forget_if_stopped(path, &handle).await,
                other => return other,
            }
        }
        Err(CoordinatorError::ActorGone)
    }

    /// The live actor for `path`, opening the file if needed.
    ///
    /// The file is read without holding the map lock. If another join opened
    /// the same file meanwhile, its actor wins and the read is discarded.
    async fn handle_for(&self, path: &Path) -> Result<FileHandle, CoordinatorError> {
        if let Some(handle) = self.live_handle(path).await {
            return Ok(handle);
        }

        let full_path = self.root.join(path);
        let is_file = tokio::fs::metadata(&full_path)
            .await
            .is_ok_and(|meta| meta.is_file());
        if !is_file {
            return Err(CoordinatorError::FileNotPresent(path.display().to_string()));
        }
        let text = tokio::fs::read_to_string(&full_path)
            .await
            .map_err(SessionError::from)?;

        let mut files = self.files.lock().await;
        if let Some(handle) = files.get(path).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }
        let session = SessionFile::from_disk_text(&self.root, path, &text);
        let id = self.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let handle = FileActor::spawn(id, session, self.hub.clone(), self.queue_capacity);
        files.insert(path.to_path_buf(), handle.clone());
        log::info!("Opened {} (actor {id})", path.display());
        Ok(handle)
    }

    async fn live_handle(&self, path: &Path) -> Option<FileHandle> {
        self.files
            .lock()
            .await
            .get(path)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Drop `handle` from the map if its actor stopped and it is still the
    /// one registered for `path`.
    async fn forget_if_stopped(&self, path: &Path, handle: &FileHandle) {
        if !handle.is_closed() {
            return;
        }
        let mut files = self.files.lock().await;
        if files.get(path).map(FileHandle::id) == Some(handle.id()) {
            files.remove(path);
            log::info!("Evicted {}", path.display());
        }
    }
}
