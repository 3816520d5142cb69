//! Transfer coordinator.
//!
//! Moves the blobs of one job between the local side and the remote. Blobs
//! are deduplicated by content hash before any bytes move: the remote is
//! asked `has_blob` before an upload, and the local blob store is checked
//! before a download. A semaphore shared by every job bounds the number of
//! blobs in flight.
//!
//! Progress is bytes done over total bytes, where blobs found already
//! present count as done. It is published as integer percentages that never
//! decrease, and always ends with 100 before success.

use crate::error::{SyncError, SyncResult};
use crate::job::{JobId, JobToken};
use crate::remote::RemoteStore;
use crate::retry::Retrier;
use crate::session::SessionProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use worldsync_core::{BlobStore, ContentHash};

/// Which way blobs move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Local to remote.
    Upload,
    /// Remote to the local blob store.
    Download,
}

/// Where upload content comes from.
#[derive(Debug, Clone)]
pub enum BlobSource {
    /// A file on disk, read when the upload starts.
    File(PathBuf),
    /// Bytes already in memory.
    Bytes(Arc<[u8]>),
}

#[derive(Debug, Clone)]
struct PlannedBlob {
    hash: ContentHash,
    size: u64,
    source: Option<BlobSource>,
}

/// The blobs one job needs moved.
pub struct TransferPlan {
    kind: TransferKind,
    blobs: Vec<PlannedBlob>,
    present_bytes: u64,
    present_blobs: usize,
    store: Option<Arc<dyn BlobStore>>,
}

impl TransferPlan {
    /// An empty upload plan.
    pub fn upload() -> Self {
        Self {
            kind: TransferKind::Upload,
            blobs: Vec::new(),
            present_bytes: 0,
            present_blobs: 0,
            store: None,
        }
    }

    /// An empty download plan writing into `store`.
    pub fn download(store: Arc<dyn BlobStore>) -> Self {
        Self {
            kind: TransferKind::Download,
            blobs: Vec::new(),
            present_bytes: 0,
            present_blobs: 0,
            store: Some(store),
        }
    }

    /// Adds a blob to upload.
    pub fn add_upload(&mut self, hash: ContentHash, size: u64, source: BlobSource) {
        self.blobs.push(PlannedBlob {
            hash,
            size,
            source: Some(source),
        });
    }

    /// Adds a blob to download.
    pub fn add_download(&mut self, hash: ContentHash, size: u64) {
        self.blobs.push(PlannedBlob {
            hash,
            size,
            source: None,
        });
    }

    /// Counts a blob the caller already knows is present.
    pub fn add_present(&mut self, size: u64) {
        self.present_bytes += size;
        self.present_blobs += 1;
    }

    /// Direction.
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Blobs that may need moving.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if nothing may need moving.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes, present ones included.
    pub fn total_bytes(&self) -> u64 {
        self.present_bytes + self.blobs.iter().map(|b| b.size).sum::<u64>()
    }
}

impl fmt::Debug for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferPlan")
            .field("kind", &self.kind)
            .field("blobs", &self.blobs.len())
            .field("present_blobs", &self.present_blobs)
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

/// Counts for a finished transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Blobs actually moved.
    pub transferred: usize,
    /// Blobs skipped because the destination had them.
    pub skipped: usize,
    /// Bytes actually moved.
    pub bytes: u64,
}

/// Events of one transfer. The stream ends with `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Percent done.
    Progress(u8),
    /// All blobs are at the destination.
    Completed(TransferStats),
    /// The transfer stopped.
    Failed(String),
}

/// A running transfer.
pub struct TransferHandle {
    events: mpsc::UnboundedReceiver<TransferEvent>,
    task: JoinHandle<SyncResult<TransferStats>>,
}

impl TransferHandle {
    /// Next event, or `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Waits for the transfer and returns its result.
    pub async fn join(self) -> SyncResult<TransferStats> {
        self.task
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Turns byte counts into coalesced, non-decreasing percentages.
#[derive(Debug)]
pub(crate) struct ProgressMeter {
    total: u64,
    done: u64,
    step: u8,
    last: Option<u8>,
}

impl ProgressMeter {
    pub(crate) fn new(total: u64, step: u8) -> Self {
        Self {
            total,
            done: 0,
            step: step.max(1),
            last: None,
        }
    }

    /// Records `bytes` more done; returns a percentage to publish, if any.
    pub(crate) fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.done = self.done.saturating_add(bytes).min(self.total);
        let percent = if self.total == 0 {
            100
        } else {
            u8::try_from(self.done * 100 / self.total).unwrap_or(100)
        };
        let publish = match self.last {
            None => true,
            Some(last) => (percent == 100 && last < 100) || percent >= last.saturating_add(self.step),
        };
        if publish {
            self.last = Some(percent);
            Some(percent)
        } else {
            None
        }
    }

    /// Publishes 100 unless it was the last value.
    pub(crate) fn finish(&mut self) -> Option<u8> {
        if self.last == Some(100) {
            None
        } else {
            self.done = self.total;
            self.last = Some(100);
            Some(100)
        }
    }
}

/// Schedules blob transfers against the remote.
pub struct TransferCoordinator<R, P> {
    remote: Arc<R>,
    retrier: Retrier<P>,
    permits: Arc<Semaphore>,
    progress_step: u8,
}

impl<R, P> Clone for TransferCoordinator<R, P> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            retrier: self.retrier.clone(),
            permits: Arc::clone(&self.permits),
            progress_step: self.progress_step,
        }
    }
}

enum BlobResult {
    Moved(u64),
    Skipped(u64),
}

impl<R: RemoteStore, P: SessionProvider> TransferCoordinator<R, P> {
    /// Creates a coordinator allowing `max_in_flight` blobs at once.
    pub fn new(remote: Arc<R>, retrier: Retrier<P>, max_in_flight: usize, progress_step: u8) -> Self {
        Self {
            remote,
            retrier,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            progress_step,
        }
    }

    /// Blob slots currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Starts moving the blobs of `plan`.
    ///
    /// Must be called from within a Tokio runtime. Cancellation is checked
    /// before each blob starts; blobs already in flight run to completion.
    pub fn transfer(&self, job: JobId, token: &JobToken, plan: TransferPlan) -> TransferHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = self.clone();
        let token = token.clone();
        let task = tokio::spawn(async move {
            let result = coordinator.run(job, token, plan, &tx).await;
            let terminal = match &result {
                Ok(stats) => TransferEvent::Completed(*stats),
                Err(e) => TransferEvent::Failed(e.to_string()),
            };
            let _ = tx.send(terminal);
            result
        });
        TransferHandle { events: rx, task }
    }

    async fn run(
        &self,
        job: JobId,
        token: JobToken,
        plan: TransferPlan,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> SyncResult<TransferStats> {
        let mut meter = ProgressMeter::new(plan.total_bytes(), self.progress_step);
        let mut stats = TransferStats {
            skipped: plan.present_blobs,
            ..TransferStats::default()
        };
        if let Some(p) = meter.advance(plan.present_bytes) {
            let _ = events.send(TransferEvent::Progress(p));
        }
        debug!(
            %job,
            kind = ?plan.kind,
            blobs = plan.blobs.len(),
            total = plan.total_bytes(),
            "transfer started"
        );

        let halt = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        for blob in plan.blobs {
            let coordinator = self.clone();
            let token = token.clone();
            let halt = Arc::clone(&halt);
            let store = plan.store.clone();
            let kind = plan.kind;
            tasks.spawn(async move { coordinator.run_blob(blob, kind, store, token, halt).await });
        }

        let mut first_error: Option<SyncError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| SyncError::Task(e.to_string())).and_then(|r| r);
            match outcome {
                Ok(Some(BlobResult::Moved(size))) => {
                    stats.transferred += 1;
                    stats.bytes += size;
                    if let Some(p) = meter.advance(size) {
                        let _ = events.send(TransferEvent::Progress(p));
                    }
                }
                Ok(Some(BlobResult::Skipped(size))) => {
                    stats.skipped += 1;
                    if let Some(p) = meter.advance(size) {
                        let _ = events.send(TransferEvent::Progress(p));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    halt.store(true, Ordering::SeqCst);
                    // Cancellation wins over whatever else failed.
                    let replace = match (&first_error, &e) {
                        (None, _) => true,
                        (Some(SyncError::Cancelled), _) => false,
                        (Some(_), SyncError::Cancelled) => true,
                        _ => false,
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            warn!(%job, error = %err, "transfer stopped");
            return Err(err);
        }
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(p) = meter.finish() {
            let _ = events.send(TransferEvent::Progress(p));
        }
        info!(
            %job,
            transferred = stats.transferred,
            skipped = stats.skipped,
            bytes = stats.bytes,
            "transfer complete"
        );
        Ok(stats)
    }

    async fn run_blob(
        self,
        blob: PlannedBlob,
        kind: TransferKind,
        store: Option<Arc<dyn BlobStore>>,
        token: JobToken,
        halt: Arc<AtomicBool>,
    ) -> SyncResult<Option<BlobResult>> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if halt.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let result = match (kind, store) {
            (TransferKind::Upload, _) => self.upload(&blob).await?,
            (TransferKind::Download, Some(store)) => self.download(&blob, store).await?,
            (TransferKind::Download, None) => {
                return Err(SyncError::Task("download plan without a store".into()))
            }
        };
        Ok(Some(result))
    }

    async fn upload(&self, blob: &PlannedBlob) -> SyncResult<BlobResult> {
        let hash = blob.hash;
        let what = format!("blob {}", hash.short(12));

        let remote = Arc::clone(&self.remote);
        let present = self
            .retrier
            .run(&what, |session| {
                let remote = Arc::clone(&remote);
                async move { remote.has_blob(&session, &hash).await }
            })
            .await?;
        if present {
            debug!(blob = %hash.short(12), "already on remote");
            return Ok(BlobResult::Skipped(blob.size));
        }

        let data: Arc<[u8]> = match &blob.source {
            Some(BlobSource::Bytes(bytes)) => Arc::clone(bytes),
            Some(BlobSource::File(path)) => {
                let path = path.clone();
                let read = tokio::task::spawn_blocking(move || std::fs::read(path))
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))?;
                Arc::from(read.map_err(worldsync_core::CoreError::from)?)
            }
            None => return Err(SyncError::Task(format!("{what} has no source"))),
        };
        let actual = ContentHash::of(&data);
        if actual != hash {
            return Err(SyncError::transfer_failed(
                what,
                0,
                "file changed since it was scanned",
            ));
        }

        self.retrier
            .run(&what, |session| {
                let remote = Arc::clone(&remote);
                let data = Arc::clone(&data);
                async move { remote.put_blob(&session, &hash, &data).await }
            })
            .await?;
        debug!(blob = %hash.short(12), size = blob.size, "uploaded");
        Ok(BlobResult::Moved(blob.size))
    }

    async fn download(&self, blob: &PlannedBlob, store: Arc<dyn BlobStore>) -> SyncResult<BlobResult> {
        let hash = blob.hash;
        if store.contains(&hash)? {
            return Ok(BlobResult::Skipped(blob.size));
        }
        let what = format!("blob {}", hash.short(12));
        let remote = Arc::clone(&self.remote);
        let data = self
            .retrier
            .run(&what, |session| {
                let remote = Arc::clone(&remote);
                async move { remote.get_blob(&session, &hash).await }
            })
            .await?;
        // The store verifies the hash before keeping anything.
        let size = data.len() as u64;
        tokio::task::spawn_blocking(move || store.put(&hash, &data))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(|e| SyncError::transfer_failed(what, 1, e.to_string()))?;
        debug!(blob = %hash.short(12), size, "downloaded");
        Ok(BlobResult::Moved(blob.size))
    }
}

impl<R, P> fmt::Debug for TransferCoordinator<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("available_permits", &self.permits.available_permits())
            .field("progress_step", &self.progress_step)
            .finish()
    }
}
