//! Incremental ingestion of image folders.
//!
//! The [`Ingestor`] is the single owner of the pending queue, the embedding
//! index and all writes to the store. Detection runs on a bounded
//! [`WorkerPool`]; results come back over a channel and are applied here one
//! at a time, in whatever order they finish.

pub mod worker;

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use crate::config::{Config, ScannerConfig};
use crate::db::{BoundingBox, Database, IdentityId};
use crate::faces::{Detection, FaceEmbedder};
use crate::index::EmbeddingIndex;
use crate::scanner::discover_images;

pub use worker::{WorkerMessage, WorkerPool};

/// Notifications for whoever is presenting the pipeline's progress.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// Every image found by a scan, processed or not.
    AllPathsDiscovered(Vec<PathBuf>),
    /// Detection results for an image were applied.
    ImageIndexed {
        path: PathBuf,
        identities: Vec<IdentityId>,
    },
    ImageFailed {
        path: PathBuf,
        error: String,
    },
    IdentitiesInImage {
        path: PathBuf,
        identities: Vec<IdentityId>,
    },
    ImagesForIdentity {
        identity: IdentityId,
        paths: Vec<PathBuf>,
    },
    ImagesWithAllIdentities(Vec<PathBuf>),
    Merged {
        primary: IdentityId,
        merged: Vec<IdentityId>,
        redirected: usize,
    },
    /// The index or store could not be written; in-memory state is kept.
    PersistFailed {
        error: String,
    },
}

/// Counters since the ingestor was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub discovered: usize,
    pub queued: usize,
    pub indexed: usize,
    pub failed: usize,
    pub faces: usize,
    pub new_identities: usize,
    pub persist_failures: usize,
    /// Highest number of images in flight at once.
    pub peak_in_flight: usize,
}

pub struct Ingestor {
    store: Arc<Database>,
    index: EmbeddingIndex,
    /// Set when the in-memory index has rows not yet on disk.
    index_dirty: bool,
    workers: WorkerPool,
    image_extensions: Vec<String>,
    max_concurrency: usize,
    queue: VecDeque<PathBuf>,
    in_flight: HashSet<PathBuf>,
    events: Option<mpsc::Sender<IngestEvent>>,
    stats: IngestStats,
}

impl Ingestor {
    pub fn new(
        store: Arc<Database>,
        index: EmbeddingIndex,
        embedder: Arc<dyn FaceEmbedder>,
        scanner: &ScannerConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            tracing::warn!(
                embedder = embedder.dimension(),
                index = index.dimension(),
                "Embedder and index dimensions differ; detections will be dropped"
            );
        }

        let max_concurrency = scanner.effective_concurrency();
        let workers = WorkerPool::new(max_concurrency, embedder)?;

        Ok(Self {
            store,
            index,
            index_dirty: false,
            workers,
            image_extensions: scanner.image_extensions.clone(),
            max_concurrency,
            queue: VecDeque::new(),
            in_flight: HashSet::new(),
            events: None,
            stats: IngestStats::default(),
        })
    }

    /// Open the store and index named by `config`, sizing the index to the embedder.
    pub fn open(config: &Config, embedder: Arc<dyn FaceEmbedder>) -> Result<Self> {
        let store = Database::open(&config.db_path)?;
        store.initialize()?;

        let index = EmbeddingIndex::load_or_create(&config.index.path, embedder.dimension())
            .with_context(|| format!("Failed to open index {}", config.index.path.display()))?
            .with_threshold(config.index.match_threshold);

        Self::new(Arc::new(store), index, embedder, &config.scanner)
    }

    /// Send presentation events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<IngestEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Find every image under `folder` and queue the ones not yet processed.
    ///
    /// Replaces whatever was still pending from an earlier scan. Images that
    /// are in flight are left to finish and are not queued again. Returns all
    /// discovered paths without waiting for any detection.
    pub fn scan(&mut self, folder: &Path) -> Result<Vec<PathBuf>> {
        let folder = folder
            .canonicalize()
            .with_context(|| format!("Cannot scan {}", folder.display()))?;
        let all_paths = discover_images(&folder, &self.image_extensions)?;
        let processed = self.store.processed_paths()?;

        self.queue.clear();
        self.queue.extend(
            all_paths
                .iter()
                .filter(|p| !processed.contains(*p) && !self.in_flight.contains(*p))
                .cloned(),
        );

        self.stats.discovered += all_paths.len();
        self.stats.queued += self.queue.len();
        tracing::info!(
            folder = %folder.display(),
            found = all_paths.len(),
            new = self.queue.len(),
            "Scanned folder"
        );

        self.emit(IngestEvent::AllPathsDiscovered(all_paths.clone()));
        self.drain();
        Ok(all_paths)
    }

    /// Dispatch queued images, oldest first, up to the concurrency limit.
    pub fn drain(&mut self) {
        while self.in_flight.len() < self.max_concurrency {
            let Some(path) = self.queue.pop_front() else {
                break;
            };

            tracing::debug!(path = %path.display(), "Dispatching image");
            self.in_flight.insert(path.clone());
            self.workers.dispatch(path);
            self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight.len());
        }
    }

    /// Apply a finished image: resolve identities, record them, save the index.
    pub fn on_result(&mut self, path: PathBuf, detections: Vec<Detection>) {
        self.finish(&path);

        let rows_before = self.index.len();
        let mut faces: Vec<(IdentityId, BoundingBox)> = Vec::with_capacity(detections.len());

        for detection in detections {
            match self.index.resolve(&detection.embedding) {
                Ok(identity) => faces.push((identity, detection.bbox)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Dropping detection");
                }
            }
        }

        let added = self.index.len() - rows_before;
        if added > 0 {
            self.index_dirty = true;
            self.stats.new_identities += added;
        }

        if faces.is_empty() {
            tracing::debug!(path = %path.display(), "No faces found");
        }

        match self.store.record_image_occurrences(&path, &faces) {
            Ok(()) => {
                let identities: Vec<IdentityId> = faces.iter().map(|(id, _)| *id).collect();
                self.stats.indexed += 1;
                self.stats.faces += faces.len();
                tracing::info!(path = %path.display(), faces = faces.len(), "Indexed image");
                self.emit(IngestEvent::ImageIndexed { path, identities });
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to record occurrences");
                self.persist_failed(format!("{}: {:#}", path.display(), e));
            }
        }

        self.persist_index();
        self.drain();
    }

    /// Drop a failed image. It is not retried until the next scan.
    pub fn on_failure(&mut self, path: PathBuf, error: String) {
        self.finish(&path);
        self.stats.failed += 1;
        tracing::warn!(path = %path.display(), error = %error, "Image failed");
        self.emit(IngestEvent::ImageFailed { path, error });
        self.drain();
    }

    /// Apply every result that is ready without blocking. Returns how many.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(message) = self.workers.try_recv() {
            self.apply(message);
            applied += 1;
        }
        applied
    }

    /// Block for the next result and apply it. False if nothing is in flight.
    pub fn wait_next(&mut self) -> bool {
        if self.in_flight.is_empty() {
            return false;
        }

        match self.workers.recv() {
            Some(message) => {
                self.apply(message);
                true
            }
            None => false,
        }
    }

    /// Keep dispatching and applying until the queue and workers are empty.
    pub fn run_until_idle(&mut self) {
        self.drain();
        while !self.is_idle() {
            if !self.wait_next() {
                break;
            }
        }
    }

    pub fn request_identities_in(&self, path: &Path) -> Result<BTreeSet<IdentityId>> {
        let identities = self.store.identities_in(path)?;
        self.emit(IngestEvent::IdentitiesInImage {
            path: path.to_path_buf(),
            identities: identities.iter().copied().collect(),
        });
        Ok(identities)
    }

    pub fn request_images_with(&self, identity: IdentityId) -> Result<BTreeSet<PathBuf>> {
        let paths = self.store.images_with(identity)?;
        self.emit(IngestEvent::ImagesForIdentity {
            identity,
            paths: paths.iter().cloned().collect(),
        });
        Ok(paths)
    }

    pub fn request_images_with_all(&self, identities: &[IdentityId]) -> Result<BTreeSet<PathBuf>> {
        let paths = self.store.images_with_all(identities)?;
        self.emit(IngestEvent::ImagesWithAllIdentities(paths.iter().cloned().collect()));
        Ok(paths)
    }

    /// Images that share every identity found in `path`.
    pub fn request_images_with_all_in(&self, path: &Path) -> Result<BTreeSet<PathBuf>> {
        let paths = self.store.images_with_all_in(path)?;
        self.emit(IngestEvent::ImagesWithAllIdentities(paths.iter().cloned().collect()));
        Ok(paths)
    }

    /// Fold `others` into `primary` in the store. The index is left as is.
    pub fn merge(&self, primary: IdentityId, others: &[IdentityId]) -> Result<usize> {
        let redirected = self.store.merge(primary, others)?;
        self.emit(IngestEvent::Merged {
            primary,
            merged: others.iter().copied().filter(|id| *id != primary).collect(),
            redirected,
        });
        Ok(redirected)
    }

    fn apply(&mut self, message: WorkerMessage) {
        match message.outcome {
            Ok(detections) => self.on_result(message.path, detections),
            Err(error) => self.on_failure(message.path, error),
        }
    }

    fn finish(&mut self, path: &Path) {
        if !self.in_flight.remove(path) {
            tracing::warn!(path = %path.display(), "Result for an image that was not in flight");
        }
    }

    fn persist_index(&mut self) {
        if !self.index_dirty {
            return;
        }

        match self.index.persist() {
            Ok(()) => self.index_dirty = false,
            Err(e) => {
                tracing::error!(error = %e, "Failed to save embedding index");
                self.persist_failed(e.to_string());
            }
        }
    }

    fn persist_failed(&mut self, error: String) {
        self.stats.persist_failures += 1;
        self.emit(IngestEvent::PersistFailed { error });
    }

    fn emit(&self, event: IngestEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver just means nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}
