//! Detection workers.
//!
//! Workers hold no shared mutable state: each job reads one image, runs the
//! embedder on it and sends the plain result back to the owning [`Ingestor`].
//!
//! [`Ingestor`]: super::Ingestor

use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use crate::faces::{Detection, FaceEmbedder};

/// Result of one job, sent from a worker to the owner.
#[derive(Debug)]
pub struct WorkerMessage {
    pub path: PathBuf,
    pub outcome: Result<Vec<Detection>, String>,
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    embedder: Arc<dyn FaceEmbedder>,
    tx: mpsc::Sender<WorkerMessage>,
    rx: mpsc::Receiver<WorkerMessage>,
}

impl WorkerPool {
    pub fn new(size: usize, embedder: Arc<dyn FaceEmbedder>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size.max(1))
            .thread_name(|i| format!("facetrail-worker-{}", i))
            .build()?;
        let (tx, rx) = mpsc::channel();

        Ok(Self { pool, embedder, tx, rx })
    }

    /// Queue `path` on the pool. Never blocks.
    pub fn dispatch(&self, path: PathBuf) {
        let embedder = Arc::clone(&self.embedder);
        let tx = self.tx.clone();

        self.pool.spawn(move || {
            let outcome = process_image(embedder.as_ref(), &path);
            // The owner may already be gone; nothing left to report to.
            let _ = tx.send(WorkerMessage { path, outcome });
        });
    }

    /// Next finished job, if one is ready.
    pub fn try_recv(&self) -> Option<WorkerMessage> {
        self.rx.try_recv().ok()
    }

    /// Block until a job finishes. Only call with work outstanding.
    pub fn recv(&self) -> Option<WorkerMessage> {
        self.rx.recv().ok()
    }
}

/// Read and embed one image. Panics in the embedder are reported as errors.
fn process_image(embedder: &dyn FaceEmbedder, path: &Path) -> Result<Vec<Detection>, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Failed to read image: {}", e))?;

    match catch_unwind(AssertUnwindSafe(|| embedder.detect_and_embed(&bytes))) {
        Ok(Ok(detections)) => Ok(detections),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("Worker panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BoundingBox;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Echo;

    impl FaceEmbedder for Echo {
        fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<Detection>> {
            match image {
                b"panic" => panic!("model exploded"),
                b"error" => anyhow::bail!("unsupported format"),
                _ => Ok(vec![Detection {
                    embedding: vec![image.len() as f32],
                    bbox: BoundingBox::new(0, 0, 1, 1),
                }]),
            }
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    fn recv(pool: &WorkerPool) -> WorkerMessage {
        pool.rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_worker_returns_detections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"abc").unwrap();

        let pool = WorkerPool::new(2, Arc::new(Echo)).unwrap();
        pool.dispatch(path.clone());

        let message = recv(&pool);
        assert_eq!(message.path, path);
        assert_eq!(message.outcome.unwrap()[0].embedding, vec![3.0]);
    }

    #[test]
    fn test_errors_and_panics_become_messages() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.jpg");
        let boom = dir.path().join("boom.jpg");
        std::fs::write(&bad, b"error").unwrap();
        std::fs::write(&boom, b"panic").unwrap();

        let pool = WorkerPool::new(1, Arc::new(Echo)).unwrap();
        pool.dispatch(bad);
        pool.dispatch(boom);
        pool.dispatch(dir.path().join("missing.jpg"));

        let mut errors: Vec<String> = (0..3).map(|_| recv(&pool).outcome.unwrap_err()).collect();
        errors.sort();
        assert!(errors[0].starts_with("Failed to read image"));
        assert!(errors[1].contains("model exploded"));
        assert!(errors[2].contains("unsupported format"));
    }
}
