use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use super::{Detection, FaceEmbedder};
use crate::config::{DetectorConfig, ModelSource};
use crate::db::BoundingBox;

/// Output length of the ArcFace embedding network.
pub const EMBEDDING_DIMENSION: usize = 512;

const DETECTION_INPUT_WIDTH: u32 = 320;
const DETECTION_INPUT_HEIGHT: u32 = 240;
const CONFIDENCE_THRESHOLD: f32 = 0.7;
const NMS_THRESHOLD: f32 = 0.3;
const EMBEDDING_INPUT_SIZE: u32 = 112;

/// UltraFace detection followed by ArcFace embedding, both through ONNX Runtime.
///
/// Sessions are created on first use, downloading the model files into
/// `models_dir` if they are missing. Each session sits behind its own mutex,
/// so concurrent workers share one copy of each model.
pub struct OnnxFaceEmbedder {
    config: DetectorConfig,
    detection: OnceLock<Mutex<Session>>,
    embedding: OnceLock<Mutex<Session>>,
}

impl OnnxFaceEmbedder {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            detection: OnceLock::new(),
            embedding: OnceLock::new(),
        }
    }

    /// Load both models now instead of on the first image.
    pub fn warm_up(&self) -> Result<()> {
        self.detection_session()?;
        self.embedding_session()?;
        Ok(())
    }

    fn detection_session(&self) -> Result<MutexGuard<'_, Session>> {
        lock_session(&self.detection, || {
            self.load_session(&self.config.detection_model)
        })
    }

    fn embedding_session(&self) -> Result<MutexGuard<'_, Session>> {
        lock_session(&self.embedding, || {
            self.load_session(&self.config.embedding_model)
        })
    }

    fn load_session(&self, source: &ModelSource) -> Result<Session> {
        let model_path = ensure_model(&self.config.models_dir, source)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.config.intra_threads.max(1))?
            .commit_from_file(&model_path)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;
        tracing::debug!(model = %source.file, "Loaded ONNX session");
        Ok(session)
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<Detection>> {
        let img = image::load_from_memory(image).map_err(|e| anyhow!("Failed to decode image: {}", e))?;
        let (width, height) = img.dimensions();

        let boxes = {
            let mut session = self.detection_session()?;
            run_ultraface_detection(&mut session, &img)?
        };

        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self.embedding_session()?;
        let mut detections = Vec::with_capacity(boxes.len());

        for (bbox, _confidence) in boxes {
            if bbox.width() <= 0 || bbox.height() <= 0 {
                continue;
            }

            let crop = crop_face(&img, &bbox, width, height);
            let embedding = match run_arcface_embedding(&mut session, &crop) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::debug!(error = %e, "Embedding failed, using zero vector");
                    vec![0.0; EMBEDDING_DIMENSION]
                }
            };

            detections.push(Detection { embedding, bbox });
        }

        Ok(detections)
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }
}

/// Lock a lazily created session, creating it first if needed.
fn lock_session<'a>(
    cell: &'a OnceLock<Mutex<Session>>,
    load: impl FnOnce() -> Result<Session>,
) -> Result<MutexGuard<'a, Session>> {
    if cell.get().is_none() {
        // Losing a race here only means the other thread's session is kept.
        let _ = cell.set(Mutex::new(load()?));
    }

    cell.get()
        .ok_or_else(|| anyhow!("Model session not initialized"))?
        .lock()
        .map_err(|e| anyhow!("Failed to lock model session: {}", e))
}

/// Path of the model in `models_dir`, downloading it first if missing.
fn ensure_model(models_dir: &Path, source: &ModelSource) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)
        .with_context(|| format!("Failed to create {}", models_dir.display()))?;
    let model_path = models_dir.join(&source.file);

    if !model_path.exists() {
        tracing::info!(model = %source.file, "Downloading model...");
        let response = ureq::get(&source.url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        // Download next to the target so a failed transfer never looks complete.
        let partial = models_dir.join(format!("{}.part", source.file));
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        file.sync_all()?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %source.file, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

/// Run UltraFace and return face boxes in original image pixels.
fn run_ultraface_detection(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        DETECTION_INPUT_WIDTH,
        DETECTION_INPUT_HEIGHT,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let plane = (DETECTION_INPUT_WIDTH * DETECTION_INPUT_HEIGHT) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * DETECTION_INPUT_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, DETECTION_INPUT_HEIGHT as usize, DETECTION_INPUT_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape
        .get(1)
        .copied()
        .ok_or_else(|| anyhow!("Unexpected scores shape"))? as usize;

    let mut face_boxes = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = clamp_box(x1, y1, x2, y2, orig_width, orig_height);
        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Clamp raw corners to the image and keep at least one pixel of extent.
fn clamp_box(x1: i32, y1: i32, x2: i32, y2: i32, width: u32, height: u32) -> BoundingBox {
    let max_x = width as i32;
    let max_y = height as i32;
    let x1 = x1.clamp(0, (max_x - 1).max(0));
    let y1 = y1.clamp(0, (max_y - 1).max(0));
    let x2 = x2.clamp(x1 + 1, max_x.max(x1 + 1));
    let y2 = y2.clamp(y1 + 1, max_y.max(y1 + 1));
    BoundingBox::new(x1, y1, x2, y2)
}

/// Non-maximum suppression, highest confidence first.
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|(kept, _)| compute_iou(kept, &candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }

    keep
}

/// Intersection over union of two boxes.
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width() * a.height()) as f32;
    let area_b = (b.width() * b.height()) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face with 20% padding on each side, clipped to the image.
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width() as f32 * 0.2) as i32;
    let padding_y = (bbox.height() as f32 * 0.2) as i32;

    let x = ((bbox.x1 - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y1 - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width() + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height() + padding_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace on a face crop and L2-normalize the result.
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    let resized = face_img.resize_exact(
        EMBEDDING_INPUT_SIZE,
        EMBEDDING_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let plane = (EMBEDDING_INPUT_SIZE * EMBEDDING_INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * EMBEDDING_INPUT_SIZE as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, EMBEDDING_INPUT_SIZE as usize, EMBEDDING_INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    // The ArcFace export names its input "data"
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs.iter().next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    if embedding_data.len() != EMBEDDING_DIMENSION {
        return Err(anyhow!(
            "Embedding has {} values, expected {}",
            embedding_data.len(),
            EMBEDDING_DIMENSION
        ));
    }

    Ok(l2_normalize(embedding_data.to_vec()))
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(0, 0, 10, 10);
        assert!((compute_iou(&a, &b) - 1.0).abs() < 0.001);

        let c = BoundingBox::new(20, 20, 30, 30);
        assert!(compute_iou(&a, &c).abs() < 0.001);

        // Half overlap: 50 / 150
        let d = BoundingBox::new(5, 0, 15, 10);
        assert!((compute_iou(&a, &d) - 1.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = vec![
            (BoundingBox::new(0, 0, 10, 10), 0.8),
            (BoundingBox::new(1, 1, 11, 11), 0.95),
            (BoundingBox::new(50, 50, 60, 60), 0.75),
        ];
        let kept = nms(boxes, NMS_THRESHOLD);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, BoundingBox::new(1, 1, 11, 11));
        assert_eq!(kept[1].0, BoundingBox::new(50, 50, 60, 60));
    }

    #[test]
    fn test_clamp_box_stays_inside_image() {
        let bbox = clamp_box(-5, -3, 700, 500, 640, 480);
        assert_eq!(bbox, BoundingBox::new(0, 0, 640, 480));

        let degenerate = clamp_box(10, 10, 10, 10, 640, 480);
        assert_eq!(degenerate.width(), 1);
        assert_eq!(degenerate.height(), 1);
    }

    #[test]
    fn test_crop_face_clips_padding() {
        let img = DynamicImage::new_rgb8(100, 80);
        let crop = crop_face(&img, &BoundingBox::new(90, 70, 100, 80), 100, 80);
        assert_eq!(crop.dimensions(), (12, 12));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_undecodable_bytes_fail_before_loading_models() {
        let mut config = DetectorConfig::default();
        config.models_dir = tempfile::tempdir().unwrap().path().join("models");
        let embedder = OnnxFaceEmbedder::new(config);

        assert!(embedder.detect_and_embed(b"definitely not an image").is_err());
        assert_eq!(embedder.dimension(), EMBEDDING_DIMENSION);
    }
}
