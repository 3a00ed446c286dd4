use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,

    /// Squared euclidean distance below which two faces are the same identity.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
}

fn default_index_path() -> PathBuf {
    data_dir().join("faces.index")
}

fn default_match_threshold() -> f32 {
    crate::index::DEFAULT_MATCH_THRESHOLD
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            match_threshold: default_match_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Upper bound on images being processed by workers at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ScannerConfig {
    /// Worker count actually used; never zero.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_detection_model")]
    pub detection_model: ModelSource,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: ModelSource,

    /// Intra-op threads per ONNX session.
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

/// A model file and where to fetch it from if it is not on disk yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSource {
    pub file: String,
    pub url: String,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facetrail")
        .join("models")
}

fn default_detection_model() -> ModelSource {
    ModelSource {
        file: "ultraface-320.onnx".to_string(),
        url: "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx".to_string(),
    }
}

fn default_embedding_model() -> ModelSource {
    ModelSource {
        file: "arcface-resnet100.onnx".to_string(),
        url: "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx".to_string(),
    }
}

fn default_intra_threads() -> usize {
    1
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            detection_model: default_detection_model(),
            embedding_model: default_embedding_model(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facetrail")
}

fn default_db_path() -> PathBuf {
    data_dir().join("faces.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index: IndexConfig::default(),
            scanner: ScannerConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facetrail")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACETRAIL_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }
}
