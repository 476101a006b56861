//! Detector adapter around a black-box face model.
//!
//! The model itself (weights, inference) lives outside this crate behind the
//! [`FaceModel`] trait. [`DetectorAdapter`] owns the load-once lifecycle,
//! rejects malformed frames, applies the score threshold and turns raw
//! landmark points into named groups.

use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::Instant;

use crate::camera::Frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("model assets unavailable: {0}")]
    Unavailable(String),
    #[error("model integrity check failed: {0}")]
    Integrity(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("face model is not loaded")]
    ModelNotLoaded,
    #[error("invalid frame: {width}x{height}, {len} bytes")]
    InvalidFrame { width: u32, height: u32, len: usize },
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// 68-point landmarks split into facial regions.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    pub jaw: Vec<Point>,
    pub brows: Vec<Point>,
    pub nose: Vec<Point>,
    pub left_eye: Vec<Point>,
    pub right_eye: Vec<Point>,
    pub mouth: Vec<Point>,
}

impl FaceLandmarks {
    pub const POINT_COUNT: usize = 68;

    /// Group a 68-point set. Any other count yields `None`.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        if points.len() != Self::POINT_COUNT {
            return None;
        }
        Some(Self {
            jaw: points[0..17].to_vec(),
            brows: points[17..27].to_vec(),
            nose: points[27..36].to_vec(),
            left_eye: points[36..42].to_vec(),
            right_eye: points[42..48].to_vec(),
            mouth: points[48..68].to_vec(),
        })
    }
}

/// A detection as reported by the model backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<FaceLandmarks>,
}

/// Faces found in one frame, highest confidence first.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub faces: Vec<DetectedFace>,
    pub frame_timestamp: Instant,
}

impl DetectionResult {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOptions {
    /// Detections scoring below this are discarded.
    pub score_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
        }
    }
}

/// Pluggable face model backend.
pub trait FaceModel: Send + 'static {
    /// Fetch and initialise the model. Called at most once per successful load.
    fn load(&mut self) -> impl Future<Output = Result<(), LoadError>> + Send;

    /// Run detection and landmark extraction on a validated frame.
    fn infer(
        &mut self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Vec<RawFace>, DetectorError>> + Send;
}

pub struct DetectorAdapter<M> {
    model: M,
    options: DetectorOptions,
    model_dir: Option<PathBuf>,
    loaded: bool,
}

impl<M: FaceModel> DetectorAdapter<M> {
    pub fn new(model: M, options: DetectorOptions) -> Self {
        Self {
            model,
            options,
            model_dir: None,
            loaded: false,
        }
    }

    /// Verify the model directory against its manifest before loading.
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = Some(dir.into());
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Load the model once. Later calls return immediately.
    pub async fn load_model(&mut self) -> Result<(), LoadError> {
        if self.loaded {
            return Ok(());
        }

        if let Some(dir) = self.model_dir.clone() {
            let dir_display = dir.display().to_string();
            tokio::task::spawn_blocking(move || facegate_models::verify_models_dir(&dir))
                .await
                .map_err(|e| LoadError::Unavailable(e.to_string()))?
                .map_err(|e| LoadError::Integrity(e.to_string()))?;
            tracing::debug!(dir = %dir_display, "model assets verified");
        }

        self.model.load().await?;
        self.loaded = true;
        tracing::info!("face model loaded");
        Ok(())
    }

    /// Detect faces in `frame`.
    pub async fn detect_faces(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        if !self.loaded {
            return Err(DetectorError::ModelNotLoaded);
        }
        if !frame.is_valid() {
            return Err(DetectorError::InvalidFrame {
                width: frame.width,
                height: frame.height,
                len: frame.data.len(),
            });
        }

        let raw = self.model.infer(frame).await?;
        let threshold = self.options.score_threshold;
        let mut faces: Vec<DetectedFace> = raw
            .into_iter()
            .filter(|f| f.score >= threshold)
            .map(|f| DetectedFace {
                bbox: f.bbox,
                confidence: f.score,
                landmarks: FaceLandmarks::from_points(&f.landmarks),
            })
            .collect();
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Ok(DetectionResult {
            faces,
            frame_timestamp: frame.captured_at,
        })
    }
}
