//! Facial-feature extraction on top of an external face-detection provider.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BoundingBox, ContourKind, FacialData, LandmarkKind, Point};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider failed: {0}")]
    Failed(String),
    #[error("provider returned malformed output: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    #[error("no face detected")]
    NoFace,
    #[error("{0} faces detected, expected exactly one")]
    MultipleFaces(usize),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    Fast,
    Accurate,
}

/// Detector settings passed to the provider on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorOptions {
    pub performance_mode: PerformanceMode,
    pub landmarks: bool,
    pub contours: bool,
    pub classification: bool,
    /// Smallest face to report, as a fraction of the image height.
    pub min_face_size: f32,
    pub tracking: bool,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            performance_mode: PerformanceMode::Accurate,
            landmarks: true,
            contours: true,
            classification: true,
            min_face_size: 0.15,
            tracking: true,
        }
    }
}

/// One face as reported by a detection provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub landmarks: Vec<(LandmarkKind, Point)>,
    #[serde(default)]
    pub contours: Vec<(ContourKind, Vec<Point>)>,
    #[serde(default)]
    pub head_euler_angle_x: f32,
    #[serde(default)]
    pub head_euler_angle_y: f32,
    #[serde(default)]
    pub head_euler_angle_z: f32,
    #[serde(default)]
    pub left_eye_open_probability: Option<f32>,
    #[serde(default)]
    pub right_eye_open_probability: Option<f32>,
    #[serde(default)]
    pub smiling_probability: Option<f32>,
    #[serde(default)]
    pub tracking_id: Option<i32>,
}

/// External face-detection capability.
pub trait FaceDetectionProvider: Send {
    fn process(
        &mut self,
        image: &RgbImage,
        options: &DetectorOptions,
    ) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: FaceDetectionProvider + ?Sized> FaceDetectionProvider for Box<P> {
    fn process(
        &mut self,
        image: &RgbImage,
        options: &DetectorOptions,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).process(image, options)
    }
}

/// What to do when more than one face is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceSelection {
    /// Exactly one face is required (selfie, liveness).
    Single,
    /// Keep the face with the largest bounding box. ID photos often show
    /// background faces or a second, smaller hologram portrait.
    Largest,
}

/// Wraps a provider and turns its output into [`FacialData`].
pub struct FacialFeatureExtractor<P> {
    provider: P,
    options: DetectorOptions,
}

impl<P: FaceDetectionProvider> FacialFeatureExtractor<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            options: DetectorOptions::default(),
        }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    pub fn detect(
        &mut self,
        image: &RgbImage,
        selection: FaceSelection,
    ) -> Result<FacialData, DetectError> {
        let faces = self.provider.process(image, &self.options)?;
        tracing::trace!(faces = faces.len(), ?selection, "faces reported");
        select_face(&faces, selection).map(to_facial_data)
    }
}

/// Apply the selection policy to raw provider output.
pub fn select_face(
    faces: &[DetectedFace],
    selection: FaceSelection,
) -> Result<&DetectedFace, DetectError> {
    match (faces.len(), selection) {
        (0, _) => Err(DetectError::NoFace),
        (1, _) => Ok(&faces[0]),
        (n, FaceSelection::Single) => Err(DetectError::MultipleFaces(n)),
        (_, FaceSelection::Largest) => faces
            .iter()
            .max_by(|a, b| a.bounding_box.area().total_cmp(&b.bounding_box.area()))
            .ok_or(DetectError::NoFace),
    }
}

/// Copy a provider face into an owned snapshot.
pub fn to_facial_data(face: &DetectedFace) -> FacialData {
    FacialData {
        landmarks: face.landmarks.iter().copied().collect(),
        contours: face
            .contours
            .iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|(kind, points)| (*kind, points.clone()))
            .collect(),
        bounding_box: face.bounding_box,
        head_euler_angle_x: face.head_euler_angle_x,
        head_euler_angle_y: face.head_euler_angle_y,
        head_euler_angle_z: face.head_euler_angle_z,
        left_eye_open_probability: face.left_eye_open_probability,
        right_eye_open_probability: face.right_eye_open_probability,
        smiling_probability: face.smiling_probability,
        tracking_id: face.tracking_id,
    }
}
