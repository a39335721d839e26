//! idwallet-core — identity verification engine.
//!
//! Reads document numbers out of OCR text, turns face-detection output into
//! comparable facial geometry, runs liveness challenges and scores a selfie
//! against the document photo. OCR and face detection themselves are
//! external providers behind [`OcrProvider`] and [`FaceDetectionProvider`].

pub mod detector;
pub mod document;
pub mod error;
pub mod frame;
pub mod liveness;
pub mod ocr;
pub mod session;
pub mod similarity;
pub mod types;

pub use detector::{
    DetectError, DetectedFace, DetectorOptions, FaceDetectionProvider, FaceSelection,
    FacialFeatureExtractor, ProviderError,
};
pub use document::{DocumentKind, LicenseFormat, ScanOutcome, ValidatedNumber};
pub use error::VerificationError;
pub use frame::{Frame, FrameError};
pub use liveness::{ChallengeKind, Decision};
pub use ocr::{OcrProvider, RecognizedText};
pub use session::{
    CameraFacing, Event, Outcome, SessionConfig, Stage, StageKind, StageToken,
    VerificationSession,
};
pub use similarity::{SimilarityBreakdown, SimilarityScorer, SimilarityWeights};
pub use types::{BoundingBox, ContourKind, FacialData, LandmarkKind, Point};
