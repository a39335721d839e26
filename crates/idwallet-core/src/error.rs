use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::DetectError;

/// Errors surfaced to the subject during a verification attempt.
///
/// These are expected outcomes, not faults: they are recorded on the
/// session, shown once, and never block a retry.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("more than one face detected")]
    MultipleFacesDetected,
    #[error("face is too small; move closer to the camera")]
    FaceTooSmall,
    #[error("face is not centered in the frame")]
    FaceNotCentered,
    #[error("lighting is too poor")]
    PoorLighting,
    #[error("possible spoofing attempt detected")]
    SpoofingDetected,
    #[error("faces do not match")]
    NoMatchFound,
    #[error("document number is not valid")]
    InvalidDocumentNumber,
    #[error("liveness check failed")]
    LivenessCheckFailed,
    #[error("system error: {0}")]
    SystemError(String),
}

impl From<DetectError> for VerificationError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::NoFace => VerificationError::NoFaceDetected,
            DetectError::MultipleFaces(_) => VerificationError::MultipleFacesDetected,
            DetectError::Provider(e) => VerificationError::SystemError(e.to_string()),
        }
    }
}
