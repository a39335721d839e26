//! The verification state machine.
//!
//! A session walks through a fixed sequence of stages:
//!
//! ```text
//! AADHAAR_CARD → AADHAAR_FACE_DETECTION → SELFIE → LIVENESS_CHECK → FACE_COMPARISON → COMPLETE
//! ```
//!
//! Each [`Stage`] variant carries exactly the data that is valid in it, so a
//! score cannot exist without a comparison and a selfie cannot exist without
//! a document face. Failures revert to the nearest sensible earlier stage.
//!
//! Inference runs elsewhere and reports back asynchronously. Every request is
//! tagged with the [`StageToken`] current when it was issued; a result whose
//! token no longer matches is discarded, so late results can never regress
//! or skip a stage. Timers work the same way.
//!
//! The session never reads the clock itself: every input carries `now`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::detector::DetectError;
use crate::document::ValidatedNumber;
use crate::error::VerificationError;
use crate::liveness::{self, ChallengeKind, Decision};
use crate::similarity::{SimilarityScorer, SimilarityWeights, DEFAULT_MATCH_THRESHOLD};
use crate::types::FacialData;

/// Liveness samples retained for the passive stability check.
const MAX_LIVENESS_SAMPLES: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A stage that does not advance within this window resets the attempt.
    pub stage_timeout: Duration,
    /// An unanswered liveness challenge is replaced after this long.
    pub challenge_timeout: Duration,
    pub match_threshold: f32,
    pub weights: SimilarityWeights,
    /// Maximum distance of the selfie face center from the image center,
    /// as a fraction of the frame width.
    pub center_tolerance: f32,
    /// Minimum selfie face width as a fraction of the shorter frame side.
    pub min_face_fraction: f32,
    /// Minimum mean luma (0–255) of a selfie frame; 0 disables the check.
    pub min_luminance: f32,
    pub passive_liveness: bool,
    pub min_eye_displacement: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(10),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            weights: SimilarityWeights::default(),
            center_tolerance: 0.15,
            min_face_fraction: 0.30,
            min_luminance: 40.0,
            passive_liveness: true,
            min_eye_displacement: liveness::DEFAULT_MIN_EYE_DISPLACEMENT,
        }
    }
}

/// Flat stage identifier, used for tokens, logging and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    AadhaarCard,
    AadhaarFaceDetection,
    Selfie,
    LivenessCheck,
    FaceComparison,
    Complete,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::AadhaarCard => "AADHAAR_CARD",
            StageKind::AadhaarFaceDetection => "AADHAAR_FACE_DETECTION",
            StageKind::Selfie => "SELFIE",
            StageKind::LivenessCheck => "LIVENESS_CHECK",
            StageKind::FaceComparison => "FACE_COMPARISON",
            StageKind::Complete => "COMPLETE",
        }
    }

    /// Camera the frame source must have bound while in this stage.
    pub fn camera(&self) -> Option<CameraFacing> {
        match self {
            StageKind::AadhaarCard | StageKind::AadhaarFaceDetection => Some(CameraFacing::Back),
            StageKind::Selfie | StageKind::LivenessCheck => Some(CameraFacing::Front),
            StageKind::FaceComparison | StageKind::Complete => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    Back,
    Front,
}

/// Identifies the stage instance a request was issued in.
///
/// `epoch` increases on every transition, so re-entering a stage after a
/// revert still invalidates requests from the earlier visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageToken {
    pub stage: StageKind,
    pub epoch: u64,
}

/// Stage plus the data valid in it.
#[derive(Debug, Clone)]
pub enum Stage {
    AadhaarCard,
    AadhaarFaceDetection {
        document_number: ValidatedNumber,
        still: Arc<RgbImage>,
    },
    Selfie {
        document_number: ValidatedNumber,
        document_face: Arc<FacialData>,
    },
    LivenessCheck {
        document_number: ValidatedNumber,
        document_face: Arc<FacialData>,
        selfie_face: Arc<FacialData>,
        challenge: ChallengeKind,
        challenge_started_at: Instant,
        previous: Option<FacialData>,
        samples: Vec<FacialData>,
    },
    FaceComparison {
        document_number: ValidatedNumber,
        document_face: Arc<FacialData>,
        selfie_face: Arc<FacialData>,
    },
    Complete {
        document_number: ValidatedNumber,
        document_face: Arc<FacialData>,
        selfie_face: Arc<FacialData>,
        score: f32,
        decision: bool,
    },
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::AadhaarCard => StageKind::AadhaarCard,
            Stage::AadhaarFaceDetection { .. } => StageKind::AadhaarFaceDetection,
            Stage::Selfie { .. } => StageKind::Selfie,
            Stage::LivenessCheck { .. } => StageKind::LivenessCheck,
            Stage::FaceComparison { .. } => StageKind::FaceComparison,
            Stage::Complete { .. } => StageKind::Complete,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum Event {
    /// A validated number was read from the document; `still` is the frame it came from.
    DocumentNumber {
        number: ValidatedNumber,
        still: RgbImage,
    },
    /// OCR found number-like text that failed validation.
    DocumentRejected,
    DocumentFace(Result<FacialData, DetectError>),
    SelfieFrame {
        face: Result<FacialData, DetectError>,
        width: u32,
        height: u32,
        luminance: f32,
    },
    LivenessFrame(Result<FacialData, DetectError>),
    CompareFaces,
    /// A provider call failed outside face detection (e.g. OCR).
    ProviderFailed(String),
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::DocumentNumber { .. } => "document_number",
            Event::DocumentRejected => "document_rejected",
            Event::DocumentFace(_) => "document_face",
            Event::SelfieFrame { .. } => "selfie_frame",
            Event::LivenessFrame(_) => "liveness_frame",
            Event::CompareFaces => "compare_faces",
            Event::ProviderFailed(_) => "provider_failed",
        }
    }
}

/// What an input did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Issued for an earlier stage instance; discarded.
    Stale,
    /// Not meaningful in the current stage; discarded.
    Ignored,
    /// Processed without a stage change (an error may have been recorded).
    Unchanged,
    Transitioned { from: StageKind, to: StageKind },
}

/// Single-owner state of one verification attempt.
pub struct VerificationSession {
    config: SessionConfig,
    scorer: SimilarityScorer,
    rng: Box<dyn RngCore + Send>,
    stage: Stage,
    epoch: u64,
    stage_entered_at: Instant,
    last_error: Option<VerificationError>,
}

impl VerificationSession {
    pub fn new(config: SessionConfig, rng: Box<dyn RngCore + Send>, now: Instant) -> Self {
        let scorer = SimilarityScorer::new(config.weights);
        Self {
            config,
            scorer,
            rng,
            stage: Stage::AadhaarCard,
            epoch: 0,
            stage_entered_at: now,
            last_error: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn stage_kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn token(&self) -> StageToken {
        StageToken {
            stage: self.stage.kind(),
            epoch: self.epoch,
        }
    }

    pub fn stage_entered_at(&self) -> Instant {
        self.stage_entered_at
    }

    /// When the current stage times out; `None` once complete.
    pub fn deadline(&self) -> Option<Instant> {
        match self.stage {
            Stage::Complete { .. } => None,
            _ => Some(self.stage_entered_at + self.config.stage_timeout),
        }
    }

    /// When the current liveness challenge is replaced.
    pub fn challenge_deadline(&self) -> Option<Instant> {
        match &self.stage {
            Stage::LivenessCheck {
                challenge_started_at,
                ..
            } => Some(*challenge_started_at + self.config.challenge_timeout),
            _ => None,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.deadline(), self.challenge_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ── Flat accessors ────────────────────────────────────────────────────────

    pub fn document_number(&self) -> Option<&ValidatedNumber> {
        match &self.stage {
            Stage::AadhaarCard => None,
            Stage::AadhaarFaceDetection {
                document_number, ..
            }
            | Stage::Selfie {
                document_number, ..
            }
            | Stage::LivenessCheck {
                document_number, ..
            }
            | Stage::FaceComparison {
                document_number, ..
            }
            | Stage::Complete {
                document_number, ..
            } => Some(document_number),
        }
    }

    /// Still image awaiting document face detection.
    pub fn document_still(&self) -> Option<Arc<RgbImage>> {
        match &self.stage {
            Stage::AadhaarFaceDetection { still, .. } => Some(Arc::clone(still)),
            _ => None,
        }
    }

    pub fn document_face(&self) -> Option<&FacialData> {
        match &self.stage {
            Stage::Selfie { document_face, .. }
            | Stage::LivenessCheck { document_face, .. }
            | Stage::FaceComparison { document_face, .. }
            | Stage::Complete { document_face, .. } => Some(document_face),
            _ => None,
        }
    }

    pub fn selfie_face(&self) -> Option<&FacialData> {
        match &self.stage {
            Stage::LivenessCheck { selfie_face, .. }
            | Stage::FaceComparison { selfie_face, .. }
            | Stage::Complete { selfie_face, .. } => Some(selfie_face),
            _ => None,
        }
    }

    pub fn liveness_challenge(&self) -> Option<ChallengeKind> {
        match &self.stage {
            Stage::LivenessCheck { challenge, .. } => Some(*challenge),
            _ => None,
        }
    }

    pub fn challenge_started_at(&self) -> Option<Instant> {
        match &self.stage {
            Stage::LivenessCheck {
                challenge_started_at,
                ..
            } => Some(*challenge_started_at),
            _ => None,
        }
    }

    pub fn match_score(&self) -> Option<f32> {
        match &self.stage {
            Stage::Complete { score, .. } => Some(*score),
            _ => None,
        }
    }

    pub fn match_decision(&self) -> Option<bool> {
        match &self.stage {
            Stage::Complete { decision, .. } => Some(*decision),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&VerificationError> {
        self.last_error.as_ref()
    }

    /// Return the pending error and clear it, so it is surfaced once.
    pub fn take_error(&mut self) -> Option<VerificationError> {
        self.last_error.take()
    }

    // ── Inputs ────────────────────────────────────────────────────────────────

    /// Apply an input issued under `token`.
    pub fn handle(&mut self, token: StageToken, event: Event, now: Instant) -> Outcome {
        if token != self.token() {
            tracing::debug!(
                issued = %token.stage,
                issued_epoch = token.epoch,
                current = %self.stage_kind(),
                current_epoch = self.epoch,
                event = event.name(),
                "discarding stale result"
            );
            return Outcome::Stale;
        }

        let stage = std::mem::replace(&mut self.stage, Stage::AadhaarCard);
        match (stage, event) {
            (stage @ Stage::Complete { .. }, event) => {
                tracing::debug!(event = event.name(), "session complete, ignoring event");
                self.stage = stage;
                Outcome::Ignored
            }

            (stage, Event::ProviderFailed(message)) => {
                tracing::warn!(stage = %stage.kind(), error = %message, "provider failed");
                self.stage = stage;
                self.last_error = Some(VerificationError::SystemError(message));
                Outcome::Unchanged
            }

            (Stage::AadhaarCard, Event::DocumentNumber { number, still }) => {
                tracing::info!(number = %number.masked(), "document number captured");
                self.enter(
                    token.stage,
                    Stage::AadhaarFaceDetection {
                        document_number: number,
                        still: Arc::new(still),
                    },
                    now,
                )
            }
            (stage @ Stage::AadhaarCard, Event::DocumentRejected) => {
                self.stage = stage;
                self.last_error = Some(VerificationError::InvalidDocumentNumber);
                Outcome::Unchanged
            }

            (
                Stage::AadhaarFaceDetection {
                    document_number, ..
                },
                Event::DocumentFace(result),
            ) => match result {
                Ok(face) => {
                    tracing::info!(
                        landmarks = face.landmarks.len(),
                        contours = face.contours.len(),
                        "document face detected"
                    );
                    self.enter(
                        token.stage,
                        Stage::Selfie {
                            document_number,
                            document_face: Arc::new(face),
                        },
                        now,
                    )
                }
                Err(err) => {
                    tracing::warn!(error = %err, "no usable face on document");
                    self.last_error = Some(err.into());
                    self.enter(token.stage, Stage::AadhaarCard, now)
                }
            },

            (
                Stage::Selfie {
                    document_number,
                    document_face,
                },
                Event::SelfieFrame {
                    face,
                    width,
                    height,
                    luminance,
                },
            ) => {
                let checked = self.check_selfie(face, width, height, luminance);
                match checked {
                    Ok(selfie) => {
                        let challenge = ChallengeKind::random(&mut *self.rng);
                        tracing::info!(%challenge, "selfie captured, starting liveness challenge");
                        self.enter(
                            token.stage,
                            Stage::LivenessCheck {
                                document_number,
                                document_face,
                                selfie_face: Arc::new(selfie),
                                challenge,
                                challenge_started_at: now,
                                previous: None,
                                samples: Vec::new(),
                            },
                            now,
                        )
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "selfie frame rejected");
                        self.stage = Stage::Selfie {
                            document_number,
                            document_face,
                        };
                        self.last_error = Some(err);
                        Outcome::Unchanged
                    }
                }
            }

            (
                Stage::LivenessCheck {
                    document_number,
                    document_face,
                    selfie_face,
                    challenge,
                    challenge_started_at,
                    previous,
                    mut samples,
                },
                Event::LivenessFrame(result),
            ) => {
                let current = match result {
                    Ok(face) => face,
                    Err(err) => {
                        self.last_error = Some(err.into());
                        // The sample chain is broken; start over from the next frame.
                        self.stage = Stage::LivenessCheck {
                            document_number,
                            document_face,
                            selfie_face,
                            challenge,
                            challenge_started_at,
                            previous: None,
                            samples,
                        };
                        return self.roll_challenge_if_expired(now);
                    }
                };

                let decision = match &previous {
                    Some(prev) => liveness::evaluate(
                        challenge,
                        prev,
                        &current,
                        now.saturating_duration_since(challenge_started_at),
                    ),
                    None => Decision::Pending,
                };

                if samples.len() == MAX_LIVENESS_SAMPLES {
                    samples.remove(0);
                }
                samples.push(current.clone());

                if decision == Decision::Passed {
                    if self.config.passive_liveness {
                        let stability = liveness::check_landmark_stability(
                            &samples,
                            self.config.min_eye_displacement,
                        );
                        if !stability.is_live {
                            tracing::warn!(
                                %challenge,
                                displacement = stability.mean_eye_displacement,
                                pairs = stability.pairs_analysed,
                                "challenge passed but landmarks are static"
                            );
                            self.last_error = Some(VerificationError::SpoofingDetected);
                            let next = ChallengeKind::random(&mut *self.rng);
                            self.stage = Stage::LivenessCheck {
                                document_number,
                                document_face,
                                selfie_face,
                                challenge: next,
                                challenge_started_at: now,
                                previous: None,
                                samples: Vec::new(),
                            };
                            return Outcome::Unchanged;
                        }
                    }

                    tracing::info!(%challenge, "liveness challenge passed");
                    return self.enter(
                        token.stage,
                        Stage::FaceComparison {
                            document_number,
                            document_face,
                            selfie_face,
                        },
                        now,
                    );
                }

                self.stage = Stage::LivenessCheck {
                    document_number,
                    document_face,
                    selfie_face,
                    challenge,
                    challenge_started_at,
                    previous: Some(current),
                    samples,
                };
                self.roll_challenge_if_expired(now)
            }

            (
                Stage::FaceComparison {
                    document_number,
                    document_face,
                    selfie_face,
                },
                Event::CompareFaces,
            ) => {
                let breakdown = self.scorer.breakdown(&document_face, &selfie_face);
                match breakdown.overall.filter(|s| s.is_finite()) {
                    Some(score) => {
                        let decision = score >= self.config.match_threshold;
                        tracing::info!(
                            score,
                            decision,
                            landmark = ?breakdown.landmark,
                            contour = ?breakdown.contour,
                            proportion = ?breakdown.proportion,
                            orientation = ?breakdown.orientation,
                            "face comparison complete"
                        );
                        if !decision {
                            self.last_error = Some(VerificationError::NoMatchFound);
                        }
                        self.enter(
                            token.stage,
                            Stage::Complete {
                                document_number,
                                document_face,
                                selfie_face,
                                score,
                                decision,
                            },
                            now,
                        )
                    }
                    None => {
                        tracing::warn!("no comparable facial features, retaking selfie");
                        self.last_error = Some(VerificationError::SystemError(
                            "no comparable facial features".to_string(),
                        ));
                        self.enter(
                            token.stage,
                            Stage::Selfie {
                                document_number,
                                document_face,
                            },
                            now,
                        )
                    }
                }
            }

            (stage, event) => {
                tracing::debug!(
                    stage = %stage.kind(),
                    event = event.name(),
                    "event does not apply to current stage"
                );
                self.stage = stage;
                Outcome::Ignored
            }
        }
    }

    /// Fire any expired timer.
    ///
    /// The stage timeout reverts every non-terminal stage to `AadhaarCard`;
    /// an expired liveness challenge is replaced by a fresh one.
    pub fn poll_timers(&mut self, now: Instant) -> Outcome {
        if let Some(deadline) = self.deadline() {
            if now >= deadline {
                let stage = self.stage_kind();
                tracing::warn!(
                    %stage,
                    timeout = ?self.config.stage_timeout,
                    "stage timed out, restarting verification"
                );
                self.last_error = Some(VerificationError::SystemError(format!(
                    "{stage} timed out after {:?}",
                    self.config.stage_timeout
                )));
                return self.enter(stage, Stage::AadhaarCard, now);
            }
        }
        self.roll_challenge_if_expired(now)
    }

    /// [`poll_timers`](Self::poll_timers) for a timer armed under `token`.
    pub fn expire(&mut self, token: StageToken, now: Instant) -> Outcome {
        if token != self.token() {
            return Outcome::Stale;
        }
        self.poll_timers(now)
    }

    /// Abandon the attempt and start over with every field cleared.
    pub fn reset(&mut self, now: Instant) -> Outcome {
        self.last_error = None;
        self.enter(self.stage_kind(), Stage::AadhaarCard, now)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn enter(&mut self, from: StageKind, stage: Stage, now: Instant) -> Outcome {
        let to = stage.kind();
        self.stage = stage;
        self.epoch += 1;
        self.stage_entered_at = now;
        tracing::info!(%from, %to, epoch = self.epoch, "stage transition");
        Outcome::Transitioned { from, to }
    }

    fn check_selfie(
        &self,
        face: Result<FacialData, DetectError>,
        width: u32,
        height: u32,
        luminance: f32,
    ) -> Result<FacialData, VerificationError> {
        if self.config.min_luminance > 0.0 && luminance < self.config.min_luminance {
            return Err(VerificationError::PoorLighting);
        }
        let face = face?;

        let (w, h) = (width as f32, height as f32);
        let center = face.bounding_box.center();
        let offset = ((center.x - w / 2.0).powi(2) + (center.y - h / 2.0).powi(2)).sqrt();
        if offset > self.config.center_tolerance * w {
            return Err(VerificationError::FaceNotCentered);
        }
        if face.bounding_box.width <= self.config.min_face_fraction * w.min(h) {
            return Err(VerificationError::FaceTooSmall);
        }
        Ok(face)
    }

    fn roll_challenge_if_expired(&mut self, now: Instant) -> Outcome {
        let timeout = self.config.challenge_timeout;
        let Stage::LivenessCheck {
            challenge,
            challenge_started_at,
            previous,
            samples,
            ..
        } = &mut self.stage
        else {
            return Outcome::Unchanged;
        };
        if now.saturating_duration_since(*challenge_started_at) < timeout {
            return Outcome::Unchanged;
        }

        let next = ChallengeKind::random(&mut *self.rng);
        tracing::info!(expired = %challenge, %next, "liveness challenge timed out, re-rolling");
        *challenge = next;
        *challenge_started_at = now;
        *previous = None;
        samples.clear();
        self.last_error = Some(VerificationError::LivenessCheckFailed);
        Outcome::Unchanged
    }
}

impl fmt::Debug for VerificationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationSession")
            .field("stage", &self.stage_kind())
            .field("epoch", &self.epoch)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKind;
    use crate::similarity::tests::sample_face;
    use crate::types::{LandmarkKind, Point};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const FRAME_W: u32 = 400;
    const FRAME_H: u32 = 420;
    const BRIGHT: f32 = 120.0;

    fn session(now: Instant) -> VerificationSession {
        VerificationSession::new(
            SessionConfig::default(),
            Box::new(StdRng::seed_from_u64(42)),
            now,
        )
    }

    fn number() -> ValidatedNumber {
        ValidatedNumber {
            kind: DocumentKind::Aadhaar,
            value: "234567890124".to_string(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn shifted(face: &FacialData, dx: f32) -> FacialData {
        let mut out = face.clone();
        for p in out.landmarks.values_mut() {
            *p = Point::new(p.x + dx, p.y);
        }
        out
    }

    /// A (previous, current) sample pair that satisfies `challenge`.
    fn performing(challenge: ChallengeKind) -> (FacialData, FacialData) {
        let rest = sample_face();
        let mut act = shifted(&rest, 2.0);
        match challenge {
            ChallengeKind::Blink => {
                act.left_eye_open_probability = Some(0.05);
                act.right_eye_open_probability = Some(0.05);
            }
            ChallengeKind::Smile => act.smiling_probability = Some(0.95),
            ChallengeKind::TurnLeft => act.head_euler_angle_y = 35.0,
            ChallengeKind::TurnRight => act.head_euler_angle_y = -35.0,
            ChallengeKind::Nod => act.head_euler_angle_x = 28.0,
        }
        (rest, act)
    }

    fn selfie_event(face: FacialData) -> Event {
        Event::SelfieFrame {
            face: Ok(face),
            width: FRAME_W,
            height: FRAME_H,
            luminance: BRIGHT,
        }
    }

    /// Drive a fresh session to `target` with successful inputs.
    fn advance_to(s: &mut VerificationSession, target: StageKind, t0: Instant) {
        let steps: [(StageKind, Box<dyn Fn() -> Event>); 3] = [
            (
                StageKind::AadhaarCard,
                Box::new(|| Event::DocumentNumber {
                    number: number(),
                    still: RgbImage::new(4, 4),
                }),
            ),
            (
                StageKind::AadhaarFaceDetection,
                Box::new(|| Event::DocumentFace(Ok(sample_face()))),
            ),
            (StageKind::Selfie, Box::new(|| selfie_event(sample_face()))),
        ];
        for (stage, make) in &steps {
            if s.stage_kind() == target {
                return;
            }
            assert_eq!(s.stage_kind(), *stage);
            let token = s.token();
            s.handle(token, make(), t0);
        }
        if s.stage_kind() == target {
            return;
        }
        let challenge = s.liveness_challenge().unwrap();
        let (prev, curr) = performing(challenge);
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(prev)), t0 + ms(100));
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(curr)), t0 + ms(1600));
        assert_eq!(s.stage_kind(), StageKind::FaceComparison);
        if target == StageKind::FaceComparison {
            return;
        }
        let token = s.token();
        s.handle(token, Event::CompareFaces, t0 + ms(1700));
        assert_eq!(s.stage_kind(), target);
    }

    #[test]
    fn test_scripted_success_reaches_complete_with_match() {
        let t0 = Instant::now();
        let mut s = session(t0);
        assert_eq!(s.stage_kind(), StageKind::AadhaarCard);
        assert!(s.match_score().is_none() && s.match_decision().is_none());

        let token = s.token();
        let out = s.handle(
            token,
            Event::DocumentNumber {
                number: number(),
                still: RgbImage::new(4, 4),
            },
            t0,
        );
        assert_eq!(
            out,
            Outcome::Transitioned {
                from: StageKind::AadhaarCard,
                to: StageKind::AadhaarFaceDetection
            }
        );
        assert!(s.document_still().is_some());

        let token = s.token();
        s.handle(token, Event::DocumentFace(Ok(sample_face())), t0 + ms(10));
        assert_eq!(s.stage_kind(), StageKind::Selfie);
        assert!(s.document_face().is_some());

        let token = s.token();
        s.handle(token, selfie_event(sample_face()), t0 + ms(20));
        assert_eq!(s.stage_kind(), StageKind::LivenessCheck);
        let challenge = s.liveness_challenge().unwrap();
        assert_eq!(s.challenge_started_at(), Some(t0 + ms(20)));

        let (prev, curr) = performing(challenge);
        let token = s.token();
        assert_eq!(
            s.handle(token, Event::LivenessFrame(Ok(prev)), t0 + ms(100)),
            Outcome::Unchanged
        );
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(curr)), t0 + ms(1600));
        assert_eq!(s.stage_kind(), StageKind::FaceComparison);
        assert!(s.match_score().is_none() && s.match_decision().is_none());

        let token = s.token();
        let out = s.handle(token, Event::CompareFaces, t0 + ms(1700));
        assert_eq!(
            out,
            Outcome::Transitioned {
                from: StageKind::FaceComparison,
                to: StageKind::Complete
            }
        );
        assert_eq!(s.match_decision(), Some(true));
        assert!((s.match_score().unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(s.document_number().unwrap().value, "234567890124");
        assert!(s.last_error().is_none());

        // A second comparison cannot set the decision again.
        let token = s.token();
        assert_eq!(s.handle(token, Event::CompareFaces, t0 + ms(1800)), Outcome::Ignored);
        assert!(s.deadline().is_none());
    }

    #[test]
    fn test_no_match_still_completes() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::Selfie, t0);

        // Selfie of a different person, centered and large enough.
        let mut other = sample_face();
        other.landmarks.insert(LandmarkKind::NoseBase, Point::new(200.0, 262.0));
        other.landmarks.insert(LandmarkKind::MouthLeft, Point::new(150.0, 305.0));
        other.landmarks.insert(LandmarkKind::MouthRight, Point::new(250.0, 305.0));
        other.landmarks.insert(LandmarkKind::LeftEar, Point::new(90.0, 230.0));
        let token = s.token();
        s.handle(token, selfie_event(other), t0);
        assert_eq!(s.stage_kind(), StageKind::LivenessCheck);

        let (prev, curr) = performing(s.liveness_challenge().unwrap());
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(prev)), t0 + ms(100));
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(curr)), t0 + ms(1600));
        let token = s.token();
        s.handle(token, Event::CompareFaces, t0 + ms(1700));

        assert_eq!(s.stage_kind(), StageKind::Complete);
        assert_eq!(s.match_decision(), Some(false));
        assert!(s.match_score().unwrap() < DEFAULT_MATCH_THRESHOLD);
        assert_eq!(s.take_error(), Some(VerificationError::NoMatchFound));
        assert!(s.take_error().is_none());

        s.reset(t0 + ms(2000));
        assert_eq!(s.stage_kind(), StageKind::AadhaarCard);
        assert!(s.document_number().is_none());
        assert!(s.document_face().is_none());
        assert!(s.match_score().is_none());
    }

    #[test]
    fn test_document_face_failure_reverts_to_card() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::AadhaarFaceDetection, t0);

        let token = s.token();
        let out = s.handle(token, Event::DocumentFace(Err(DetectError::NoFace)), t0);
        assert_eq!(
            out,
            Outcome::Transitioned {
                from: StageKind::AadhaarFaceDetection,
                to: StageKind::AadhaarCard
            }
        );
        assert_eq!(s.last_error(), Some(&VerificationError::NoFaceDetected));
        assert!(s.document_number().is_none());
    }

    #[test]
    fn test_rejected_number_records_error_only() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let token = s.token();
        assert_eq!(s.handle(token, Event::DocumentRejected, t0), Outcome::Unchanged);
        assert_eq!(s.stage_kind(), StageKind::AadhaarCard);
        assert_eq!(s.last_error(), Some(&VerificationError::InvalidDocumentNumber));
    }

    #[test]
    fn test_selfie_checks() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::Selfie, t0);

        let mut off_center = sample_face();
        off_center.bounding_box.x += 120.0;
        let mut small = sample_face();
        small.bounding_box = crate::types::BoundingBox {
            x: 170.0,
            y: 180.0,
            width: 60.0,
            height: 60.0,
        };

        let cases = [
            (selfie_event(off_center), VerificationError::FaceNotCentered),
            (selfie_event(small), VerificationError::FaceTooSmall),
            (
                Event::SelfieFrame {
                    face: Err(DetectError::NoFace),
                    width: FRAME_W,
                    height: FRAME_H,
                    luminance: BRIGHT,
                },
                VerificationError::NoFaceDetected,
            ),
            (
                Event::SelfieFrame {
                    face: Err(DetectError::MultipleFaces(2)),
                    width: FRAME_W,
                    height: FRAME_H,
                    luminance: BRIGHT,
                },
                VerificationError::MultipleFacesDetected,
            ),
            (
                Event::SelfieFrame {
                    face: Ok(sample_face()),
                    width: FRAME_W,
                    height: FRAME_H,
                    luminance: 10.0,
                },
                VerificationError::PoorLighting,
            ),
        ];

        for (event, expected) in cases {
            let token = s.token();
            assert_eq!(s.handle(token, event, t0), Outcome::Unchanged);
            assert_eq!(s.stage_kind(), StageKind::Selfie);
            assert_eq!(s.take_error(), Some(expected));
        }
    }

    #[test]
    fn test_stale_results_are_discarded() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let card_token = s.token();
        advance_to(&mut s, StageKind::Selfie, t0);

        // A late OCR result from the card stage must not restart anything.
        let out = s.handle(
            card_token,
            Event::DocumentNumber {
                number: number(),
                still: RgbImage::new(4, 4),
            },
            t0,
        );
        assert_eq!(out, Outcome::Stale);
        assert_eq!(s.stage_kind(), StageKind::Selfie);

        // Same stage kind, earlier visit: still stale.
        let selfie_token = s.token();
        let t1 = t0 + ms(10);
        s.poll_timers(t1 + Duration::from_secs(31));
        advance_to(&mut s, StageKind::Selfie, t1);
        assert_eq!(s.stage_kind(), StageKind::Selfie);
        assert_ne!(s.token(), selfie_token);
        assert_eq!(
            s.handle(selfie_token, selfie_event(sample_face()), t1),
            Outcome::Stale
        );
    }

    #[test]
    fn test_events_for_other_stages_are_ignored() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let token = s.token();
        assert_eq!(s.handle(token, Event::CompareFaces, t0), Outcome::Ignored);
        let token = s.token();
        assert_eq!(
            s.handle(token, Event::LivenessFrame(Ok(sample_face())), t0),
            Outcome::Ignored
        );
        assert_eq!(s.stage_kind(), StageKind::AadhaarCard);
    }

    #[test]
    fn test_provider_failure_keeps_stage() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let token = s.token();
        let out = s.handle(token, Event::ProviderFailed("ocr exited".into()), t0);
        assert_eq!(out, Outcome::Unchanged);
        assert_eq!(
            s.last_error(),
            Some(&VerificationError::SystemError("ocr exited".into()))
        );
    }

    #[test]
    fn test_timeout_resets_every_non_terminal_stage() {
        for target in [
            StageKind::AadhaarCard,
            StageKind::AadhaarFaceDetection,
            StageKind::Selfie,
            StageKind::LivenessCheck,
            StageKind::FaceComparison,
        ] {
            let t0 = Instant::now();
            let mut s = session(t0);
            advance_to(&mut s, target, t0);
            let entered = s.stage_entered_at();

            assert_eq!(s.poll_timers(entered + ms(29_000)), Outcome::Unchanged);
            assert_eq!(s.stage_kind(), target);

            let out = s.poll_timers(entered + Duration::from_secs(30));
            assert_eq!(
                out,
                Outcome::Transitioned {
                    from: target,
                    to: StageKind::AadhaarCard
                }
            );
            assert!(matches!(s.last_error(), Some(VerificationError::SystemError(_))));
            assert!(s.document_number().is_none());
        }
    }

    #[test]
    fn test_sub_second_timeout_reported_precisely() {
        let t0 = Instant::now();
        let mut s = VerificationSession::new(
            SessionConfig {
                stage_timeout: ms(250),
                ..SessionConfig::default()
            },
            Box::new(StdRng::seed_from_u64(42)),
            t0,
        );
        s.poll_timers(t0 + ms(250));
        assert_eq!(
            s.take_error(),
            Some(VerificationError::SystemError(
                "AADHAAR_CARD timed out after 250ms".into()
            ))
        );
    }

    #[test]
    fn test_completed_session_does_not_time_out() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::Complete, t0);
        assert_eq!(s.poll_timers(t0 + Duration::from_secs(120)), Outcome::Unchanged);
        assert_eq!(s.stage_kind(), StageKind::Complete);
    }

    #[test]
    fn test_timer_armed_before_transition_is_stale() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let armed = s.token();
        advance_to(&mut s, StageKind::Selfie, t0 + ms(5));
        assert_eq!(s.expire(armed, t0 + Duration::from_secs(31)), Outcome::Stale);
        assert_eq!(s.stage_kind(), StageKind::Selfie);
    }

    #[test]
    fn test_challenge_timeout_rerolls_without_failing() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::LivenessCheck, t0);
        let epoch_token = s.token();

        let later = t0 + Duration::from_secs(11);
        let token = s.token();
        let out = s.handle(token, Event::LivenessFrame(Ok(sample_face())), later);
        assert_eq!(out, Outcome::Unchanged);
        assert_eq!(s.stage_kind(), StageKind::LivenessCheck);
        assert_eq!(s.challenge_started_at(), Some(later));
        assert_eq!(s.token(), epoch_token);
        assert_eq!(s.take_error(), Some(VerificationError::LivenessCheckFailed));
    }

    #[test]
    fn test_static_samples_flagged_as_spoof() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::LivenessCheck, t0);

        let (prev, mut curr) = performing(s.liveness_challenge().unwrap());
        // Undo the landmark drift: a photo being tilted keeps eyes in place.
        curr.landmarks = prev.landmarks.clone();
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(prev)), t0 + ms(100));
        let token = s.token();
        let out = s.handle(token, Event::LivenessFrame(Ok(curr)), t0 + ms(1600));
        assert_eq!(out, Outcome::Unchanged);
        assert_eq!(s.stage_kind(), StageKind::LivenessCheck);
        assert_eq!(s.take_error(), Some(VerificationError::SpoofingDetected));
        assert_eq!(s.challenge_started_at(), Some(t0 + ms(1600)));
    }

    #[test]
    fn test_liveness_respects_min_dwell() {
        let t0 = Instant::now();
        let mut s = session(t0);
        advance_to(&mut s, StageKind::LivenessCheck, t0);
        let (prev, curr) = performing(s.liveness_challenge().unwrap());
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(prev)), t0 + ms(100));
        let token = s.token();
        s.handle(token, Event::LivenessFrame(Ok(curr)), t0 + ms(900));
        assert_eq!(s.stage_kind(), StageKind::LivenessCheck);
    }

    #[test]
    fn test_camera_per_stage() {
        assert_eq!(StageKind::AadhaarCard.camera(), Some(CameraFacing::Back));
        assert_eq!(StageKind::LivenessCheck.camera(), Some(CameraFacing::Front));
        assert_eq!(StageKind::Complete.camera(), None);
    }
}
