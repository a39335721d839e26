//! Liveness detection: active challenges plus a passive stability gate.
//!
//! The active part asks the subject to perform a randomly chosen action
//! (blink, smile, turn, nod) and watches consecutive detection samples for it.
//! A minimum dwell time keeps a face that already happens to be turned or
//! smiling when the challenge starts from passing instantly.
//!
//! The passive part operates on the same samples. A static photograph or
//! printed image produces near-identical eye positions across consecutive
//! frames, while a live subject shows involuntary drift even when holding
//! still. It adds no inference and no user interaction.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, static images held in front of the
//!   camera, accidental triggers from a pose held before the challenge.
//! - **Does not block:** video replay attacks, high-quality 3D masks.

use std::fmt;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::types::{FacialData, LandmarkKind};

/// Time a challenge must have been shown before it can pass.
pub const MIN_DWELL: Duration = Duration::from_millis(1500);

const BLINK_OPEN_THRESHOLD: f32 = 0.7;
const BLINK_CLOSED_THRESHOLD: f32 = 0.3;
const SMILE_THRESHOLD: f32 = 0.8;
const TURN_YAW_DEGREES: f32 = 25.0;
const NOD_PITCH_DEGREES: f32 = 20.0;
const NOD_REST_PITCH_DEGREES: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Blink,
    Smile,
    TurnLeft,
    TurnRight,
    Nod,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 5] = [
        ChallengeKind::Blink,
        ChallengeKind::Smile,
        ChallengeKind::TurnLeft,
        ChallengeKind::TurnRight,
        ChallengeKind::Nod,
    ];

    /// Pick a challenge uniformly at random.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&ChallengeKind::Blink)
    }

    /// Prompt shown to the subject.
    pub fn instruction(&self) -> &'static str {
        match self {
            ChallengeKind::Blink => "Blink your eyes",
            ChallengeKind::Smile => "Smile",
            ChallengeKind::TurnLeft => "Turn your head to the left",
            ChallengeKind::TurnRight => "Turn your head to the right",
            ChallengeKind::Nod => "Nod your head",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeKind::Blink => "blink",
            ChallengeKind::Smile => "smile",
            ChallengeKind::TurnLeft => "turn_left",
            ChallengeKind::TurnRight => "turn_right",
            ChallengeKind::Nod => "nod",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Passed,
}

/// Decide whether `current` (following `previous`) completes `challenge`.
///
/// `elapsed` is measured from the moment the challenge was issued.
pub fn evaluate(
    challenge: ChallengeKind,
    previous: &FacialData,
    current: &FacialData,
    elapsed: Duration,
) -> Decision {
    if elapsed < MIN_DWELL {
        return Decision::Pending;
    }

    let passed = match challenge {
        ChallengeKind::Blink => {
            either_eye(previous, |p| p > BLINK_OPEN_THRESHOLD)
                && either_eye(current, |p| p < BLINK_CLOSED_THRESHOLD)
        }
        ChallengeKind::Smile => current
            .smiling_probability
            .is_some_and(|p| p > SMILE_THRESHOLD),
        ChallengeKind::TurnLeft => current.head_euler_angle_y > TURN_YAW_DEGREES,
        ChallengeKind::TurnRight => current.head_euler_angle_y < -TURN_YAW_DEGREES,
        ChallengeKind::Nod => {
            current.head_euler_angle_x > NOD_PITCH_DEGREES
                && previous.head_euler_angle_x < NOD_REST_PITCH_DEGREES
        }
    };

    if passed {
        Decision::Passed
    } else {
        Decision::Pending
    }
}

fn either_eye(face: &FacialData, pred: impl Fn(f32) -> bool) -> bool {
    face.left_eye_open_probability.is_some_and(&pred)
        || face.right_eye_open_probability.is_some_and(&pred)
}

// ── Passive stability ─────────────────────────────────────────────────────────

/// Result of a landmark stability liveness check.
#[derive(Debug, Clone)]
pub struct StabilityResult {
    /// Whether the samples passed (true = likely live).
    pub is_live: bool,
    /// Mean Euclidean displacement of the eye landmarks across consecutive samples.
    pub mean_eye_displacement: f32,
    /// Number of sample pairs that carried both eye landmarks.
    pub pairs_analysed: usize,
}

/// Default minimum eye displacement (pixels) below which samples are
/// considered suspiciously static. Sensor noise on a printed photo stays
/// well under this; natural micro-movement at 30 fps stays well above it.
pub const DEFAULT_MIN_EYE_DISPLACEMENT: f32 = 0.8;

/// Check whether consecutive samples show enough eye movement to indicate
/// a live subject.
///
/// Pairs where either sample lacks an eye landmark are skipped. Fewer than
/// one usable pair passes through, since nothing can be concluded.
pub fn check_landmark_stability(samples: &[FacialData], min_displacement: f32) -> StabilityResult {
    let mut total_displacement = 0.0f32;
    let mut pair_count = 0usize;

    for pair in samples.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        let (Some(pl), Some(pr), Some(cl), Some(cr)) = (
            prev.landmark(LandmarkKind::LeftEye),
            prev.landmark(LandmarkKind::RightEye),
            curr.landmark(LandmarkKind::LeftEye),
            curr.landmark(LandmarkKind::RightEye),
        ) else {
            continue;
        };

        total_displacement += (pl.distance(cl) + pr.distance(cr)) / 2.0;
        pair_count += 1;
    }

    if pair_count == 0 {
        return StabilityResult {
            is_live: true,
            mean_eye_displacement: 0.0,
            pairs_analysed: 0,
        };
    }

    let mean = total_displacement / pair_count as f32;
    StabilityResult {
        is_live: mean >= min_displacement,
        mean_eye_displacement: mean,
        pairs_analysed: pair_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    const AFTER_DWELL: Duration = Duration::from_millis(2000);

    fn sample() -> FacialData {
        FacialData::default()
    }

    fn eyes(left_open: f32, right_open: f32) -> FacialData {
        FacialData {
            left_eye_open_probability: Some(left_open),
            right_eye_open_probability: Some(right_open),
            ..sample()
        }
    }

    fn pose(pitch: f32, yaw: f32) -> FacialData {
        FacialData {
            head_euler_angle_x: pitch,
            head_euler_angle_y: yaw,
            ..sample()
        }
    }

    fn with_eyes_at(left: (f32, f32), right: (f32, f32)) -> FacialData {
        let mut face = sample();
        face.landmarks.insert(LandmarkKind::LeftEye, Point::new(left.0, left.1));
        face.landmarks.insert(LandmarkKind::RightEye, Point::new(right.0, right.1));
        face
    }

    #[test]
    fn test_min_dwell_blocks_every_challenge() {
        let extreme_prev = FacialData {
            left_eye_open_probability: Some(1.0),
            right_eye_open_probability: Some(1.0),
            head_euler_angle_x: 0.0,
            ..sample()
        };
        let extreme_curr = FacialData {
            left_eye_open_probability: Some(0.0),
            right_eye_open_probability: Some(0.0),
            smiling_probability: Some(1.0),
            head_euler_angle_x: 60.0,
            head_euler_angle_y: 60.0,
            ..sample()
        };
        for challenge in ChallengeKind::ALL {
            for ms in [0u64, 1, 500, 1499] {
                let d = evaluate(challenge, &extreme_prev, &extreme_curr, Duration::from_millis(ms));
                assert_eq!(d, Decision::Pending, "{challenge} passed at {ms} ms");
            }
        }
    }

    #[test]
    fn test_dwell_boundary_is_inclusive() {
        let d = evaluate(ChallengeKind::TurnLeft, &pose(0.0, 0.0), &pose(0.0, 30.0), MIN_DWELL);
        assert_eq!(d, Decision::Passed);
    }

    #[test]
    fn test_blink() {
        assert_eq!(
            evaluate(ChallengeKind::Blink, &eyes(0.9, 0.9), &eyes(0.1, 0.1), AFTER_DWELL),
            Decision::Passed
        );
        // One eye suffices on each side.
        assert_eq!(
            evaluate(ChallengeKind::Blink, &eyes(0.5, 0.8), &eyes(0.6, 0.2), AFTER_DWELL),
            Decision::Passed
        );
        // Eyes never opened.
        assert_eq!(
            evaluate(ChallengeKind::Blink, &eyes(0.5, 0.5), &eyes(0.1, 0.1), AFTER_DWELL),
            Decision::Pending
        );
        // Missing probabilities never pass.
        assert_eq!(
            evaluate(ChallengeKind::Blink, &sample(), &sample(), AFTER_DWELL),
            Decision::Pending
        );
    }

    #[test]
    fn test_smile() {
        let smiling = FacialData {
            smiling_probability: Some(0.85),
            ..sample()
        };
        let neutral = FacialData {
            smiling_probability: Some(0.8),
            ..sample()
        };
        assert_eq!(evaluate(ChallengeKind::Smile, &sample(), &smiling, AFTER_DWELL), Decision::Passed);
        assert_eq!(evaluate(ChallengeKind::Smile, &sample(), &neutral, AFTER_DWELL), Decision::Pending);
    }

    #[test]
    fn test_turns() {
        let rest = pose(0.0, 0.0);
        assert_eq!(evaluate(ChallengeKind::TurnLeft, &rest, &pose(0.0, 26.0), AFTER_DWELL), Decision::Passed);
        assert_eq!(evaluate(ChallengeKind::TurnLeft, &rest, &pose(0.0, -26.0), AFTER_DWELL), Decision::Pending);
        assert_eq!(evaluate(ChallengeKind::TurnRight, &rest, &pose(0.0, -26.0), AFTER_DWELL), Decision::Passed);
        assert_eq!(evaluate(ChallengeKind::TurnRight, &rest, &pose(0.0, -25.0), AFTER_DWELL), Decision::Pending);
    }

    #[test]
    fn test_nod_needs_rest_then_tilt() {
        assert_eq!(evaluate(ChallengeKind::Nod, &pose(5.0, 0.0), &pose(22.0, 0.0), AFTER_DWELL), Decision::Passed);
        // Head already tilted in the previous sample.
        assert_eq!(evaluate(ChallengeKind::Nod, &pose(15.0, 0.0), &pose(22.0, 0.0), AFTER_DWELL), Decision::Pending);
        assert_eq!(evaluate(ChallengeKind::Nod, &pose(5.0, 0.0), &pose(18.0, 0.0), AFTER_DWELL), Decision::Pending);
    }

    #[test]
    fn test_random_challenge_covers_all_kinds() {
        let mut rng = StdRng::seed_from_u64(7);
        let seen: HashSet<_> = (0..200).map(|_| ChallengeKind::random(&mut rng)).collect();
        assert_eq!(seen.len(), ChallengeKind::ALL.len());
    }

    #[test]
    fn test_stability_passes_with_too_few_samples() {
        let result = check_landmark_stability(&[], DEFAULT_MIN_EYE_DISPLACEMENT);
        assert!(result.is_live);
        let one = [with_eyes_at((100.0, 50.0), (140.0, 50.0))];
        let result = check_landmark_stability(&one, DEFAULT_MIN_EYE_DISPLACEMENT);
        assert!(result.is_live);
        assert_eq!(result.pairs_analysed, 0);
    }

    #[test]
    fn test_stability_rejects_static_samples() {
        let f = with_eyes_at((100.0, 50.0), (140.0, 50.0));
        let samples = [f.clone(), f.clone(), f];
        let result = check_landmark_stability(&samples, DEFAULT_MIN_EYE_DISPLACEMENT);
        assert!(!result.is_live);
        assert_eq!(result.pairs_analysed, 2);
        assert!(result.mean_eye_displacement < 1e-6);
    }

    #[test]
    fn test_stability_accepts_natural_movement() {
        let samples = [
            with_eyes_at((100.0, 50.0), (140.0, 50.0)),
            with_eyes_at((101.2, 50.8), (141.0, 50.6)),
            with_eyes_at((100.5, 49.5), (140.3, 49.8)),
        ];
        let result = check_landmark_stability(&samples, DEFAULT_MIN_EYE_DISPLACEMENT);
        assert!(result.is_live);
    }

    #[test]
    fn test_stability_displacement_is_mean_of_both_eyes() {
        // Right eye moves 3 right, 4 down (5 px); left eye is still.
        let samples = [
            with_eyes_at((100.0, 50.0), (140.0, 50.0)),
            with_eyes_at((100.0, 50.0), (143.0, 54.0)),
        ];
        let result = check_landmark_stability(&samples, DEFAULT_MIN_EYE_DISPLACEMENT);
        assert!((result.mean_eye_displacement - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_stability_skips_samples_without_eyes() {
        let samples = [
            with_eyes_at((100.0, 50.0), (140.0, 50.0)),
            sample(),
            with_eyes_at((100.0, 50.0), (140.0, 50.0)),
        ];
        let result = check_landmark_stability(&samples, DEFAULT_MIN_EYE_DISPLACEMENT);
        assert_eq!(result.pairs_analysed, 0);
        assert!(result.is_live);
    }
}
