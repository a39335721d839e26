//! Geometric face similarity between a document photo and a selfie.
//!
//! The two images come from different cameras at different distances and
//! resolutions, so every sub-score works on normalized geometry:
//! landmarks relative to the eyes, contours relative to the face outline,
//! proportions as ratios of the inter-eye distance. Four sub-scores are
//! combined with fixed weights; a sub-score without usable data drops out
//! of both numerator and denominator instead of counting as zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, ContourKind, FacialData, LandmarkKind, Point};

/// Default score at or above which two faces are considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

const KEY_LANDMARKS: [LandmarkKind; 9] = [
    LandmarkKind::LeftEye,
    LandmarkKind::RightEye,
    LandmarkKind::NoseBase,
    LandmarkKind::MouthLeft,
    LandmarkKind::MouthRight,
    LandmarkKind::LeftEar,
    LandmarkKind::RightEar,
    LandmarkKind::LeftCheek,
    LandmarkKind::RightCheek,
];

const MIN_COMMON_LANDMARKS: usize = 5;

const KEY_CONTOURS: [ContourKind; 13] = [
    ContourKind::Face,
    ContourKind::LeftEyebrowTop,
    ContourKind::LeftEyebrowBottom,
    ContourKind::RightEyebrowTop,
    ContourKind::RightEyebrowBottom,
    ContourKind::LeftEye,
    ContourKind::RightEye,
    ContourKind::UpperLipTop,
    ContourKind::UpperLipBottom,
    ContourKind::LowerLipTop,
    ContourKind::LowerLipBottom,
    ContourKind::NoseBridge,
    ContourKind::NoseBottom,
];

const MAX_RESAMPLE_POINTS: usize = 30;

/// Normalized distance at which a geometric sub-score reaches zero is 1/5.
const DISTANCE_PENALTY: f32 = 5.0;

const MAX_ANGLE_DIFF_DEGREES: f32 = 30.0;
const PITCH_WEIGHT: f32 = 0.3;
const YAW_WEIGHT: f32 = 0.5;
const ROLL_WEIGHT: f32 = 0.2;

const EPSILON: f32 = 1e-6;

/// Relative importance of the four sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub landmark: f32,
    pub contour: f32,
    pub proportion: f32,
    pub orientation: f32,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            landmark: 0.35,
            contour: 0.25,
            proportion: 0.25,
            orientation: 0.15,
        }
    }
}

/// Every sub-score plus the combined result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub landmark: Option<f32>,
    pub contour: Option<f32>,
    pub proportion: Option<f32>,
    pub orientation: Option<f32>,
    /// Weighted mean of the available sub-scores; `None` when none are.
    pub overall: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityScorer {
    weights: SimilarityWeights,
}

impl SimilarityScorer {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &SimilarityWeights {
        &self.weights
    }

    /// Combined similarity in [0, 1]; 0 when nothing is comparable.
    pub fn score(&self, reference: &FacialData, candidate: &FacialData) -> f32 {
        self.breakdown(reference, candidate).overall.unwrap_or(0.0)
    }

    pub fn breakdown(&self, reference: &FacialData, candidate: &FacialData) -> SimilarityBreakdown {
        let landmark = landmark_score(reference, candidate);
        let contour = contour_score(reference, candidate);
        let proportion = proportion_score(reference, candidate);
        let orientation = orientation_score(reference, candidate);

        let parts = [
            (landmark, self.weights.landmark),
            (contour, self.weights.contour),
            (proportion, self.weights.proportion),
            (orientation, self.weights.orientation),
        ];

        let mut weighted = 0.0f32;
        let mut total_weight = 0.0f32;
        for (score, weight) in parts {
            if let Some(s) = score {
                weighted += s * weight;
                total_weight += weight;
            }
        }

        let overall = (total_weight > EPSILON).then(|| (weighted / total_weight).clamp(0.0, 1.0));

        SimilarityBreakdown {
            landmark,
            contour,
            proportion,
            orientation,
            overall,
        }
    }
}

fn distance_to_similarity(distance: f32) -> f32 {
    (1.0 - distance * DISTANCE_PENALTY).max(0.0)
}

// ── Landmarks ─────────────────────────────────────────────────────────────────

/// Landmarks translated to the eye midpoint and scaled by the inter-eye
/// distance, so position, scale and image resolution drop out.
///
/// `None` without both eyes or when the eyes coincide.
pub fn normalize_landmarks(face: &FacialData) -> Option<BTreeMap<LandmarkKind, Point>> {
    let origin = face.eye_midpoint()?;
    let scale = face.inter_eye_distance()?;
    if scale < EPSILON {
        return None;
    }
    Some(
        face.landmarks
            .iter()
            .map(|(kind, p)| {
                (
                    *kind,
                    Point::new((p.x - origin.x) / scale, (p.y - origin.y) / scale),
                )
            })
            .collect(),
    )
}

fn landmark_score(a: &FacialData, b: &FacialData) -> Option<f32> {
    let common: Vec<LandmarkKind> = KEY_LANDMARKS
        .iter()
        .copied()
        .filter(|k| a.landmarks.contains_key(k) && b.landmarks.contains_key(k))
        .collect();
    if common.len() < MIN_COMMON_LANDMARKS {
        return None;
    }

    let na = normalize_landmarks(a)?;
    let nb = normalize_landmarks(b)?;

    let total: f32 = common.iter().map(|k| na[k].distance(nb[k])).sum();
    Some(distance_to_similarity(total / common.len() as f32))
}

// ── Contours ──────────────────────────────────────────────────────────────────

/// Center and scale taken from the face-outline contour's bounding box.
fn contour_frame(face: &FacialData) -> Option<(Point, f32)> {
    let outline = face.contour(ContourKind::Face)?;
    let bbox = BoundingBox::enclosing(outline)?;
    let scale = bbox.width.max(bbox.height);
    if scale < EPSILON {
        return None;
    }
    Some((bbox.center(), scale))
}

fn normalize_points(points: &[Point], center: Point, scale: f32) -> Vec<Point> {
    points
        .iter()
        .map(|p| Point::new((p.x - center.x) / scale, (p.y - center.y) / scale))
        .collect()
}

fn contour_score(a: &FacialData, b: &FacialData) -> Option<f32> {
    let (center_a, scale_a) = contour_frame(a)?;
    let (center_b, scale_b) = contour_frame(b)?;

    let mut scores = Vec::with_capacity(KEY_CONTOURS.len());
    for kind in KEY_CONTOURS {
        let (Some(pa), Some(pb)) = (a.contour(kind), b.contour(kind)) else {
            continue;
        };
        if pa.len() < 2 || pb.len() < 2 {
            continue;
        }

        let n = pa.len().max(pb.len()).min(MAX_RESAMPLE_POINTS);
        let ra = resample_points(&normalize_points(pa, center_a, scale_a), n);
        let rb = resample_points(&normalize_points(pb, center_b, scale_b), n);

        let total: f32 = ra.iter().zip(&rb).map(|(p, q)| p.distance(*q)).sum();
        scores.push(distance_to_similarity(total / n as f32));
    }

    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    }
}

/// Resample a polyline to `n` points spaced uniformly by arc length.
///
/// The first and last output points are exactly the input endpoints.
/// Inputs with fewer than two points, or `n < 2`, are padded or truncated
/// by repeating the available endpoints.
pub fn resample_points(points: &[Point], n: usize) -> Vec<Point> {
    let (Some(&first), Some(&last)) = (points.first(), points.last()) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![first];
    }

    let mut cumulative = Vec::with_capacity(points.len());
    let mut total = 0.0f32;
    cumulative.push(0.0f32);
    for pair in points.windows(2) {
        total += pair[0].distance(pair[1]);
        cumulative.push(total);
    }

    let mut out = Vec::with_capacity(n);
    out.push(first);

    let mut segment = 0usize;
    for i in 1..n - 1 {
        if total < EPSILON {
            out.push(first);
            continue;
        }
        let target = total * i as f32 / (n - 1) as f32;
        while segment + 1 < cumulative.len() - 1 && cumulative[segment + 1] < target {
            segment += 1;
        }
        let seg_start = cumulative[segment];
        let seg_len = cumulative[segment + 1] - seg_start;
        let t = if seg_len < EPSILON {
            0.0
        } else {
            ((target - seg_start) / seg_len).clamp(0.0, 1.0)
        };
        out.push(points[segment].lerp(points[segment + 1], t));
    }

    out.push(last);
    out
}

// ── Proportions ───────────────────────────────────────────────────────────────

fn proportions(face: &FacialData) -> BTreeMap<&'static str, f32> {
    let mut ratios = BTreeMap::new();
    let (Some(eye_mid), Some(ied)) = (face.eye_midpoint(), face.inter_eye_distance()) else {
        return ratios;
    };
    if ied < EPSILON {
        return ratios;
    }

    let nose = face.landmark(LandmarkKind::NoseBase);
    let mouth_left = face.landmark(LandmarkKind::MouthLeft);
    let mouth_right = face.landmark(LandmarkKind::MouthRight);
    let mouth_mid = match (mouth_left, mouth_right) {
        (Some(l), Some(r)) => Some(l.midpoint(r)),
        _ => face.landmark(LandmarkKind::MouthBottom),
    };

    if let Some(nose) = nose {
        ratios.insert("eye_to_nose", eye_mid.distance(nose) / ied);
    }
    if let (Some(l), Some(r)) = (mouth_left, mouth_right) {
        ratios.insert("mouth_width", l.distance(r) / ied);
    }
    if face.bounding_box.width > EPSILON {
        ratios.insert("face_width", face.bounding_box.width / ied);
    }
    if face.bounding_box.height > EPSILON {
        ratios.insert("face_height", face.bounding_box.height / ied);
    }
    if let Some(mouth) = mouth_mid {
        ratios.insert("eye_to_mouth_vertical", (mouth.y - eye_mid.y).abs() / ied);
        if let Some(nose) = nose {
            ratios.insert("nose_to_mouth_vertical", (mouth.y - nose.y).abs() / ied);
        }
    }
    if let Some(nose) = nose {
        ratios.insert("eye_to_nose_vertical", (nose.y - eye_mid.y).abs() / ied);
    }

    ratios
}

fn proportion_score(a: &FacialData, b: &FacialData) -> Option<f32> {
    let pa = proportions(a);
    let pb = proportions(b);

    let sims: Vec<f32> = pa
        .iter()
        .filter_map(|(name, &ra)| {
            let rb = *pb.get(name)?;
            let (lo, hi) = (ra.min(rb), ra.max(rb));
            if hi < EPSILON {
                return None;
            }
            Some(lo / hi)
        })
        .collect();

    if sims.is_empty() {
        None
    } else {
        Some(sims.iter().sum::<f32>() / sims.len() as f32)
    }
}

// ── Orientation ───────────────────────────────────────────────────────────────

fn angle_similarity(diff: f32) -> f32 {
    1.0 - (diff / MAX_ANGLE_DIFF_DEGREES).min(1.0)
}

fn orientation_score(a: &FacialData, b: &FacialData) -> Option<f32> {
    let angles = [
        a.head_euler_angle_x,
        a.head_euler_angle_y,
        a.head_euler_angle_z,
        b.head_euler_angle_x,
        b.head_euler_angle_y,
        b.head_euler_angle_z,
    ];
    if angles.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let pitch = (a.head_euler_angle_x - b.head_euler_angle_x).abs();
    // A mirrored front camera flips the sign of yaw.
    let yaw = (a.head_euler_angle_y - b.head_euler_angle_y)
        .abs()
        .min((a.head_euler_angle_y + b.head_euler_angle_y).abs());
    let roll = (a.head_euler_angle_z - b.head_euler_angle_z).abs();

    Some(
        angle_similarity(pitch) * PITCH_WEIGHT
            + angle_similarity(yaw) * YAW_WEIGHT
            + angle_similarity(roll) * ROLL_WEIGHT,
    )
}
