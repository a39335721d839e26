use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A 2D point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    /// Linear interpolation towards `other`; `t = 0` yields `self`.
    pub fn lerp(self, other: Point, t: f32) -> Point {
        Point::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }
}

/// Axis-aligned face rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Smallest box enclosing all `points`, or `None` for an empty slice.
    pub fn enclosing(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }
}

/// Named anatomical points reported by the face detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkKind {
    LeftEye,
    RightEye,
    NoseBase,
    MouthLeft,
    MouthRight,
    MouthBottom,
    LeftEar,
    RightEar,
    LeftCheek,
    RightCheek,
}

/// Polylines tracing facial features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourKind {
    Face,
    LeftEyebrowTop,
    LeftEyebrowBottom,
    RightEyebrowTop,
    RightEyebrowBottom,
    LeftEye,
    RightEye,
    UpperLipTop,
    UpperLipBottom,
    LowerLipTop,
    LowerLipBottom,
    NoseBridge,
    NoseBottom,
    LeftCheek,
    RightCheek,
}

/// Immutable snapshot of one face-detection result.
///
/// Produced once per analysed image by the facial-feature extractor and
/// never mutated afterwards. Angles are in degrees: X is pitch, Y is yaw
/// (positive when the subject turns to their left), Z is roll.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FacialData {
    #[serde(default)]
    pub landmarks: BTreeMap<LandmarkKind, Point>,
    #[serde(default)]
    pub contours: BTreeMap<ContourKind, Vec<Point>>,
    pub bounding_box: BoundingBox,
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

impl FacialData {
    pub fn landmark(&self, kind: LandmarkKind) -> Option<Point> {
        self.landmarks.get(&kind).copied()
    }

    pub fn contour(&self, kind: ContourKind) -> Option<&[Point]> {
        self.contours.get(&kind).map(Vec::as_slice)
    }

    /// Midpoint between the two eye landmarks.
    pub fn eye_midpoint(&self) -> Option<Point> {
        let left = self.landmark(LandmarkKind::LeftEye)?;
        let right = self.landmark(LandmarkKind::RightEye)?;
        Some(left.midpoint(right))
    }

    /// Distance between the two eye landmarks.
    pub fn inter_eye_distance(&self) -> Option<f32> {
        let left = self.landmark(LandmarkKind::LeftEye)?;
        let right = self.landmark(LandmarkKind::RightEye)?;
        Some(left.distance(right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enclosing_box_covers_all_points() {
        let pts = [
            Point::new(3.0, 4.0),
            Point::new(-1.0, 10.0),
            Point::new(7.0, 2.0),
        ];
        let bbox = BoundingBox::enclosing(&pts).unwrap();
        assert_eq!(bbox.x, -1.0);
        assert_eq!(bbox.y, 2.0);
        assert_eq!(bbox.width, 8.0);
        assert_eq!(bbox.height, 8.0);
        assert!(BoundingBox::enclosing(&[]).is_none());
    }

    #[test]
    fn facial_data_json_uses_snake_case_keys() {
        let mut face = FacialData::default();
        face.landmarks.insert(LandmarkKind::NoseBase, Point::new(1.0, 2.0));
        let json = serde_json::to_string(&face).unwrap();
        assert!(json.contains("\"nose_base\""));

        let back: FacialData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, face);
    }

    #[test]
    fn inter_eye_distance_requires_both_eyes() {
        let mut face = FacialData::default();
        face.landmarks.insert(LandmarkKind::LeftEye, Point::new(0.0, 0.0));
        assert!(face.inter_eye_distance().is_none());
        face.landmarks.insert(LandmarkKind::RightEye, Point::new(3.0, 4.0));
        assert_eq!(face.inter_eye_distance(), Some(5.0));
        assert_eq!(face.eye_midpoint(), Some(Point::new(1.5, 2.0)));
    }
}
