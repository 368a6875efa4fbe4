pub mod pose_solver;
pub mod tracker;

use anyhow::Result;
use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::calibration::CameraIntrinsics;
use crate::frame::Frame;

pub use pose_solver::SquarePoseSolver;
pub use tracker::{erase_markers, MarkerTracker, TrackedFrame};

pub type MarkerId = i32;

/// 検出されたマーカー（画像上の四隅、左上から時計回り）
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: MarkerId,
    pub corners: [[f64; 2]; 4],
}

/// カメラ座標系（右手系, Y下, +Z前方）でのマーカー姿勢
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    /// 回転ベクトル (Rodrigues) から
    pub fn from_rvec_tvec(rvec: [f64; 3], tvec: [f64; 3]) -> Self {
        let rotation = Rotation3::from_scaled_axis(Vector3::from(rvec)).into_inner();
        Self { rotation, translation: Vector3::from(tvec) }
    }

    pub fn rvec(&self) -> [f64; 3] {
        let axis = Rotation3::from_matrix_unchecked(self.rotation).scaled_axis();
        [axis.x, axis.y, axis.z]
    }
}

/// フィデューシャル検出バックエンド
pub trait MarkerDetector {
    fn detect_markers(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>>;
}

/// 四隅 → 姿勢。四隅の順は `pose_solver::object_points` と同じ。
pub trait PoseSolver {
    fn solve(&self, corners: &[[f64; 2]; 4], marker_length: f64, intrinsics: &CameraIntrinsics) -> Option<Pose>;
}
