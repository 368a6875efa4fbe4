use anyhow::{Context, Result};
use opencv::{
    calib3d,
    core::{Mat, Point2f, Point3f, Vector, CV_64F},
    prelude::*,
};
use tracing::debug;

use crate::calibration::CameraIntrinsics;
use crate::marker::pose_solver::object_points;
use crate::marker::{Pose, PoseSolver};

/// OpenCV solvePnP (IPPE_SQUARE) による正方形マーカーの姿勢推定
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvPoseSolver;

fn camera_matrix(k: &CameraIntrinsics) -> Result<Mat> {
    let rows: [[f64; 3]; 3] = [[k.fx, 0.0, k.cx], [0.0, k.fy, k.cy], [0.0, 0.0, 1.0]];
    Mat::from_slice_2d(&rows).context("Failed to build camera matrix")
}

fn read_vec3(m: &Mat) -> Result<[f64; 3]> {
    let mut v = Mat::default();
    m.convert_to(&mut v, CV_64F, 1.0, 0.0)?;
    Ok([*v.at::<f64>(0)?, *v.at::<f64>(1)?, *v.at::<f64>(2)?])
}

fn solve_pnp(corners: &[[f64; 2]; 4], marker_length: f64, k: &CameraIntrinsics) -> Result<Option<Pose>> {
    let obj: Vector<Point3f> = object_points(marker_length)
        .iter()
        .map(|p| Point3f::new(p.x as f32, p.y as f32, p.z as f32))
        .collect();
    let img: Vector<Point2f> = corners.iter().map(|c| Point2f::new(c[0] as f32, c[1] as f32)).collect();
    let camera = camera_matrix(k)?;
    let dist = Mat::from_slice(&k.dist[..])?.try_clone()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let ok = calib3d::solve_pnp(
        &obj,
        &img,
        &camera,
        &dist,
        &mut rvec,
        &mut tvec,
        false,
        calib3d::SOLVEPNP_IPPE_SQUARE,
    )
    .context("solvePnP failed")?;
    if !ok {
        return Ok(None);
    }

    let pose = Pose::from_rvec_tvec(read_vec3(&rvec)?, read_vec3(&tvec)?);
    if pose.translation.z <= 0.0 || !pose.translation.iter().all(|v| v.is_finite()) {
        return Ok(None);
    }
    Ok(Some(pose))
}

impl PoseSolver for OpenCvPoseSolver {
    fn solve(&self, corners: &[[f64; 2]; 4], marker_length: f64, intrinsics: &CameraIntrinsics) -> Option<Pose> {
        if marker_length <= 0.0 {
            return None;
        }
        match solve_pnp(corners, marker_length, intrinsics) {
            Ok(pose) => pose,
            Err(e) => {
                debug!("{:#}", e);
                None
            }
        }
    }
}
