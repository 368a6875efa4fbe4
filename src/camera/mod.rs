//! OpenCV を使うデスクトップ側の入出力（`desktop` フィーチャ）

pub mod aruco;
pub mod capture;
pub mod face;
pub mod overlay;
pub mod pnp;

use anyhow::{bail, Context, Result};
use opencv::{
    core::{Mat, Scalar, CV_8UC3},
    prelude::*,
};

use crate::frame::Frame;

pub use aruco::ArucoDetector;
pub use capture::OpenCvCamera;
pub use face::{HaarFaceDetector, OnnxFaceEmbedder};
pub use overlay::{draw_face_box, draw_lines};
pub use pnp::OpenCvPoseSolver;

/// BGR の Mat を `Frame` に
pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    if mat.typ() != CV_8UC3 {
        bail!("Expected CV_8UC3 frame, got type {}", mat.typ());
    }
    let rows = mat.rows() as usize;
    let cols = mat.cols() as usize;
    let owned;
    let continuous = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };
    let bytes = continuous.data_bytes().context("Failed to access frame data")?;
    Frame::from_shape_vec((rows, cols, 3), bytes.to_vec()).context("Frame shape mismatch")
}

/// BGR の `Frame` を Mat に
pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    let (rows, cols, channels) = frame.dim();
    if channels != 3 {
        bail!("Expected 3-channel frame, got {}", channels);
    }
    let mut mat = Mat::new_rows_cols_with_default(rows as i32, cols as i32, CV_8UC3, Scalar::all(0.0))?;
    let standard = frame.as_standard_layout();
    let src = standard.as_slice().context("Frame is not contiguous")?;
    mat.data_bytes_mut()?.copy_from_slice(src);
    Ok(mat)
}
