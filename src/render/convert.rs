//! ビジョン座標系 → レンダラ座標系
//!
//! OpenCV: 右手系, Y下, カメラは+Z方向を見る
//! レンダラ: 右手系, Y上, カメラは-Z方向を見る
//!
//! マーカーが世界原点なので、カメラの世界姿勢は
//! (軸反転したマーカー姿勢) の逆変換になる。

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::marker::Pose;

/// (R, t) → レンダラのカメラ変換 (4x4, カメラ→世界)
pub fn to_render_camera(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    // Y, Z 行を反転
    let mut r = *rotation;
    let mut t = *translation;
    for row in 1..3 {
        for col in 0..3 {
            r[(row, col)] = -r[(row, col)];
        }
        t[row] = -t[row];
    }

    // 剛体変換の逆: [R^T | -R^T t]
    let r_inv = r.transpose();
    let t_inv = -(r_inv * t);

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_inv);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_inv);
    m
}

pub fn pose_to_render_camera(pose: &Pose) -> Matrix4<f64> {
    to_render_camera(&pose.rotation, &pose.translation)
}
