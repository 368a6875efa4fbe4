//! 正方形マーカー1枚の姿勢推定 (PnP)
//!
//! 四隅を歪み補正して正規化座標に直し、平面ホモグラフィ (DLT) から
//! 初期姿勢を取り出してから直交反復法 (Lu et al. 2000) で詰める。

use nalgebra::{Matrix3, SMatrix, Vector3};

use super::{Pose, PoseSolver};
use crate::calibration::CameraIntrinsics;

const REFINE_ITERATIONS: usize = 50;

/// 一辺 `marker_length` の正方形マーカーの物体座標
/// (左上, 右上, 右下, 左下) を z=0 平面に置く
pub fn object_points(marker_length: f64) -> [Vector3<f64>; 4] {
    let s = marker_length / 2.0;
    [
        Vector3::new(-s, s, 0.0),
        Vector3::new(s, s, 0.0),
        Vector3::new(s, -s, 0.0),
        Vector3::new(-s, -s, 0.0),
    ]
}

/// nalgebra だけで解く正方形マーカー用ソルバ
#[derive(Debug, Clone, Copy, Default)]
pub struct SquarePoseSolver;

impl PoseSolver for SquarePoseSolver {
    fn solve(&self, corners: &[[f64; 2]; 4], marker_length: f64, intrinsics: &CameraIntrinsics) -> Option<Pose> {
        solve_square(corners, marker_length, intrinsics)
    }
}

/// マーカー四隅から姿勢を解く。解けなければ None。
pub fn solve_square(
    corners: &[[f64; 2]; 4],
    marker_length: f64,
    intrinsics: &CameraIntrinsics,
) -> Option<Pose> {
    if marker_length <= 0.0 {
        return None;
    }
    let obj = object_points(marker_length);

    // ピクセル → 歪み補正 → 正規化カメラ座標
    let mut norm = [[0.0f64; 2]; 4];
    for (n, c) in norm.iter_mut().zip(corners.iter()) {
        if !c[0].is_finite() || !c[1].is_finite() {
            return None;
        }
        let (u, v) = intrinsics.undistort_point(c[0], c[1]);
        *n = [(u - intrinsics.cx) / intrinsics.fx, (v - intrinsics.cy) / intrinsics.fy];
    }

    let h = homography(&obj, &norm)?;
    let (r0, t0) = decompose(&h)?;

    let rays = norm.map(|p| Vector3::new(p[0], p[1], 1.0));
    let (rotation, translation) = orthogonal_iteration(&rays, &obj, r0, t0);

    if translation.z <= 0.0 || !translation.iter().all(|v| v.is_finite()) {
        return None;
    }
    if !rotation.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Pose { rotation, translation })
}

/// 物体平面 (X, Y) → 正規化画像座標 の 3x3 ホモグラフィ
fn homography(obj: &[Vector3<f64>; 4], img: &[[f64; 2]; 4]) -> Option<Matrix3<f64>> {
    let mut a = SMatrix::<f64, 8, 9>::zeros();
    for i in 0..4 {
        let (x, y) = (obj[i].x, obj[i].y);
        let (u, v) = (img[i][0], img[i][1]);
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        a[(r, 8)] = -u;
        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        a[(r + 1, 8)] = -v;
    }

    // A^T A の最小固有値に対応する固有ベクトルが解
    let ata = a.transpose() * a;
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;

    // 4点が退化（共線など）していると2番目に小さい固有値も0付近になる
    let mut sorted: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted[1] < 1e-12 * sorted[8].max(1e-300) {
        return None;
    }

    let h = eig.eigenvectors.column(min_idx);
    let m = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    if m.iter().all(|v| v.is_finite()) {
        Some(m)
    } else {
        None
    }
}

/// H = λ [r1 r2 t] から初期の R, t を取り出す
fn decompose(h: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let c0 = h.column(0).into_owned();
    let c1 = h.column(1).into_owned();
    let c2 = h.column(2).into_owned();

    let mut scale = (c0.norm() + c1.norm()) / 2.0;
    if scale < 1e-12 {
        return None;
    }
    // マーカーはカメラ前方 (t.z > 0)
    if c2.z < 0.0 {
        scale = -scale;
    }
    let r1 = c0 / scale;
    let r2 = c1 / scale;
    let r3 = r1.cross(&r2);
    let raw = Matrix3::from_columns(&[r1, r2, r3]);
    Some((project_to_so3(&raw), c2 / scale))
}

/// SVD で SO(3) に射影（det = +1 を保証）
fn project_to_so3(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        for i in 0..3 {
            u_fixed[(i, 2)] = -u_fixed[(i, 2)];
        }
        r = u_fixed * v_t;
    }
    r
}

/// 直交反復法による物体空間誤差の最小化
fn orthogonal_iteration(
    rays: &[Vector3<f64>; 4],
    obj: &[Vector3<f64>; 4],
    r_init: Matrix3<f64>,
    t_init: Vector3<f64>,
) -> (Matrix3<f64>, Vector3<f64>) {
    let n = rays.len() as f64;
    let f_ops: Vec<Matrix3<f64>> = rays.iter().map(|v| (v * v.transpose()) / v.dot(v)).collect();

    let p_mean = obj.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let f_mean = f_ops.iter().fold(Matrix3::zeros(), |acc, f| acc + f) / n;
    let Some(m1_inv) = (Matrix3::identity() - f_mean).try_inverse() else {
        return (r_init, t_init);
    };

    let mut r = r_init;
    let mut t = t_init;
    for _ in 0..REFINE_ITERATIONS {
        let mut m2 = Vector3::zeros();
        for (f, p) in f_ops.iter().zip(obj.iter()) {
            let rp = r * p;
            m2 += (f * rp - rp) / n;
        }
        t = m1_inv * m2;

        let q: Vec<Vector3<f64>> = f_ops
            .iter()
            .zip(obj.iter())
            .map(|(f, p)| f * (r * p + t))
            .collect();
        let q_mean = q.iter().fold(Vector3::zeros(), |acc, v| acc + v) / n;

        let mut m3 = Matrix3::zeros();
        for (qi, p) in q.iter().zip(obj.iter()) {
            m3 += (qi - q_mean) * (p - p_mean).transpose();
        }
        r = project_to_so3(&m3);
    }

    // 最終回転に合わせて並進を更新
    let mut m2 = Vector3::zeros();
    for (f, p) in f_ops.iter().zip(obj.iter()) {
        let rp = r * p;
        m2 += (f * rp - rp) / n;
    }
    t = m1_inv * m2;
    (r, t)
}

/// 物体点を画像に投影（歪み込み）
pub fn project(pose: &Pose, point: &Vector3<f64>, intrinsics: &CameraIntrinsics) -> [f64; 2] {
    let pc = pose.rotation * point + pose.translation;
    let (u, v) = intrinsics.distort_normalized(pc.x / pc.z, pc.y / pc.z);
    [u, v]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_corners(pose: &Pose, k: &CameraIntrinsics, len: f64) -> [[f64; 2]; 4] {
        object_points(len).map(|p| project(pose, &p, k))
    }

    #[test]
    fn test_recovers_frontal_pose() {
        let k = CameraIntrinsics::fallback(1280, 720);
        let truth = Pose::from_rvec_tvec([0.0, 0.0, 0.0], [0.0, 0.0, 1.0]);
        let corners = synthetic_corners(&truth, &k, 0.19);
        let pose = solve_square(&corners, 0.19, &k).expect("frontal marker must solve");
        assert!((pose.translation - truth.translation).norm() < 1e-6, "t = {}", pose.translation);
        assert!((pose.rotation - truth.rotation).norm() < 1e-6);
    }

    #[test]
    fn test_recovers_oblique_pose() {
        let k = CameraIntrinsics::fallback(1280, 720);
        let truth = Pose::from_rvec_tvec([0.35, -0.25, 0.6], [0.08, -0.05, 1.4]);
        let corners = synthetic_corners(&truth, &k, 0.19);
        let pose = solve_square(&corners, 0.19, &k).expect("oblique marker must solve");
        assert!((pose.translation - truth.translation).norm() < 1e-4, "t = {}", pose.translation);
        assert!((pose.rotation - truth.rotation).norm() < 1e-4, "R = {}", pose.rotation);
    }

    #[test]
    fn test_recovers_pose_with_distortion() {
        let k = CameraIntrinsics {
            dist: [-0.2, 0.05, 0.0, 0.0, 0.0],
            ..CameraIntrinsics::fallback(1280, 720)
        };
        let truth = Pose::from_rvec_tvec([0.1, 0.2, -0.1], [-0.1, 0.05, 0.9]);
        let corners = synthetic_corners(&truth, &k, 0.19);
        let pose = solve_square(&corners, 0.19, &k).expect("distorted marker must solve");
        assert!((pose.translation - truth.translation).norm() < 1e-4);
    }

    #[test]
    fn test_degenerate_corners_rejected() {
        let k = CameraIntrinsics::fallback(640, 480);
        let corners = [[100.0, 100.0], [200.0, 100.0], [300.0, 100.0], [400.0, 100.0]];
        assert!(solve_square(&corners, 0.19, &k).is_none(), "collinear corners must not solve");
        let nan = [[f64::NAN, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(solve_square(&nan, 0.19, &k).is_none());
    }
}
