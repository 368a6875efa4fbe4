use anyhow::{bail, Context, Result};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

// --- データ構造 ---

/// ボードパラメータ（キャリブレーション時に保存されたもの）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardParams {
    pub dictionary: String,
    pub squares_x: i32,
    pub squares_y: i32,
    pub square_length: f32,
    pub marker_length: f32,
}

/// 単一カメラのキャリブレーション結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_index: i32,
    pub width: u32,
    pub height: u32,
    /// 内部パラメータ行列 K (row-major 3x3)
    pub intrinsic_matrix: [f64; 9],
    /// 歪み係数
    pub dist_coeffs: Vec<f64>,
    #[serde(default)]
    pub rvec: [f64; 3],
    #[serde(default)]
    pub tvec: [f64; 3],
    #[serde(default)]
    pub reprojection_error: f64,
}

/// キャリブレーションファイル全体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCameraCalibration {
    pub board: BoardParams,
    pub cameras: Vec<CameraCalibration>,
}

pub fn load_calibration(path: &str) -> Result<MultiCameraCalibration> {
    let content = fs::read_to_string(path).context("Failed to read calibration file")?;
    let cal: MultiCameraCalibration = serde_json::from_str(&content)?;
    Ok(cal)
}

/// カメラ内部パラメータ (cameraMatrix + distCoeffs)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// 歪み係数 [k1, k2, p1, p2, k3]
    pub dist: [f64; 5],
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    /// キャリブレーションが無いときの概算値（f=1000, 主点=画像中心, 歪みなし）
    pub fn fallback(width: u32, height: u32) -> Self {
        Self {
            fx: 1000.0,
            fy: 1000.0,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            dist: [0.0; 5],
            width,
            height,
        }
    }

    pub fn from_calibration(cal: &CameraCalibration) -> Result<Self> {
        let k = &cal.intrinsic_matrix;
        if k[0] <= 0.0 || k[4] <= 0.0 {
            bail!("Invalid focal length in calibration: fx={} fy={}", k[0], k[4]);
        }
        let mut dist = [0.0; 5];
        for (d, v) in dist.iter_mut().zip(cal.dist_coeffs.iter()) {
            *d = *v;
        }
        Ok(Self {
            fx: k[0],
            fy: k[4],
            cx: k[2],
            cy: k[5],
            dist,
            width: cal.width,
            height: cal.height,
        })
    }

    /// calibration.json から指定カメラの内部パラメータを読む。
    /// 読めない場合は概算値を使う。解像度が違えば主点と焦点距離をスケールする。
    pub fn load_or_fallback(path: &str, camera_index: i32, width: u32, height: u32) -> Self {
        let loaded = load_calibration(path).and_then(|cal| {
            let cam = cal
                .cameras
                .iter()
                .find(|c| c.camera_index == camera_index)
                .with_context(|| format!("camera {} not in calibration", camera_index))?;
            Self::from_calibration(cam)
        });
        match loaded {
            Ok(k) => {
                info!("loaded intrinsics from {} (fx={:.1} fy={:.1})", path, k.fx, k.fy);
                k.scaled_to(width, height)
            }
            Err(e) => {
                warn!("no usable calibration ({:#}), using approximate intrinsics", e);
                Self::fallback(width, height)
            }
        }
    }

    /// キャプチャ解像度に合わせてスケール
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        if self.width == 0 || self.height == 0 || (self.width == width && self.height == height) {
            return Self { width, height, ..*self };
        }
        let sx = width as f64 / self.width as f64;
        let sy = height as f64 / self.height as f64;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            dist: self.dist,
            width,
            height,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// 歪んだピクセル座標を理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;

        if self.dist.iter().all(|d| *d == 0.0) {
            return (u_dist, v_dist);
        }

        let xd = (u_dist - self.cx) / self.fx;
        let yd = (v_dist - self.cy) / self.fy;

        // f(x,y) = 歪み後座標 を解く
        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
            let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            if residual < 1e-18 {
                break;
            }

            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-14 {
                break;
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j01 * fx_val + j00 * fy_val) / det;
        }

        (best.0 * self.fx + self.cx, best.1 * self.fy + self.cy)
    }

    /// 正規化座標に歪みを適用してピクセル座標へ（テスト・再投影用）
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_center() {
        let k = CameraIntrinsics::fallback(640, 480);
        assert_eq!(k.cx, 320.0);
        assert_eq!(k.cy, 240.0);
        assert_eq!(k.fx, 1000.0);
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let k = CameraIntrinsics {
            dist: [-0.3, 0.1, 0.001, -0.002, 0.0],
            ..CameraIntrinsics::fallback(1280, 720)
        };
        let (u, v) = k.distort_normalized(0.25, -0.15);
        let (ux, uy) = k.undistort_point(u, v);
        assert!((ux - (0.25 * 1000.0 + 640.0)).abs() < 1e-4, "x: {}", ux);
        assert!((uy - (-0.15 * 1000.0 + 360.0)).abs() < 1e-4, "y: {}", uy);
    }

    #[test]
    fn test_missing_calibration_falls_back() {
        let k = CameraIntrinsics::load_or_fallback("/nonexistent/calibration.json", 0, 800, 600);
        assert_eq!(k, CameraIntrinsics::fallback(800, 600));
    }

    #[test]
    fn test_calibration_json_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let json = r#"{
            "board": {"dictionary": "DICT_4X4_50", "squares_x": 5, "squares_y": 4,
                      "square_length": 0.04, "marker_length": 0.03},
            "cameras": [{"camera_index": 0, "width": 640, "height": 480,
                         "intrinsic_matrix": [600,0,320, 0,600,240, 0,0,1],
                         "dist_coeffs": [0.1, 0.0, 0.0, 0.0, 0.0]}]
        }"#;
        fs::write(&path, json).unwrap();
        let k = CameraIntrinsics::load_or_fallback(path.to_str().unwrap(), 0, 1280, 960);
        assert!((k.fx - 1200.0).abs() < 1e-9);
        assert!((k.cx - 640.0).abs() < 1e-9);
        assert_eq!(k.dist[0], 0.1);
    }
}
