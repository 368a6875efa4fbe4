//! CPU ラスタライザ（Zバッファ + Lambert）
//!
//! カメラはレンダラ座標系（Y上, -Z前方）。出力は RGBA で、何も描かれない
//! 画素はアルファ0。

use nalgebra::{Matrix4, Point3, Vector3};
use ndarray::Array3;

use super::mesh::Model;
use crate::calibration::CameraIntrinsics;
use crate::frame::Frame;

const NEAR: f64 = 0.01;

/// 平行光源（世界座標の光の進む向きの逆 = 光源方向）
#[derive(Debug, Clone, Copy)]
pub struct DirectionalLight {
    pub direction: Vector3<f64>,
    pub intensity: f32,
}

pub struct SoftwareRenderer {
    width: usize,
    height: usize,
    /// 出力解像度に合わせた内部パラメータ
    intrinsics: CameraIntrinsics,
    ambient: f32,
    lights: Vec<DirectionalLight>,
    depth: Vec<f64>,
}

impl SoftwareRenderer {
    pub fn new(intrinsics: &CameraIntrinsics, width: u32, height: u32, ambient: f32) -> Self {
        Self {
            width: width as usize,
            height: height as usize,
            intrinsics: intrinsics.scaled_to(width, height),
            ambient,
            lights: vec![
                // 真上からの主光源と斜めの補助光
                DirectionalLight { direction: Vector3::new(0.0, 0.0, 1.0), intensity: 0.5 },
                DirectionalLight { direction: Vector3::new(0.5, -0.5, 0.7).normalize(), intensity: 0.3 },
            ],
            depth: vec![f64::INFINITY; width as usize * height as usize],
        }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// `camera` はカメラ→世界の変換
    pub fn render(&mut self, model: &Model, camera: &Matrix4<f64>) -> Frame {
        let mut out = Array3::<u8>::zeros((self.height, self.width, 4));
        self.depth.iter_mut().for_each(|d| *d = f64::INFINITY);

        let Some(view) = camera.try_inverse() else {
            return out;
        };
        let k = self.intrinsics;

        for mesh in &model.meshes {
            let view_pts: Vec<Vector3<f64>> = mesh
                .vertices
                .iter()
                .map(|v| view.transform_point(&Point3::from(*v)).coords)
                .collect();

            for tri in &mesh.triangles {
                let (a, b, c) = (view_pts[tri[0]], view_pts[tri[1]], view_pts[tri[2]]);
                // ニアプレーンより手前の頂点を含む三角形は捨てる
                if a.z > -NEAR || b.z > -NEAR || c.z > -NEAR {
                    continue;
                }
                let normal = (b - a).cross(&(c - a));
                let len = normal.norm();
                if len < 1e-15 {
                    continue;
                }
                let normal = normal / len;
                // 裏面カリング（視点は原点）
                if normal.dot(&a) >= 0.0 {
                    continue;
                }

                // 世界座標の法線で陰影
                let world_normal = (camera.fixed_view::<3, 3>(0, 0) * normal).normalize();
                let mut shade = self.ambient;
                for light in &self.lights {
                    shade += light.intensity * world_normal.dot(&light.direction).max(0.0) as f32;
                }
                let shade = shade.min(1.0);
                let rgb = mesh.color.map(|c| (c as f32 * shade).round().clamp(0.0, 255.0) as u8);

                let project = |p: &Vector3<f64>| -> (f64, f64, f64) {
                    let inv_depth = 1.0 / -p.z;
                    (k.cx + k.fx * p.x * inv_depth, k.cy - k.fy * p.y * inv_depth, inv_depth)
                };
                let (p0, p1, p2) = (project(&a), project(&b), project(&c));
                self.fill_triangle(&mut out, [p0, p1, p2], rgb);
            }
        }
        out
    }

    fn fill_triangle(&mut self, out: &mut Frame, pts: [(f64, f64, f64); 3], rgb: [u8; 3]) {
        let [(x0, y0, w0), (x1, y1, w1), (x2, y2, w2)] = pts;
        let area = (x1 - x0) * (y2 - y0) - (x2 - x0) * (y1 - y0);
        if area.abs() < 1e-12 {
            return;
        }
        let min_x = x0.min(x1).min(x2).floor().max(0.0) as i64;
        let max_x = x0.max(x1).max(x2).ceil().min(self.width as f64 - 1.0) as i64;
        let min_y = y0.min(y1).min(y2).floor().max(0.0) as i64;
        let max_y = y0.max(y1).max(y2).ceil().min(self.height as f64 - 1.0) as i64;

        for py in min_y..=max_y {
            for px in min_x..=max_x {
                let (sx, sy) = (px as f64 + 0.5, py as f64 + 0.5);
                let e0 = ((x2 - x1) * (sy - y1) - (y2 - y1) * (sx - x1)) / area;
                let e1 = ((x0 - x2) * (sy - y2) - (y0 - y2) * (sx - x2)) / area;
                let e2 = 1.0 - e0 - e1;
                if e0 < 0.0 || e1 < 0.0 || e2 < 0.0 {
                    continue;
                }
                // 1/depth は画面空間で線形
                let inv_depth = e0 * w0 + e1 * w1 + e2 * w2;
                if inv_depth <= 0.0 {
                    continue;
                }
                let depth = 1.0 / inv_depth;
                let idx = py as usize * self.width + px as usize;
                if depth < self.depth[idx] {
                    self.depth[idx] = depth;
                    let (y, x) = (py as usize, px as usize);
                    out[[y, x, 0]] = rgb[0];
                    out[[y, x, 1]] = rgb[1];
                    out[[y, x, 2]] = rgb[2];
                    out[[y, x, 3]] = 255;
                }
            }
        }
    }
}
