use nalgebra::{Rotation3, Vector3};
use std::f64::consts::PI;

use crate::catalog::{Catalog, Shape};
use crate::marker::MarkerId;

use super::scene::ModelFactory;

/// 単色の三角形メッシュ（外向き反時計回り）
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vector3<f64>>,
    pub triangles: Vec<[usize; 3]>,
    /// RGB
    pub color: [u8; 3],
}

impl Mesh {
    pub fn sphere(radius: f64, segments: usize, rings: usize, color: [u8; 3]) -> Self {
        let mut vertices = Vec::new();
        for r in 0..=rings {
            let phi = PI * r as f64 / rings as f64;
            for s in 0..segments {
                let theta = 2.0 * PI * s as f64 / segments as f64;
                vertices.push(Vector3::new(
                    radius * phi.sin() * theta.cos(),
                    radius * phi.cos(),
                    radius * phi.sin() * theta.sin(),
                ));
            }
        }
        let mut triangles = Vec::new();
        for r in 0..rings {
            for s in 0..segments {
                let a = r * segments + s;
                let b = r * segments + (s + 1) % segments;
                let c = (r + 1) * segments + s;
                let d = (r + 1) * segments + (s + 1) % segments;
                triangles.push([a, b, c]);
                triangles.push([b, d, c]);
            }
        }
        Self { vertices, triangles, color }.oriented_outward()
    }

    /// Y軸方向に立つ円錐（底面 y=0）
    pub fn cone(radius: f64, height: f64, segments: usize, color: [u8; 3]) -> Self {
        let mut vertices = vec![Vector3::new(0.0, height, 0.0), Vector3::zeros()];
        for s in 0..segments {
            let theta = 2.0 * PI * s as f64 / segments as f64;
            vertices.push(Vector3::new(radius * theta.cos(), 0.0, radius * theta.sin()));
        }
        let mut triangles = Vec::new();
        for s in 0..segments {
            let a = 2 + s;
            let b = 2 + (s + 1) % segments;
            triangles.push([0, a, b]);
            triangles.push([1, b, a]);
        }
        Self { vertices, triangles, color }.oriented_outward()
    }

    pub fn cube(size: f64, color: [u8; 3]) -> Self {
        let h = size / 2.0;
        let vertices = (0..8)
            .map(|i| {
                Vector3::new(
                    if i & 1 == 0 { -h } else { h },
                    if i & 2 == 0 { -h } else { h },
                    if i & 4 == 0 { -h } else { h },
                )
            })
            .collect();
        let triangles = vec![
            [0, 1, 3], [0, 3, 2], [4, 6, 7], [4, 7, 5],
            [0, 4, 5], [0, 5, 1], [2, 3, 7], [2, 7, 6],
            [0, 2, 6], [0, 6, 4], [1, 5, 7], [1, 7, 3],
        ];
        Self { vertices, triangles, color }.oriented_outward()
    }

    /// 凸形状前提: 各三角形の法線が重心から外を向くよう並びを揃える
    fn oriented_outward(mut self) -> Self {
        if self.vertices.is_empty() {
            return self;
        }
        let centroid = self.vertices.iter().fold(Vector3::zeros(), |acc, v| acc + v)
            / self.vertices.len() as f64;
        for tri in self.triangles.iter_mut() {
            let (a, b, c) = (self.vertices[tri[0]], self.vertices[tri[1]], self.vertices[tri[2]]);
            let n = (b - a).cross(&(c - a));
            let center = (a + b + c) / 3.0;
            if n.dot(&(center - centroid)) < 0.0 {
                tri.swap(1, 2);
            }
        }
        self
    }

    pub fn translated(mut self, offset: Vector3<f64>) -> Self {
        for v in self.vertices.iter_mut() {
            *v += offset;
        }
        self
    }
}

/// マーカー1枚に載せるモデル（複数メッシュ）
#[derive(Debug, Clone)]
pub struct Model {
    pub meshes: Vec<Mesh>,
}

impl Model {
    /// X軸まわりに回転 → 一様スケール → 最下点をマーカー平面 (z=0) に合わせる
    pub fn prepared(mut self, scale: f64) -> Self {
        let rot = Rotation3::from_axis_angle(&Vector3::x_axis(), PI / 2.0);
        for mesh in self.meshes.iter_mut() {
            for v in mesh.vertices.iter_mut() {
                *v = rot * *v * scale;
            }
        }
        let min_z = self
            .meshes
            .iter()
            .flat_map(|m| m.vertices.iter().map(|v| v.z))
            .fold(f64::INFINITY, f64::min);
        if min_z.is_finite() {
            for mesh in self.meshes.iter_mut() {
                for v in mesh.vertices.iter_mut() {
                    v.z -= min_z;
                }
            }
        }
        self
    }

    pub fn bounds_z(&self) -> (f64, f64) {
        self.meshes
            .iter()
            .flat_map(|m| m.vertices.iter().map(|v| v.z))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), z| (lo.min(z), hi.max(z)))
    }
}

/// カタログの形状・色からプリミティブモデルを作る
pub struct PrimitiveModelFactory {
    catalog: Catalog,
    scale: f64,
}

impl PrimitiveModelFactory {
    pub fn new(catalog: Catalog, scale: f64) -> Self {
        Self { catalog, scale }
    }
}

impl ModelFactory for PrimitiveModelFactory {
    fn create(&self, marker_id: MarkerId) -> Option<Model> {
        let item = self.catalog.get(marker_id)?;
        let color = item.color;
        // 単位はモデル空間（Y上）
        let meshes = match item.shape {
            Shape::Sphere => vec![Mesh::sphere(0.5, 16, 10, color)],
            Shape::Cone => vec![Mesh::cone(0.4, 1.0, 16, color)],
            Shape::Cube => vec![Mesh::cube(0.8, color)],
            Shape::Mascot => vec![
                Mesh::sphere(0.5, 16, 10, color),
                Mesh::sphere(0.12, 8, 6, [30, 30, 30]).translated(Vector3::new(-0.18, 0.15, 0.42)),
                Mesh::sphere(0.12, 8, 6, [30, 30, 30]).translated(Vector3::new(0.18, 0.15, 0.42)),
                Mesh::cone(0.35, 0.6, 16, [120, 60, 200]).translated(Vector3::new(0.0, 0.4, 0.0)),
            ],
        };
        Some(Model { meshes }.prepared(self.scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_model_sits_on_marker_plane() {
        let factory = PrimitiveModelFactory::new(Catalog::default(), 0.15);
        let model = factory.create(1).expect("builtin fruit");
        let (lo, hi) = model.bounds_z();
        assert!(lo.abs() < 1e-12, "lowest point floats at z=0, got {}", lo);
        assert!((hi - 0.15).abs() < 1e-9, "unit sphere scaled to 0.15, got {}", hi);
    }

    #[test]
    fn test_cone_points_up_after_rotation() {
        let model = Model { meshes: vec![Mesh::cone(0.4, 1.0, 8, [0, 0, 0])] }.prepared(1.0);
        // 頂点0（円錐の先端）が最も高い
        let apex = model.meshes[0].vertices[0];
        assert!((apex.z - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_marker_has_no_model() {
        let factory = PrimitiveModelFactory::new(Catalog::default(), 0.15);
        assert!(factory.create(42).is_none());
    }

    #[test]
    fn test_faces_oriented_outward() {
        let cube = Mesh::cube(1.0, [0, 0, 0]);
        for tri in &cube.triangles {
            let (a, b, c) = (cube.vertices[tri[0]], cube.vertices[tri[1]], cube.vertices[tri[2]]);
            let n = (b - a).cross(&(c - a));
            assert!(n.dot(&((a + b + c) / 3.0)) > 0.0);
        }
    }
}
