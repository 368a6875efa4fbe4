use nalgebra::Matrix4;
use std::collections::HashMap;
use tracing::debug;

use super::mesh::Model;
use super::raster::SoftwareRenderer;
use crate::calibration::CameraIntrinsics;
use crate::frame::Frame;
use crate::marker::MarkerId;

/// マーカーIDからモデルを作る（カタログに無ければ None）
pub trait ModelFactory {
    fn create(&self, marker_id: MarkerId) -> Option<Model>;
}

/// キャッシュ済みシーンへの参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneHandle(pub MarkerId);

pub struct SceneEntry {
    pub marker_id: MarkerId,
    pub model: Model,
    pub camera_transform: Matrix4<f64>,
    renderer: SoftwareRenderer,
}

/// マーカーごとのシーン（モデル + ライト + カメラ）を遅延生成して保持する。
/// セッション中は破棄しない。描画スレッドからのみ触る。
pub struct SceneCache {
    entries: HashMap<MarkerId, SceneEntry>,
    ambient: f32,
}

impl SceneCache {
    pub fn new(ambient: f32) -> Self {
        Self { entries: HashMap::new(), ambient }
    }

    /// 既にあればそれを返す（モデルは作り直さない）
    pub fn get_or_create(
        &mut self,
        marker_id: MarkerId,
        factory: &dyn ModelFactory,
        intrinsics: &CameraIntrinsics,
        width: u32,
        height: u32,
    ) -> Option<SceneHandle> {
        if self.entries.contains_key(&marker_id) {
            return Some(SceneHandle(marker_id));
        }
        let model = factory.create(marker_id)?;
        debug!("scene created for marker {}", marker_id);
        self.entries.insert(
            marker_id,
            SceneEntry {
                marker_id,
                model,
                camera_transform: Matrix4::identity(),
                renderer: SoftwareRenderer::new(intrinsics, width, height, self.ambient),
            },
        );
        Some(SceneHandle(marker_id))
    }

    pub fn update(&mut self, handle: SceneHandle, camera_transform: Matrix4<f64>) -> bool {
        match self.entries.get_mut(&handle.0) {
            Some(entry) => {
                entry.camera_transform = camera_transform;
                true
            }
            None => false,
        }
    }

    /// RGBA
    pub fn render(&mut self, handle: SceneHandle) -> Option<Frame> {
        let entry = self.entries.get_mut(&handle.0)?;
        Some(entry.renderer.render(&entry.model, &entry.camera_transform))
    }

    /// 同じフレームの変換で更新してすぐ描画する
    pub fn render_with(&mut self, handle: SceneHandle, camera_transform: Matrix4<f64>) -> Option<Frame> {
        if !self.update(handle, camera_transform) {
            return None;
        }
        self.render(handle)
    }

    pub fn get(&self, handle: SceneHandle) -> Option<&SceneEntry> {
        self.entries.get(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!("clearing {} cached scenes", self.entries.len());
        }
        self.entries.clear();
    }
}
