//! 1フレーム分の 追跡 → シーン更新 → 描画 → 合成
//!
//! 検出は必ず未加工フレームで行い、マーカー消去は表示用コピーにだけ施す。

use std::collections::BTreeSet;
use tracing::debug;

use crate::frame::{self, Frame};
use crate::marker::{MarkerId, MarkerTracker, TrackedFrame};
use crate::render::{bgra_to_bgr, blend, pose_to_render_camera, rgba_to_bgra, ModelFactory, SceneCache};

pub struct FramePipeline {
    tracker: MarkerTracker,
    scenes: SceneCache,
    factory: Box<dyn ModelFactory + Send>,
    erase: bool,
}

impl FramePipeline {
    pub fn new(tracker: MarkerTracker, factory: Box<dyn ModelFactory + Send>, ambient: f32, erase: bool) -> Self {
        Self { tracker, scenes: SceneCache::new(ambient), factory, erase }
    }

    /// 検出と姿勢推定。表示用コピーはマーカーを消したもの。
    pub fn track(&mut self, frame: &Frame) -> TrackedFrame {
        self.tracker.process(frame, self.erase)
    }

    /// `render` のマーカーを描いて BGR の表示フレームを返す。
    /// 姿勢が無いマーカーは飛ばす。
    pub fn compose(&mut self, tracked: &TrackedFrame, render: &[MarkerId]) -> Frame {
        let (width, height) = frame::size(&tracked.display);
        let intrinsics = *self.tracker.intrinsics();
        let mut out = tracked.display.clone();
        for id in render {
            let Some(pose) = tracked.poses.get(id) else { continue };
            let Some(handle) =
                self.scenes.get_or_create(*id, self.factory.as_ref(), &intrinsics, width as u32, height as u32)
            else {
                debug!("no model for marker {}", id);
                continue;
            };
            // 変換の更新と描画は同じフレームで対にする
            let Some(rgba) = self.scenes.render_with(handle, pose_to_render_camera(pose)) else { continue };
            let layer = blend(&rgba_to_bgra(&rgba), &out, 0, 0);
            out = bgra_to_bgr(&layer);
        }
        out
    }

    /// 姿勢が解けたマーカーの集合
    pub fn visible(tracked: &TrackedFrame) -> BTreeSet<MarkerId> {
        tracked.poses.keys().copied().collect()
    }

    pub fn scenes(&self) -> &SceneCache {
        &self.scenes
    }

    pub fn clear_scenes(&mut self) {
        self.scenes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CameraIntrinsics;
    use crate::catalog::Catalog;
    use crate::marker::pose_solver::{object_points, project};
    use crate::marker::{DetectedMarker, MarkerDetector, Pose};
    use crate::render::PrimitiveModelFactory;
    use nalgebra::{Matrix3, Vector3};

    struct FixedDetector(Vec<DetectedMarker>);

    impl MarkerDetector for FixedDetector {
        fn detect_markers(&mut self, _frame: &Frame) -> anyhow::Result<Vec<DetectedMarker>> {
            Ok(self.0.clone())
        }
    }

    const W: u32 = 320;
    const H: u32 = 240;
    const SIDE: f64 = 0.19;

    /// カメラ正面 1m に置いたマーカーの検出結果
    fn frontal_marker(id: MarkerId, intrinsics: &CameraIntrinsics) -> DetectedMarker {
        // マーカーの +Z がカメラを向く
        let rotation = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0);
        let pose = Pose { rotation, translation: Vector3::new(0.0, 0.0, 1.0) };
        let pts = object_points(SIDE);
        let corners = [0, 1, 2, 3].map(|i| project(&pose, &pts[i], intrinsics));
        DetectedMarker { id, corners }
    }

    fn pipeline(markers: Vec<DetectedMarker>, erase: bool) -> FramePipeline {
        let intrinsics = CameraIntrinsics::fallback(W, H);
        let tracker = MarkerTracker::new(Box::new(FixedDetector(markers)), intrinsics, SIDE, 10);
        let factory = PrimitiveModelFactory::new(Catalog::default(), 0.15);
        FramePipeline::new(tracker, Box::new(factory), 0.4, erase)
    }

    #[test]
    fn test_compose_draws_model_over_marker() {
        let intrinsics = CameraIntrinsics::fallback(W, H);
        let mut p = pipeline(vec![frontal_marker(4, &intrinsics)], false);
        let camera = frame::filled(H as usize, W as usize, &[10, 20, 30]);

        let tracked = p.track(&camera);
        assert_eq!(FramePipeline::visible(&tracked), BTreeSet::from([4]));

        let out = p.compose(&tracked, &[4]);
        assert_eq!(out.dim(), (H as usize, W as usize, 3), "display frame stays BGR at camera size");
        let changed = out.indexed_iter().filter(|((y, x, c), v)| **v != camera[[*y, *x, *c]]).count();
        assert!(changed > 0, "model pixels composited");

        p.compose(&tracked, &[4]);
        assert_eq!(p.scenes().len(), 1, "scene reused across frames");
    }

    #[test]
    fn test_compose_skips_markers_without_pose() {
        let intrinsics = CameraIntrinsics::fallback(W, H);
        let mut p = pipeline(vec![frontal_marker(4, &intrinsics)], false);
        let camera = frame::filled(H as usize, W as usize, &[10, 20, 30]);
        let tracked = p.track(&camera);
        let out = p.compose(&tracked, &[7]);
        assert_eq!(out, camera);
        assert!(p.scenes().is_empty());
    }

    #[test]
    fn test_erase_only_touches_display_copy() {
        let intrinsics = CameraIntrinsics::fallback(W, H);
        let mut p = pipeline(vec![frontal_marker(4, &intrinsics)], true);
        let mut camera = frame::filled(H as usize, W as usize, &[200, 200, 200]);
        // マーカー中央を黒く
        for y in 110..130 {
            for x in 150..170 {
                for c in 0..3 {
                    camera[[y, x, c]] = 0;
                }
            }
        }
        let tracked = p.track(&camera);
        assert_eq!(camera[[120, 160, 0]], 0, "input untouched");
        assert_eq!(tracked.display[[120, 160, 0]], 200, "display copy painted with halo color");
        p.clear_scenes();
        assert!(p.scenes().is_empty());
    }
}
