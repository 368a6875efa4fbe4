use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{DetectedMarker, MarkerDetector, MarkerId, Pose, PoseSolver, SquarePoseSolver};
use crate::calibration::CameraIntrinsics;
use crate::frame::Frame;

/// 1フレームの追跡結果
#[derive(Debug, Clone)]
pub struct TrackedFrame {
    /// markerId → Pose（姿勢が解けたものだけ）
    pub poses: BTreeMap<MarkerId, Pose>,
    /// 検出された全マーカー（姿勢が解けなかったものも含む）
    pub markers: Vec<DetectedMarker>,
    /// 表示用コピー（マーカーを背景色で塗りつぶしたもの）
    pub display: Frame,
}

/// マーカー検出 + マーカーごとの姿勢推定
pub struct MarkerTracker {
    detector: Box<dyn MarkerDetector + Send>,
    solver: Box<dyn PoseSolver + Send>,
    intrinsics: CameraIntrinsics,
    marker_length: f64,
    erase_margin: i32,
}

impl MarkerTracker {
    pub fn new(
        detector: Box<dyn MarkerDetector + Send>,
        intrinsics: CameraIntrinsics,
        marker_length: f64,
        erase_margin: i32,
    ) -> Self {
        Self { detector, solver: Box::new(SquarePoseSolver), intrinsics, marker_length, erase_margin }
    }

    /// 姿勢ソルバを差し替える（既定は `SquarePoseSolver`）
    pub fn with_solver(mut self, solver: Box<dyn PoseSolver + Send>) -> Self {
        self.solver = solver;
        self
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// 検出に失敗しても空のマップを返す
    fn detect_raw(&mut self, frame: &Frame) -> Vec<DetectedMarker> {
        match self.detector.detect_markers(frame) {
            Ok(markers) => markers,
            Err(e) => {
                warn!("marker detection failed: {:#}", e);
                Vec::new()
            }
        }
    }

    fn solve_all(&self, markers: &[DetectedMarker]) -> BTreeMap<MarkerId, Pose> {
        let mut poses = BTreeMap::new();
        for m in markers {
            match self.solver.solve(&m.corners, self.marker_length, &self.intrinsics) {
                Some(pose) => {
                    poses.insert(m.id, pose);
                }
                None => debug!("pose solve failed for marker {}", m.id),
            }
        }
        poses
    }

    /// markerId → Pose
    pub fn detect(&mut self, frame: &Frame) -> BTreeMap<MarkerId, Pose> {
        let markers = self.detect_raw(frame);
        self.solve_all(&markers)
    }

    /// 未加工フレームで検出してから、表示用コピーのマーカーを消す
    pub fn process(&mut self, frame: &Frame, erase: bool) -> TrackedFrame {
        let markers = self.detect_raw(frame);
        let poses = self.solve_all(&markers);
        let mut display = frame.clone();
        if erase {
            erase_markers(&mut display, &markers, self.erase_margin);
        }
        TrackedFrame { poses, markers, display }
    }

    /// フレーム上のマーカーを周囲の平均色で塗りつぶす。塗ったマーカー数を返す。
    pub fn erase_markers_visually(&mut self, frame: &mut Frame) -> usize {
        let markers = self.detect_raw(frame);
        erase_markers(frame, &markers, self.erase_margin);
        markers.len()
    }
}

/// 点が多角形の内側（境界含む）にあるか
fn point_in_polygon(px: f64, py: f64, poly: &[[f64; 2]; 4]) -> bool {
    // 境界上は内側扱い
    for i in 0..4 {
        let a = poly[i];
        let b = poly[(i + 1) % 4];
        let cross = (b[0] - a[0]) * (py - a[1]) - (b[1] - a[1]) * (px - a[0]);
        let within_x = px >= a[0].min(b[0]) - 1e-9 && px <= a[0].max(b[0]) + 1e-9;
        let within_y = py >= a[1].min(b[1]) - 1e-9 && py <= a[1].max(b[1]) + 1e-9;
        if cross.abs() < 1e-9 && within_x && within_y {
            return true;
        }
    }
    let mut inside = false;
    let mut j = 3;
    for i in 0..4 {
        let (xi, yi) = (poly[i][0], poly[i][1]);
        let (xj, yj) = (poly[j][0], poly[j][1]);
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// 各マーカーの外接矩形 (+margin) のうち、多角形外の画素の平均色で多角形を塗る。
/// 対象画素が無ければ黒。
pub fn erase_markers(frame: &mut Frame, markers: &[DetectedMarker], margin: i32) {
    let (h, w, channels) = frame.dim();
    if h == 0 || w == 0 {
        return;
    }
    for marker in markers {
        let xs = marker.corners.iter().map(|c| c[0]);
        let ys = marker.corners.iter().map(|c| c[1]);
        let min_x = xs.clone().fold(f64::INFINITY, f64::min);
        let max_x = xs.fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.clone().fold(f64::INFINITY, f64::min);
        let max_y = ys.fold(f64::NEG_INFINITY, f64::max);
        if !(min_x.is_finite() && max_x.is_finite() && min_y.is_finite() && max_y.is_finite()) {
            continue;
        }

        let x0 = (min_x.floor() as i64 - margin as i64).clamp(0, w as i64 - 1) as usize;
        let x1 = (max_x.ceil() as i64 + margin as i64).clamp(0, w as i64 - 1) as usize;
        let y0 = (min_y.floor() as i64 - margin as i64).clamp(0, h as i64 - 1) as usize;
        let y1 = (max_y.ceil() as i64 + margin as i64).clamp(0, h as i64 - 1) as usize;

        // マスクと背景色の平均
        let bw = x1 - x0 + 1;
        let mut mask = vec![false; bw * (y1 - y0 + 1)];
        let mut sum = vec![0u64; channels];
        let mut count = 0u64;
        for y in y0..=y1 {
            for x in x0..=x1 {
                let inside = point_in_polygon(x as f64, y as f64, &marker.corners);
                mask[(y - y0) * bw + x - x0] = inside;
                if !inside {
                    for c in 0..channels {
                        sum[c] += frame[[y, x, c]] as u64;
                    }
                    count += 1;
                }
            }
        }
        let fill: Vec<u8> = if count == 0 {
            vec![0; channels]
        } else {
            sum.iter().map(|s| (s / count) as u8).collect()
        };

        for y in y0..=y1 {
            for x in x0..=x1 {
                if mask[(y - y0) * bw + x - x0] {
                    for c in 0..channels {
                        frame[[y, x, c]] = fill[c];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::filled;
    use anyhow::bail;

    struct FixedDetector(Vec<DetectedMarker>);

    impl MarkerDetector for FixedDetector {
        fn detect_markers(&mut self, _frame: &Frame) -> anyhow::Result<Vec<DetectedMarker>> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl MarkerDetector for FailingDetector {
        fn detect_markers(&mut self, _frame: &Frame) -> anyhow::Result<Vec<DetectedMarker>> {
            bail!("backend unavailable")
        }
    }

    fn square(id: MarkerId, x: f64, y: f64, side: f64) -> DetectedMarker {
        DetectedMarker {
            id,
            corners: [[x, y], [x + side, y], [x + side, y + side], [x, y + side]],
        }
    }

    #[test]
    fn test_detect_drops_only_failed_marker() {
        let good = square(3, 300.0, 200.0, 80.0);
        let bad = DetectedMarker { id: 7, corners: [[10.0, 10.0]; 4] };
        let k = CameraIntrinsics::fallback(640, 480);
        let mut tracker = MarkerTracker::new(Box::new(FixedDetector(vec![good, bad])), k, 0.19, 10);
        let poses = tracker.detect(&filled(480, 640, &[0, 0, 0]));
        assert!(poses.contains_key(&3), "solvable marker kept");
        assert!(!poses.contains_key(&7), "degenerate marker dropped");
    }

    #[test]
    fn test_detector_error_yields_empty_map() {
        let k = CameraIntrinsics::fallback(640, 480);
        let mut tracker = MarkerTracker::new(Box::new(FailingDetector), k, 0.19, 10);
        assert!(tracker.detect(&filled(480, 640, &[0, 0, 0])).is_empty());
    }

    #[test]
    fn test_erase_fills_with_halo_average() {
        let mut frame = filled(100, 100, &[50, 100, 150]);
        // マーカー本体は白黒
        for y in 40..=60 {
            for x in 40..=60 {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                for c in 0..3 {
                    frame[[y, x, c]] = v;
                }
            }
        }
        let marker = square(1, 40.0, 40.0, 20.0);
        erase_markers(&mut frame, &[marker], 10);
        for y in 40..=60 {
            for x in 40..=60 {
                assert_eq!(
                    [frame[[y, x, 0]], frame[[y, x, 1]], frame[[y, x, 2]]],
                    [50, 100, 150],
                    "pixel ({}, {}) should take the background color",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn test_erase_without_halo_uses_black() {
        let mut frame = filled(10, 10, &[200, 200, 200]);
        let marker = square(1, -5.0, -5.0, 20.0);
        erase_markers(&mut frame, &[marker], 0);
        assert_eq!(frame[[5, 5, 0]], 0);
        assert_eq!(frame[[9, 9, 2]], 0);
    }

    #[test]
    fn test_process_keeps_tracking_copy_untouched() {
        let frame = filled(120, 120, &[10, 20, 30]);
        let mut marked = frame.clone();
        for y in 40..=80 {
            for x in 40..=80 {
                marked[[y, x, 0]] = 255;
            }
        }
        let k = CameraIntrinsics::fallback(120, 120);
        let det = FixedDetector(vec![square(2, 40.0, 40.0, 40.0)]);
        let mut tracker = MarkerTracker::new(Box::new(det), k, 0.19, 5);
        let tracked = tracker.process(&marked, true);
        assert_eq!(marked[[60, 60, 0]], 255, "input frame must not be painted");
        assert_eq!(tracked.display[[60, 60, 0]], 10);
        assert_eq!(tracked.markers.len(), 1);
        assert!(tracked.poses.contains_key(&2));
    }

    struct FixedSolver(Pose);

    impl PoseSolver for FixedSolver {
        fn solve(&self, _corners: &[[f64; 2]; 4], _len: f64, _k: &CameraIntrinsics) -> Option<Pose> {
            Some(self.0)
        }
    }

    #[test]
    fn test_with_solver_replaces_default() {
        let pose = Pose::from_rvec_tvec([0.0, 0.0, 0.0], [0.1, 0.2, 3.0]);
        let k = CameraIntrinsics::fallback(640, 480);
        // 既定ソルバでは解けない退化した四隅
        let bad = DetectedMarker { id: 7, corners: [[10.0, 10.0]; 4] };
        let mut tracker =
            MarkerTracker::new(Box::new(FixedDetector(vec![bad])), k, 0.19, 10).with_solver(Box::new(FixedSolver(pose)));
        let poses = tracker.detect(&filled(480, 640, &[0, 0, 0]));
        assert_eq!(poses.get(&7), Some(&pose), "custom solver result used");
    }

    #[test]
    fn test_erase_markers_visually_paints_detected_marker() {
        let mut frame = filled(100, 100, &[30, 60, 90]);
        for y in 40..=60 {
            for x in 40..=60 {
                for c in 0..3 {
                    frame[[y, x, c]] = if (x / 5 + y / 5) % 2 == 0 { 255 } else { 0 };
                }
            }
        }
        let k = CameraIntrinsics::fallback(100, 100);
        let det = FixedDetector(vec![square(4, 40.0, 40.0, 20.0)]);
        let mut tracker = MarkerTracker::new(Box::new(det), k, 0.19, 8);
        assert_eq!(tracker.erase_markers_visually(&mut frame), 1);
        for (y, x) in [(40, 40), (50, 50), (60, 60), (45, 58)] {
            assert_eq!(
                [frame[[y, x, 0]], frame[[y, x, 1]], frame[[y, x, 2]]],
                [30, 60, 90],
                "pixel ({}, {}) takes the surrounding color",
                x,
                y
            );
        }
        assert_eq!(frame[[10, 10, 0]], 30, "outside the box untouched");
    }
}
