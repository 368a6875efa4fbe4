use anyhow::{bail, Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::mat_to_frame;
use crate::config::CameraConfig;
use crate::frame::Frame;

/// プラットフォームごとに試すキャプチャバックエンド
fn backend_candidates() -> Vec<(i32, &'static str)> {
    let mut candidates = Vec::new();
    #[cfg(target_os = "windows")]
    {
        candidates.push((videoio::CAP_DSHOW, "DSHOW"));
        candidates.push((videoio::CAP_MSMF, "MSMF"));
    }
    #[cfg(target_os = "linux")]
    candidates.push((videoio::CAP_V4L2, "V4L2"));
    #[cfg(target_os = "macos")]
    candidates.push((videoio::CAP_AVFOUNDATION, "AVFOUNDATION"));
    candidates.push((videoio::CAP_ANY, "ANY"));
    candidates
}

/// 各バックエンドで開いてみて、最初のフレームまでが最速のものを選ぶ
pub fn best_backend(index: i32) -> Option<(i32, &'static str)> {
    let mut best: Option<(i32, &'static str, Duration)> = None;
    for (api, name) in backend_candidates() {
        let start = Instant::now();
        let Ok(mut capture) = VideoCapture::new(index, api) else { continue };
        if !capture.is_opened().unwrap_or(false) {
            continue;
        }
        let mut first = Mat::default();
        let ok = capture.read(&mut first).unwrap_or(false) && !first.empty();
        let elapsed = start.elapsed();
        let _ = capture.release();
        if !ok {
            debug!("backend {} opened camera {} but returned no frame", name, index);
            continue;
        }
        debug!("backend {} opened camera {} in {:?}", name, index, elapsed);
        if best.map_or(true, |(_, _, t)| elapsed < t) {
            best = Some((api, name, elapsed));
        }
    }
    best.map(|(api, name, _)| (api, name))
}

/// OpenCVを使用したカメラキャプチャ
pub struct OpenCvCamera {
    capture: VideoCapture,
    width: u32,
    height: u32,
}

impl OpenCvCamera {
    /// 最速のバックエンドで設定のカメラを開く
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let (api, name) = best_backend(config.index)
            .with_context(|| format!("No capture backend could open camera {}", config.index))?;
        info!("camera {}: using {} backend", config.index, name);
        Self::open_with(config.index, api, config.width, config.height)
    }

    pub fn open_with(index: i32, api: i32, width: u32, height: u32) -> Result<Self> {
        let mut capture = VideoCapture::new(index, api).context("Failed to open camera")?;

        if !capture.is_opened()? {
            bail!("Camera {} is not available", index);
        }

        capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)?;
        capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)?;
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        let actual_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let actual_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        info!("camera {}: {}x{}", index, actual_width, actual_height);

        Ok(Self { capture, width: actual_width, height: actual_height })
    }

    /// (width, height)
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// フレームを読み込む（BGR形式）
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut frame = Mat::default();
        self.capture.read(&mut frame).context("Failed to read frame")?;

        if frame.empty() {
            bail!("Empty frame received");
        }

        mat_to_frame(&frame)
    }

    pub fn release(&mut self) -> Result<()> {
        self.capture.release().context("Failed to release camera")
    }
}

/// 連続した読み込み失敗を数え、上限を超えたら諦める
#[derive(Debug, Clone)]
pub struct ReadFailures {
    consecutive: u32,
    limit: u32,
    backoff: Duration,
}

impl ReadFailures {
    pub fn new(limit: u32, backoff: Duration) -> Self {
        Self { consecutive: 0, limit, backoff }
    }

    /// 失敗を記録する。上限に達したら false。
    pub fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive < self.limit
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// 次の読み込みまでの待ち時間
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_failures_give_up_after_limit() {
        let mut f = ReadFailures::new(3, Duration::from_millis(50));
        assert!(f.record());
        assert!(f.record());
        assert!(!f.record(), "third consecutive failure exhausts the budget");
    }

    #[test]
    fn test_successful_read_resets_count() {
        let mut f = ReadFailures::new(2, Duration::from_millis(50));
        assert!(f.record());
        f.reset();
        assert_eq!(f.consecutive(), 0);
        assert!(f.record(), "count starts over after a good frame");
    }
}
