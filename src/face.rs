//! 顔検出と顔特徴ベクトル
//!
//! 検出器と埋め込み器は外部の差し替え口。ここでは最大の顔を選んで
//! ベクトル化し、登録済みプロファイルとコサイン類似度で照合する。

use anyhow::Result;
use tracing::debug;

use crate::frame::Frame;
use crate::store::UserProfile;

/// 画像上の矩形（ピクセル）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceBox {
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }
}

pub trait FaceDetector: Send {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceBox>>;
}

pub trait FaceEmbedder: Send {
    /// 取れなければ None
    fn embed(&mut self, frame: &Frame, face: FaceBox) -> Result<Option<Vec<f32>>>;
}

/// 1フレーム分の観測
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub face: FaceBox,
    pub embedding: Option<Vec<f32>>,
}

pub struct FaceObserver {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

impl FaceObserver {
    pub fn new(detector: Box<dyn FaceDetector>, embedder: Box<dyn FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }

    /// 最大の顔を選んで埋め込む。検出や推論の失敗は「顔なし」扱い。
    pub fn observe(&mut self, frame: &Frame) -> Option<FaceSample> {
        let faces = match self.detector.detect_faces(frame) {
            Ok(faces) => faces,
            Err(e) => {
                debug!("face detection failed: {:#}", e);
                return None;
            }
        };
        let face = largest(&faces)?;
        let embedding = match self.embedder.embed(frame, face) {
            Ok(v) => v,
            Err(e) => {
                debug!("face embedding failed: {:#}", e);
                None
            }
        };
        Some(FaceSample { face, embedding })
    }
}

pub fn largest(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.iter().copied().max_by_key(|f| f.area())
}

/// 長さが違う・ゼロベクトルなら 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())) as f32
}

/// しきい値以上で最も類似度の高いプロファイル
pub fn best_match<'a>(
    vector: &[f32],
    profiles: &'a [UserProfile],
    threshold: f32,
) -> Option<(&'a UserProfile, f32)> {
    let mut best: Option<(&UserProfile, f32)> = None;
    for profile in profiles {
        let Some(stored) = profile.facial_vector.as_deref() else { continue };
        let sim = cosine_similarity(vector, stored);
        debug!("similarity with {}: {:.3}", profile.name, sim);
        if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
            best = Some((profile, sim));
        }
    }
    best
}

/// L2 正規化（ゼロベクトルはそのまま）
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, v: Vec<f32>) -> UserProfile {
        UserProfile::new(name, "es", Some(v))
    }

    /// (1, 0) と類似度 s になる単位ベクトル
    fn at(s: f32) -> Vec<f32> {
        vec![s, (1.0 - s * s).sqrt()]
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_best_match_threshold() {
        let v = [1.0, 0.0];
        let profiles = vec![profile("Ana", at(0.95)), profile("Luis", at(0.80))];
        let (p, sim) = best_match(&v, &profiles, 0.92).expect("Ana above threshold");
        assert_eq!(p.name, "Ana");
        assert!((sim - 0.95).abs() < 1e-4);

        let only_low = vec![profile("Luis", at(0.80))];
        assert!(best_match(&v, &only_low, 0.92).is_none());
    }

    #[test]
    fn test_best_match_prefers_highest() {
        let v = [1.0, 0.0];
        let profiles = vec![profile("Ana", at(0.93)), profile("Eva", at(0.97)), UserProfile::new("Sin", "es", None)];
        assert_eq!(best_match(&v, &profiles, 0.92).map(|(p, _)| p.name.as_str()), Some("Eva"));
    }

    struct Boxes(Vec<FaceBox>);
    impl FaceDetector for Boxes {
        fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<FaceBox>> {
            Ok(self.0.clone())
        }
    }

    struct WidthEmbedder;
    impl FaceEmbedder for WidthEmbedder {
        fn embed(&mut self, _frame: &Frame, face: FaceBox) -> Result<Option<Vec<f32>>> {
            Ok(Some(vec![face.width as f32]))
        }
    }

    #[test]
    fn test_observer_uses_largest_face() {
        let small = FaceBox { x: 0, y: 0, width: 10, height: 10 };
        let big = FaceBox { x: 50, y: 50, width: 40, height: 30 };
        let mut obs = FaceObserver::new(Box::new(Boxes(vec![small, big])), Box::new(WidthEmbedder));
        let frame = Frame::zeros((100, 100, 3));
        let sample = obs.observe(&frame).unwrap();
        assert_eq!(sample.face, big);
        assert_eq!(sample.embedding, Some(vec![40.0]));

        let mut none = FaceObserver::new(Box::new(Boxes(vec![])), Box::new(WidthEmbedder));
        assert!(none.observe(&frame).is_none());
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }
}
