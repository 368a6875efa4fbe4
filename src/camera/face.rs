use anyhow::{Context, Result};
use ndarray::Array4;
use opencv::{
    core::{AlgorithmHint, Mat, Rect, Size, Vector},
    imgproc,
    objdetect::CascadeClassifier,
    prelude::*,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

use super::frame_to_mat;
use crate::config::FaceConfig;
use crate::face::{l2_normalize, FaceBox, FaceDetector, FaceEmbedder};
use crate::frame::Frame;

/// 埋め込みモデルの入力一辺
pub const EMBED_INPUT_SIZE: i32 = 112;

/// Haar カスケードの顔検出
pub struct HaarFaceDetector {
    cascade: CascadeClassifier,
}

impl HaarFaceDetector {
    pub fn new<P: AsRef<Path>>(cascade_path: P) -> Result<Self> {
        let path = cascade_path.as_ref();
        let cascade = CascadeClassifier::new(&path.to_string_lossy())
            .with_context(|| format!("Failed to load cascade {}", path.display()))?;
        if cascade.empty()? {
            anyhow::bail!("Cascade {} is empty", path.display());
        }
        Ok(Self { cascade })
    }
}

impl FaceDetector for HaarFaceDetector {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceBox>> {
        let image = frame_to_mat(frame)?;
        let mut gray = Mat::default();
        imgproc::cvt_color(&image, &mut gray, imgproc::COLOR_BGR2GRAY, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;

        let mut faces = Vector::<Rect>::new();
        self.cascade
            .detect_multi_scale(&gray, &mut faces, 1.3, 5, 0, Size::new(0, 0), Size::new(0, 0))
            .context("detect_multi_scale failed")?;

        Ok(faces
            .iter()
            .map(|r| FaceBox { x: r.x, y: r.y, width: r.width, height: r.height })
            .collect())
    }
}

/// ONNX の顔埋め込みモデル
pub struct OnnxFaceEmbedder {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxFaceEmbedder {
    pub fn new(config: &FaceConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.model_path)
            .with_context(|| format!("Failed to load ONNX model {}", config.model_path))?;
        Ok(Self {
            session,
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
        })
    }
}

/// 顔領域を 112x112 RGB に切り出し、(x-127.5)/128 で [1, 3, H, W] に
pub fn preprocess_face(frame: &Frame, face: FaceBox) -> Result<Option<Array4<f32>>> {
    let image = frame_to_mat(frame)?;
    // 画像内に収める
    let x0 = face.x.clamp(0, image.cols());
    let y0 = face.y.clamp(0, image.rows());
    let x1 = (face.x + face.width).clamp(0, image.cols());
    let y1 = (face.y + face.height).clamp(0, image.rows());
    if x1 - x0 < 2 || y1 - y0 < 2 {
        return Ok(None);
    }
    let crop = Mat::roi(&image, Rect::new(x0, y0, x1 - x0, y1 - y0))?.try_clone()?;

    let mut resized = Mat::default();
    imgproc::resize(
        &crop,
        &mut resized,
        Size::new(EMBED_INPUT_SIZE, EMBED_INPUT_SIZE),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    let mut rgb = Mat::default();
    imgproc::cvt_color(&resized, &mut rgb, imgproc::COLOR_BGR2RGB, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;

    let side = EMBED_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for y in 0..EMBED_INPUT_SIZE {
        for x in 0..EMBED_INPUT_SIZE {
            let pixel = rgb.at_2d::<opencv::core::Vec3b>(y, x)?;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 128.0;
            }
        }
    }
    Ok(Some(tensor))
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embed(&mut self, frame: &Frame, face: FaceBox) -> Result<Option<Vec<f32>>> {
        let Some(input) = preprocess_face(frame, face)? else { return Ok(None) };
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .context("Inference failed")?;
        let output: ndarray::ArrayViewD<f32> = outputs[self.output_name.as_str()]
            .try_extract_array()
            .context("Failed to extract output tensor")?;
        let mut vector: Vec<f32> = output.iter().copied().collect();
        if vector.iter().all(|v| *v == 0.0) {
            return Ok(None);
        }
        l2_normalize(&mut vector);
        Ok(Some(vector))
    }
}
