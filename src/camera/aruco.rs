use anyhow::{bail, Context, Result};
use opencv::{
    core::{Point2f, Vector},
    objdetect::{self, Dictionary, DetectorParameters, PredefinedDictionaryType, RefineParameters},
    prelude::*,
};

use super::frame_to_mat;
use crate::frame::Frame;
use crate::marker::{DetectedMarker, MarkerDetector};

pub fn parse_dictionary(name: &str) -> Result<Dictionary> {
    let dict_type = match name {
        "DICT_4X4_50" => PredefinedDictionaryType::DICT_4X4_50,
        "DICT_4X4_100" => PredefinedDictionaryType::DICT_4X4_100,
        "DICT_4X4_250" => PredefinedDictionaryType::DICT_4X4_250,
        "DICT_5X5_50" => PredefinedDictionaryType::DICT_5X5_50,
        "DICT_5X5_100" => PredefinedDictionaryType::DICT_5X5_100,
        "DICT_5X5_250" => PredefinedDictionaryType::DICT_5X5_250,
        "DICT_6X6_50" => PredefinedDictionaryType::DICT_6X6_50,
        "DICT_6X6_250" => PredefinedDictionaryType::DICT_6X6_250,
        "DICT_ARUCO_ORIGINAL" => PredefinedDictionaryType::DICT_ARUCO_ORIGINAL,
        _ => bail!("Unknown dictionary: {}", name),
    };
    objdetect::get_predefined_dictionary(dict_type).context("Failed to get predefined dictionary")
}

/// OpenCV ArUco による `MarkerDetector`
pub struct ArucoDetector {
    inner: objdetect::ArucoDetector,
}

impl ArucoDetector {
    pub fn new(dictionary: &str) -> Result<Self> {
        let dict = parse_dictionary(dictionary)?;
        let params = DetectorParameters::default()?;
        let refine = RefineParameters::new(10.0, 3.0, true)?;
        let inner = objdetect::ArucoDetector::new(&dict, &params, refine).context("Failed to create ArucoDetector")?;
        Ok(Self { inner })
    }
}

impl MarkerDetector for ArucoDetector {
    fn detect_markers(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>> {
        let image = frame_to_mat(frame)?;
        let mut corners = Vector::<Vector<Point2f>>::new();
        let mut ids = Vector::<i32>::new();
        let mut rejected = Vector::<Vector<Point2f>>::new();
        self.inner
            .detect_markers(&image, &mut corners, &mut ids, &mut rejected)
            .context("detect_markers failed")?;

        let mut markers = Vec::with_capacity(ids.len());
        for (id, quad) in ids.iter().zip(corners.iter()) {
            if quad.len() != 4 {
                continue;
            }
            let mut pts = [[0.0; 2]; 4];
            for (dst, p) in pts.iter_mut().zip(quad.iter()) {
                *dst = [p.x as f64, p.y as f64];
            }
            markers.push(DetectedMarker { id, corners: pts });
        }
        Ok(markers)
    }
}
