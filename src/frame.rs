//! カメラ・描画フレームの共通表現
//!
//! 画像は `Array3<u8>` (高さ × 幅 × チャンネル)。チャンネル数は
//! 1 (グレー), 3 (BGR), 4 (BGRA/RGBA) のいずれか。

use ndarray::Array3;

pub type Frame = Array3<u8>;

/// 単色で塗ったフレームを作る
pub fn filled(height: usize, width: usize, pixel: &[u8]) -> Frame {
    let channels = pixel.len();
    Array3::from_shape_fn((height, width, channels), |(_, _, c)| pixel[c])
}

/// (幅, 高さ)
pub fn size(frame: &Frame) -> (usize, usize) {
    let (h, w, _) = frame.dim();
    (w, h)
}

pub fn channels(frame: &Frame) -> usize {
    frame.dim().2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_width_then_height() {
        let f = filled(240, 320, &[1, 2, 3]);
        assert_eq!(size(&f), (320, 240));
        assert_eq!(channels(&f), 3);
    }
}
