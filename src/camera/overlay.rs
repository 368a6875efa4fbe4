//! 表示フレームへの文字と枠の描画

use anyhow::Result;
use opencv::{
    core::{Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

use super::{frame_to_mat, mat_to_frame};
use crate::face::FaceBox;
use crate::frame::Frame;

const FONT: i32 = imgproc::FONT_HERSHEY_SIMPLEX;
const FONT_SCALE: f64 = 0.7;
const THICKNESS: i32 = 2;
const LINE_GAP: i32 = 12;
const PAD: i32 = 6;

/// Hershey フォントは ASCII のみ
fn fold_ascii(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            'á' => Some('a'),
            'é' => Some('e'),
            'í' => Some('i'),
            'ó' => Some('o'),
            'ú' | 'ü' => Some('u'),
            'ñ' => Some('n'),
            'Á' => Some('A'),
            'É' => Some('E'),
            'Í' => Some('I'),
            'Ó' => Some('O'),
            'Ú' | 'Ü' => Some('U'),
            'Ñ' => Some('N'),
            '¿' | '¡' => None,
            c if c.is_ascii() => Some(c),
            _ => Some('?'),
        })
        .collect()
}

/// 左上から行ごとに背景付きで文字を置く。最終行（エラー）は赤背景。
pub fn draw_lines(frame: &mut Frame, lines: &[String], highlight_last: bool) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut mat = frame_to_mat(frame)?;
    let mut y = 40;
    for (i, line) in lines.iter().enumerate() {
        let text = fold_ascii(line);
        let mut baseline = 0;
        let size = imgproc::get_text_size(&text, FONT, FONT_SCALE, THICKNESS, &mut baseline)?;
        let bg = if highlight_last && i + 1 == lines.len() {
            Scalar::new(40.0, 40.0, 190.0, 0.0)
        } else {
            Scalar::new(90.0, 40.0, 20.0, 0.0)
        };
        let rect = Rect::new(20 - PAD, y - size.height - PAD, size.width + 2 * PAD, size.height + baseline + 2 * PAD);
        imgproc::rectangle(&mut mat, rect, bg, imgproc::FILLED, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            &mut mat,
            &text,
            Point::new(20, y),
            FONT,
            FONT_SCALE,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            THICKNESS,
            imgproc::LINE_AA,
            false,
        )?;
        y += size.height + baseline + 2 * PAD + LINE_GAP;
    }
    *frame = mat_to_frame(&mat)?;
    Ok(())
}

pub fn draw_face_box(frame: &mut Frame, face: FaceBox) -> Result<()> {
    let mut mat = frame_to_mat(frame)?;
    imgproc::rectangle(
        &mut mat,
        Rect::new(face.x, face.y, face.width, face.height),
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        3,
        imgproc::LINE_8,
        0,
    )?;
    *frame = mat_to_frame(&mat)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_ascii() {
        assert_eq!(fold_ascii("¿Cómo te llamas?"), "Como te llamas?");
        assert_eq!(fold_ascii("CONFIGURACIÓN"), "CONFIGURACION");
    }
}
