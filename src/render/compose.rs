use ndarray::Array3;

use crate::frame::Frame;

/// 画素を (B, G, R, A) の 0..1 に正規化
#[inline]
fn normalized(frame: &Frame, y: usize, x: usize) -> ([f32; 3], f32) {
    match frame.dim().2 {
        1 => {
            let g = frame[[y, x, 0]] as f32 / 255.0;
            ([g, g, g], 1.0)
        }
        3 => (
            [
                frame[[y, x, 0]] as f32 / 255.0,
                frame[[y, x, 1]] as f32 / 255.0,
                frame[[y, x, 2]] as f32 / 255.0,
            ],
            1.0,
        ),
        _ => (
            [
                frame[[y, x, 0]] as f32 / 255.0,
                frame[[y, x, 1]] as f32 / 255.0,
                frame[[y, x, 2]] as f32 / 255.0,
            ],
            frame[[y, x, 3]] as f32 / 255.0,
        ),
    }
}

/// 前景を背景の (x, y) に置いて "over" 合成する。結果は BGRA。
///
/// 前景・背景はグレー / BGR / BGRA のどれでもよい（前景が描画結果なら
/// 先に [`rgba_to_bgra`] で並びを揃えること）。キャンバスは両画像の
/// 外接矩形なので、前景がはみ出しても切れない。
pub fn blend(foreground: &Frame, background: &Frame, x: i32, y: i32) -> Frame {
    let (fg_h, fg_w, _) = foreground.dim();
    let (bg_h, bg_w, _) = background.dim();
    let (x, y) = (x as i64, y as i64);

    let out_h = ((bg_h as i64).max(y + fg_h as i64) - y.min(0)).max(0) as usize;
    let out_w = ((bg_w as i64).max(x + fg_w as i64) - x.min(0)).max(0) as usize;

    let bg_x = (-x).max(0) as usize;
    let bg_y = (-y).max(0) as usize;
    let fg_x = x.max(0) as usize;
    let fg_y = y.max(0) as usize;

    let mut out = Array3::<u8>::zeros((out_h, out_w, 4));
    for oy in 0..out_h {
        for ox in 0..out_w {
            let (bc, ba) = if oy >= bg_y && oy < bg_y + bg_h && ox >= bg_x && ox < bg_x + bg_w {
                normalized(background, oy - bg_y, ox - bg_x)
            } else {
                ([0.0; 3], 0.0)
            };
            let (fc, fa) = if oy >= fg_y && oy < fg_y + fg_h && ox >= fg_x && ox < fg_x + fg_w {
                normalized(foreground, oy - fg_y, ox - fg_x)
            } else {
                ([0.0; 3], 0.0)
            };

            let out_a = fa + ba * (1.0 - fa);
            if out_a <= 0.0 {
                // 両方透明なら黒
                continue;
            }
            for c in 0..3 {
                let v = (fc[c] * fa + bc[c] * ba * (1.0 - fa)) / out_a;
                out[[oy, ox, c]] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            out[[oy, ox, 3]] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// R と B を入れ替える（RGBA → BGRA）
pub fn rgba_to_bgra(frame: &Frame) -> Frame {
    let mut out = frame.clone();
    if frame.dim().2 >= 3 {
        let (h, w, _) = frame.dim();
        for y in 0..h {
            for x in 0..w {
                out[[y, x, 0]] = frame[[y, x, 2]];
                out[[y, x, 2]] = frame[[y, x, 0]];
            }
        }
    }
    out
}

/// アルファを捨てて BGR に
pub fn bgra_to_bgr(frame: &Frame) -> Frame {
    let (h, w, c) = frame.dim();
    if c == 1 {
        return Array3::from_shape_fn((h, w, 3), |(y, x, _)| frame[[y, x, 0]]);
    }
    Array3::from_shape_fn((h, w, 3), |(y, x, ch)| frame[[y, x, ch]])
}
