use anyhow::Result;
use minifb::{Key, Window, WindowOptions};

use crate::frame::Frame;

/// minifbを使用した表示ウィンドウ
pub struct MinifbRenderer {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl MinifbRenderer {
    /// ウィンドウを作成
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;

        let buffer = vec![0u32; width * height];

        Ok(Self {
            window,
            buffer,
            width,
            height,
        })
    }

    /// ウィンドウが開いていて Esc が押されていない
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    /// BGR / BGRA フレームをバッファにコピー
    pub fn draw_frame(&mut self, frame: &Frame) {
        self.draw_frame_at(frame, 0, 0);
    }

    /// 指定位置にコピー（はみ出しはクロップ）
    pub fn draw_frame_at(&mut self, frame: &Frame, x_off: usize, y_off: usize) {
        let (frame_height, frame_width, channels) = frame.dim();

        for y in 0..frame_height.min(self.height.saturating_sub(y_off)) {
            for x in 0..frame_width.min(self.width.saturating_sub(x_off)) {
                let (r, g, b) = if channels >= 3 {
                    (frame[[y, x, 2]] as u32, frame[[y, x, 1]] as u32, frame[[y, x, 0]] as u32)
                } else {
                    let v = frame[[y, x, 0]] as u32;
                    (v, v, v)
                };
                self.buffer[(y + y_off) * self.width + x + x_off] = (r << 16) | (g << 8) | b;
            }
        }
    }

    /// バッファをウィンドウに表示
    pub fn update(&mut self) -> Result<()> {
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(())
    }
}
