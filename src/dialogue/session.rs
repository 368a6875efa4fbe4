use super::phase::Phase;
use crate::store::UserProfile;

/// 数フレームだけ出す通知（「登録完了」など）
#[derive(Debug, Clone, PartialEq)]
pub struct Banner {
    pub text: String,
    pub frames_left: u32,
}

/// 描画ループが所有するセッション状態。
/// 音声スレッドとの共有部分（listening, mic_ready, 認識結果）は `VoiceLink` 側にある。
#[derive(Debug)]
pub struct SessionState {
    pub phase: Phase,
    pub current_user: Option<UserProfile>,
    pub facial_vector_current: Option<Vec<f32>>,
    pub error_message: Option<String>,
    pub banner: Option<Banner>,
}

impl SessionState {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            current_user: None,
            facial_vector_current: None,
            error_message: None,
            banner: None,
        }
    }

    pub fn show_banner(&mut self, text: impl Into<String>, frames: u32) {
        self.banner = Some(Banner { text: text.into(), frames_left: frames });
    }

    /// 1フレーム分進める
    pub fn tick_banner(&mut self) {
        if let Some(banner) = &mut self.banner {
            banner.frames_left = banner.frames_left.saturating_sub(1);
            if banner.frames_left == 0 {
                self.banner = None;
            }
        }
    }
}
