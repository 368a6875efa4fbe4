use std::fmt;

use crate::games::quorum::Deadline;
use crate::games::{GameMode, GameRound};

/// アカウント設定の中の段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStep {
    Menu,
    AwaitingName,
    AwaitingLanguage,
}

/// 対話のフェーズ。各フェーズは必要なデータだけを持つ。
pub enum Phase {
    Intro { until: Deadline },
    FaceRecognition { stable_frames: u32 },
    AwaitingCommand,
    /// 次の tick で顔ベクトルを照合する
    TryingLogin,
    LoginFailed { until: Deadline },
    AwaitingRegistrationName,
    AwaitingRegistrationLanguage { name: String },
    MainMenu,
    AccountSettings(AccountStep),
    Progress,
    ModeSelection,
    GameSelection { mode: GameMode },
    Playing { mode: GameMode, game: Box<dyn GameRound> },
    Result { mode: GameMode, game: Box<dyn GameRound> },
    Exit,
}

impl Phase {
    /// ログ・表示用の識別子
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Intro { .. } => "inicio",
            Phase::FaceRecognition { .. } => "reconocimiento_facial",
            Phase::AwaitingCommand => "esperando_comando",
            Phase::TryingLogin => "intentando_iniciar_sesion",
            Phase::LoginFailed { .. } => "inicio_sesion_fallido",
            Phase::AwaitingRegistrationName => "esperando_nombre_registro",
            Phase::AwaitingRegistrationLanguage { .. } => "esperando_idioma_registro",
            Phase::MainMenu => "menu_principal",
            Phase::AccountSettings(_) => "configuracion_cuenta",
            Phase::Progress => "ver_progreso",
            Phase::ModeSelection => "seleccion_modo",
            Phase::GameSelection { .. } => "seleccion_juego",
            Phase::Playing { .. } => "jugando",
            Phase::Result { .. } => "resultado",
            Phase::Exit => "salir",
        }
    }

    /// 名前を聞くフェーズは長めに聞き取る
    pub fn wants_long_window(&self) -> bool {
        matches!(
            self,
            Phase::AwaitingRegistrationName | Phase::AccountSettings(AccountStep::AwaitingName)
        )
    }

    /// 顔の観測が必要か
    pub fn wants_face(&self) -> bool {
        matches!(self, Phase::FaceRecognition { .. } | Phase::AwaitingCommand | Phase::TryingLogin)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
