//! マーカーを使ったミニゲーム
//!
//! どのゲームも スキャン → 提示/収集 → 回答 → 結果 の流れで、
//! 時刻は呼び出し側から `now` として渡す（スリープしない）。

pub mod categorize;
pub mod discover;
pub mod find_fruits;
pub mod matcher;
pub mod memory;
pub mod quorum;

use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::Catalog;
use crate::config::GamesConfig;
use crate::marker::MarkerId;

pub use categorize::CategorizeGame;
pub use discover::DiscoverGame;
pub use find_fruits::FindFruitsGame;
pub use memory::MemoryGame;

/// 結果画面に出す最終結果
#[derive(Debug, Clone, PartialEq)]
pub struct GameOutcome {
    pub score: u32,
    pub total: u32,
    pub attempts: u32,
    pub success: bool,
    pub lines: Vec<String>,
}

impl GameOutcome {
    /// 0..=100
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.score as f32 * 100.0 / self.total as f32
        }
    }
}

/// 1ラウンド分のミニゲーム
pub trait GameRound: Send {
    fn kind(&self) -> GameKind;

    /// 見えているマーカーで状態を進める
    fn update(&mut self, now: Instant, visible: &BTreeSet<MarkerId>);

    /// 認識された発話を1つ処理する
    fn handle_utterance(&mut self, text: &str, now: Instant);

    /// 今描画すべきマーカー
    fn render_markers(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId>;

    /// 音声入力を受け付けるべきか
    fn should_listen(&self) -> bool;

    /// 画面表示用の文言
    fn messages(&self, now: Instant) -> Vec<String>;

    /// 終了していれば結果
    fn outcome(&self) -> Option<&GameOutcome>;

    /// 最初のスキャンからやり直す
    fn restart(&mut self, now: Instant);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameMode {
    Training,
    Evaluation,
}

impl GameMode {
    /// 保存・ログ用の識別子
    pub fn id(&self) -> &'static str {
        match self {
            GameMode::Training => "entrenamiento",
            GameMode::Evaluation => "evaluacion",
        }
    }

    pub fn games(&self) -> [GameKind; 2] {
        match self {
            GameMode::Training => [GameKind::Discover, GameKind::FindFruits],
            GameMode::Evaluation => [GameKind::Categorize, GameKind::Memory],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameKind {
    Discover,
    FindFruits,
    Categorize,
    Memory,
}

impl GameKind {
    pub fn id(&self) -> &'static str {
        match self {
            GameKind::Discover => "descubre",
            GameKind::FindFruits => "frutas",
            GameKind::Categorize => "categorias",
            GameKind::Memory => "memoria",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            GameKind::Discover => "DESCUBRE Y NOMBRA",
            GameKind::FindFruits => "ENCUENTRA LAS FRUTAS",
            GameKind::Categorize => "FRUTAS Y VERDURAS",
            GameKind::Memory => "MEMORIA",
        }
    }

    pub fn mode(&self) -> GameMode {
        match self {
            GameKind::Discover | GameKind::FindFruits => GameMode::Training,
            GameKind::Categorize | GameKind::Memory => GameMode::Evaluation,
        }
    }

    pub fn create(
        &self,
        config: &GamesConfig,
        catalog: Arc<Catalog>,
        rng: StdRng,
        now: Instant,
    ) -> Box<dyn GameRound> {
        match self {
            GameKind::Discover => Box::new(DiscoverGame::new(config, catalog, rng, now)),
            GameKind::FindFruits => Box::new(FindFruitsGame::new(config, catalog, rng, now)),
            GameKind::Categorize => Box::new(CategorizeGame::new(config, catalog, rng, now)),
            GameKind::Memory => Box::new(MemoryGame::new(config, catalog, rng, now)),
        }
    }
}

/// 正答率に応じた締めの一言
pub(crate) fn grade_line(score: u32, total: u32) -> &'static str {
    let ratio = if total == 0 { 0.0 } else { score as f32 / total as f32 };
    if ratio >= 0.8 {
        "¡Excelente trabajo!"
    } else if ratio >= 0.6 {
        "¡Muy bien! Sigue así"
    } else {
        "¡Sigue practicando!"
    }
}

/// 回答直後に一瞬出すフィードバック（スリープの代わり）
#[derive(Debug, Clone)]
pub(crate) struct Feedback {
    pub text: String,
    pub until: Instant,
}

impl Feedback {
    pub const SECS: f32 = 0.8;

    pub fn new(text: impl Into<String>, now: Instant) -> Self {
        Self { text: text.into(), until: now + Duration::from_secs_f32(Self::SECS) }
    }

    pub fn active(&self, now: Instant) -> bool {
        now < self.until
    }
}

/// カタログの名前付き候補（発話の照合用）
pub(crate) fn candidates<'a>(
    catalog: &'a Catalog,
    ids: impl Iterator<Item = MarkerId>,
) -> Vec<(MarkerId, &'a str, &'a [String])> {
    ids.filter_map(|id| catalog.get(id).map(|item| (id, item.name.as_str(), item.synonyms.as_slice())))
        .collect()
}
