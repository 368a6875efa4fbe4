use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::matcher::{find_mentions, normalize};
use super::quorum::{Deadline, ScanGate, ScanStatus};
use super::{candidates, grade_line, Feedback, GameKind, GameOutcome, GameRound};
use crate::catalog::{Catalog, ItemKind};
use crate::config::GamesConfig;
use crate::marker::MarkerId;

const NEXT_WORDS: &[&str] = &["siguiente", "verduras", "cambiar", "next"];
const DONE_WORDS: &[&str] = &["listo", "terminar", "acabar", "finalizar", "done"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Fruits,
    Vegetables,
}

impl Category {
    fn kind(&self) -> ItemKind {
        match self {
            Category::Fruits => ItemKind::Fruit,
            Category::Vegetables => ItemKind::Vegetable,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Category::Fruits => "FRUTAS",
            Category::Vegetables => "VERDURAS",
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Scan(ScanGate),
    /// 選んだ要素が全部見えるまで待つ
    Presenting,
    Answering { category: Category, deadline: Deadline },
    Finished(GameOutcome),
}

/// 「果物と野菜に分けよう」
///
/// 回答は表示中の要素かどうかを確かめずに記録し、最後にまとめて採点する。
pub struct CategorizeGame {
    config: GamesConfig,
    catalog: Arc<Catalog>,
    rng: StdRng,
    phase: Phase,
    elements: Vec<MarkerId>,
    fruits_said: BTreeSet<MarkerId>,
    vegetables_said: BTreeSet<MarkerId>,
    attempts: u32,
    feedback: Option<Feedback>,
}

impl CategorizeGame {
    pub fn new(config: &GamesConfig, catalog: Arc<Catalog>, rng: StdRng, now: Instant) -> Self {
        Self {
            config: config.clone(),
            catalog,
            rng,
            phase: Phase::Scan(ScanGate::new(config.categorize_scan, now)),
            elements: Vec::new(),
            fruits_said: BTreeSet::new(),
            vegetables_said: BTreeSet::new(),
            attempts: 0,
            feedback: None,
        }
    }

    pub fn elements(&self) -> &[MarkerId] {
        &self.elements
    }

    pub fn category(&self) -> Option<Category> {
        match self.phase {
            Phase::Answering { category, .. } => Some(category),
            _ => None,
        }
    }

    /// 果物・野菜を最大 per_kind ずつ、足りなければ残りで埋めてシャッフル
    fn select(&mut self, scanned: Vec<MarkerId>) -> Vec<MarkerId> {
        let per_kind = self.config.categorize_per_kind;
        let want = self.config.categorize_scan.required.max(per_kind * 2);
        let mut fruits: Vec<MarkerId> =
            scanned.iter().copied().filter(|id| self.catalog.kind(*id) == Some(ItemKind::Fruit)).collect();
        let mut vegetables: Vec<MarkerId> =
            scanned.iter().copied().filter(|id| self.catalog.kind(*id) == Some(ItemKind::Vegetable)).collect();
        fruits.shuffle(&mut self.rng);
        vegetables.shuffle(&mut self.rng);

        let mut chosen: Vec<MarkerId> = fruits.iter().take(per_kind).copied().collect();
        chosen.extend(vegetables.iter().take(per_kind).copied());
        let rest = fruits.iter().skip(per_kind).chain(vegetables.iter().skip(per_kind));
        for id in rest {
            if chosen.len() >= want {
                break;
            }
            chosen.push(*id);
        }
        chosen.shuffle(&mut self.rng);
        chosen
    }

    fn next_category(&mut self, now: Instant) {
        match self.phase {
            Phase::Answering { category: Category::Fruits, .. } => {
                self.phase = Phase::Answering {
                    category: Category::Vegetables,
                    deadline: Deadline::after(now, self.config.categorize_answer_timeout_secs),
                };
            }
            Phase::Answering { category: Category::Vegetables, .. } => self.finish(),
            _ => {}
        }
    }

    fn said_for(&mut self, category: Category) -> &mut BTreeSet<MarkerId> {
        match category {
            Category::Fruits => &mut self.fruits_said,
            Category::Vegetables => &mut self.vegetables_said,
        }
    }

    fn finish(&mut self) {
        let mut correct = 0u32;
        let mut lines = Vec::new();
        for id in &self.elements {
            let ok = match self.catalog.kind(*id) {
                Some(ItemKind::Fruit) => self.fruits_said.contains(id),
                Some(ItemKind::Vegetable) => self.vegetables_said.contains(id),
                _ => false,
            };
            if ok {
                correct += 1;
            }
        }
        // 反対のカテゴリで言ったもの
        for (said, category) in [(&self.fruits_said, Category::Fruits), (&self.vegetables_said, Category::Vegetables)] {
            for id in said {
                if self.catalog.kind(*id) != Some(category.kind()) {
                    if let Some(name) = self.catalog.name(*id) {
                        lines.push(format!("{} no va en {}", name, category.label()));
                    }
                }
            }
        }
        let total = self.elements.len() as u32;
        let success = total > 0 && correct as f32 >= self.config.success_ratio * total as f32;
        lines.insert(0, format!("Has clasificado bien {} de {}", correct, total));
        lines.push(grade_line(correct, total).to_string());
        info!("categorize finished: {}/{}", correct, total);
        self.phase = Phase::Finished(GameOutcome {
            score: correct,
            total,
            attempts: self.attempts,
            success,
            lines,
        });
    }
}

fn contains_word(text: &str, words: &[&str]) -> bool {
    let norm = normalize(text);
    norm.split(' ').any(|w| words.contains(&w))
}

impl GameRound for CategorizeGame {
    fn kind(&self) -> GameKind {
        GameKind::Categorize
    }

    fn update(&mut self, now: Instant, visible: &BTreeSet<MarkerId>) {
        match &mut self.phase {
            Phase::Scan(gate) => {
                let catalog = &self.catalog;
                gate.observe(visible.iter().copied().filter(|id| catalog.is_food(*id)));
                if let ScanStatus::Complete(ids) = gate.poll(now) {
                    self.elements = self.select(ids);
                    self.phase = Phase::Presenting;
                }
            }
            Phase::Presenting => {
                if self.elements.iter().all(|id| visible.contains(id)) {
                    self.phase = Phase::Answering {
                        category: Category::Fruits,
                        deadline: Deadline::after(now, self.config.categorize_answer_timeout_secs),
                    };
                }
            }
            Phase::Answering { deadline, .. } => {
                if deadline.expired(now) {
                    self.next_category(now);
                }
            }
            Phase::Finished(_) => {}
        }
    }

    fn handle_utterance(&mut self, text: &str, now: Instant) {
        let Phase::Answering { category, .. } = self.phase else {
            return;
        };
        // 合図の語を含む発話は回答として記録しない
        if contains_word(text, NEXT_WORDS) {
            self.next_category(now);
            return;
        }
        if contains_word(text, DONE_WORDS) {
            self.finish();
            return;
        }
        self.attempts += 1;

        let mentioned = {
            let cands = candidates(&self.catalog, self.catalog.ids().filter(|id| self.catalog.is_food(*id)));
            find_mentions(text, &cands)
        };
        let added = mentioned.iter().filter(|id| self.said_for(category).insert(**id)).count();
        if added > 0 {
            self.feedback = Some(Feedback::new(format!("Anotado ({})", added), now));
        }
    }

    fn render_markers(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId> {
        match &self.phase {
            Phase::Scan(_) => visible.iter().copied().filter(|id| self.catalog.is_food(*id)).collect(),
            Phase::Presenting | Phase::Answering { .. } => {
                self.elements.iter().copied().filter(|id| visible.contains(id)).collect()
            }
            Phase::Finished(_) => Vec::new(),
        }
    }

    fn should_listen(&self) -> bool {
        matches!(self.phase, Phase::Answering { .. })
    }

    fn messages(&self, now: Instant) -> Vec<String> {
        let mut lines = vec![GameKind::Categorize.title().to_string()];
        match &self.phase {
            Phase::Scan(gate) => {
                lines.push("Muestra frutas y verduras a la cámara".to_string());
                lines.push(format!("Detectados: {} (mínimo {})", gate.seen().len(), gate.required()));
            }
            Phase::Presenting => lines.push("¡CLASIFICA EN FRUTAS Y VERDURAS!".to_string()),
            Phase::Answering { category, deadline } => {
                lines.push(format!("Di todas las {}", category.label()));
                lines.push(format!("Tiempo: {}s  (di \"siguiente\" o \"listo\")", deadline.remaining_secs(now)));
            }
            Phase::Finished(o) => lines.extend(o.lines.iter().cloned()),
        }
        if let Some(f) = self.feedback.as_ref().filter(|f| f.active(now)) {
            lines.push(f.text.clone());
        }
        lines
    }

    fn outcome(&self) -> Option<&GameOutcome> {
        match &self.phase {
            Phase::Finished(o) => Some(o),
            _ => None,
        }
    }

    fn restart(&mut self, now: Instant) {
        self.phase = Phase::Scan(ScanGate::new(self.config.categorize_scan, now));
        self.elements.clear();
        self.fruits_said.clear();
        self.vegetables_said.clear();
        self.attempts = 0;
        self.feedback = None;
    }
}
