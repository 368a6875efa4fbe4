use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::matcher::matches_with;
use super::quorum::{Deadline, ScanGate, ScanStatus};
use super::{grade_line, Feedback, GameKind, GameOutcome, GameRound};
use crate::catalog::{Catalog, ItemKind};
use crate::config::GamesConfig;
use crate::marker::MarkerId;

#[derive(Debug, Clone)]
enum Phase {
    Scan(ScanGate),
    /// 全ターゲットが同時に見えるのを待つ
    Placing,
    Answering,
    Finished(GameOutcome),
}

/// 「果物を探せ」: 選ばれた果物を全部並べて名前を言う
pub struct FindFruitsGame {
    config: GamesConfig,
    catalog: Arc<Catalog>,
    rng: StdRng,
    phase: Phase,
    targets: Vec<MarkerId>,
    said: BTreeSet<MarkerId>,
    attempts: u32,
    /// 初めて全部そろった時から数える（見失ってもリセットしない）
    deadline: Option<Deadline>,
    feedback: Option<Feedback>,
}

impl FindFruitsGame {
    pub fn new(config: &GamesConfig, catalog: Arc<Catalog>, rng: StdRng, now: Instant) -> Self {
        Self {
            config: config.clone(),
            catalog,
            rng,
            phase: Phase::Scan(ScanGate::new(config.fruits_scan, now)),
            targets: Vec::new(),
            said: BTreeSet::new(),
            attempts: 0,
            deadline: None,
            feedback: None,
        }
    }

    pub fn targets(&self) -> &[MarkerId] {
        &self.targets
    }

    fn is_fruit(&self, id: MarkerId) -> bool {
        self.catalog.kind(id) == Some(ItemKind::Fruit)
    }

    fn target_names(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|id| self.catalog.name(*id).unwrap_or("?").to_string())
            .collect()
    }

    fn finish(&mut self) {
        let score = self.said.len() as u32;
        let total = self.targets.len() as u32;
        let success = total > 0 && score as f32 >= self.config.success_ratio * total as f32;
        let mut lines = vec![format!("Has nombrado {} de {} frutas", score, total)];
        let missing: Vec<&str> = self
            .targets
            .iter()
            .filter(|id| !self.said.contains(id))
            .filter_map(|id| self.catalog.name(*id))
            .collect();
        if !missing.is_empty() {
            lines.push(format!("Faltaron: {}", missing.join(", ")));
        }
        lines.push(grade_line(score, total).to_string());
        info!("find-fruits finished: {}/{}", score, total);
        self.phase = Phase::Finished(GameOutcome {
            score,
            total,
            attempts: self.attempts,
            success,
            lines,
        });
    }
}

impl GameRound for FindFruitsGame {
    fn kind(&self) -> GameKind {
        GameKind::FindFruits
    }

    fn update(&mut self, now: Instant, visible: &BTreeSet<MarkerId>) {
        let all_visible = !self.targets.is_empty() && self.targets.iter().all(|id| visible.contains(id));
        match &mut self.phase {
            Phase::Scan(gate) => {
                let catalog = &self.catalog;
                gate.observe(
                    visible.iter().copied().filter(|id| catalog.kind(*id) == Some(ItemKind::Fruit)),
                );
                if let ScanStatus::Complete(mut ids) = gate.poll(now) {
                    ids.shuffle(&mut self.rng);
                    ids.truncate(self.config.fruits_targets.max(1));
                    self.targets = ids;
                    self.phase = Phase::Placing;
                }
            }
            Phase::Placing => {
                if all_visible {
                    if self.deadline.is_none() {
                        self.deadline = Some(Deadline::after(now, self.config.fruits_answer_timeout_secs));
                    }
                    self.phase = Phase::Answering;
                }
            }
            Phase::Answering => {
                if self.deadline.is_some_and(|d| d.expired(now)) {
                    self.finish();
                } else if !all_visible {
                    self.phase = Phase::Placing;
                }
            }
            Phase::Finished(_) => {}
        }
        // 見失っている間も締め切りは進む
        if matches!(self.phase, Phase::Placing) && self.deadline.is_some_and(|d| d.expired(now)) {
            self.finish();
        }
    }

    fn handle_utterance(&mut self, text: &str, now: Instant) {
        if !matches!(self.phase, Phase::Answering) {
            return;
        }
        self.attempts += 1;
        let mut newly = Vec::new();
        for id in self.targets.clone() {
            let Some(name) = self.catalog.name(id) else { continue };
            let extra = self.catalog.synonyms_for(name);
            if matches_with(text, name, extra) && self.said.insert(id) {
                newly.push(name.to_string());
            }
        }
        if newly.is_empty() {
            self.feedback = Some(Feedback::new("Esa no está en la lista", now));
        } else {
            self.feedback = Some(Feedback::new(format!("¡Bien! {}", newly.join(", ")), now));
        }
        if self.said.len() == self.targets.len() {
            self.finish();
        }
    }

    fn render_markers(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId> {
        match &self.phase {
            Phase::Scan(_) => visible.iter().copied().filter(|id| self.is_fruit(*id)).collect(),
            Phase::Placing | Phase::Answering => {
                self.targets.iter().copied().filter(|id| visible.contains(id)).collect()
            }
            Phase::Finished(_) => Vec::new(),
        }
    }

    fn should_listen(&self) -> bool {
        matches!(self.phase, Phase::Answering)
    }

    fn messages(&self, now: Instant) -> Vec<String> {
        let mut lines = vec![GameKind::FindFruits.title().to_string()];
        match &self.phase {
            Phase::Scan(gate) => {
                lines.push("Muestra tus frutas a la cámara".to_string());
                lines.push(format!("Frutas detectadas: {} (mínimo {})", gate.seen().len(), gate.required()));
            }
            Phase::Placing => {
                lines.push("¡ENCUENTRA ESTAS FRUTAS!".to_string());
                lines.push(self.target_names().join(", "));
            }
            Phase::Answering => {
                lines.push("DI LOS NOMBRES DE LAS FRUTAS".to_string());
                if let Some(d) = self.deadline {
                    lines.push(format!("Tiempo: {}s", d.remaining_secs(now)));
                }
                lines.push(format!("Dichas: {}/{}", self.said.len(), self.targets.len()));
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
        self.phase = Phase::Scan(ScanGate::new(self.config.fruits_scan, now));
        self.targets.clear();
        self.said.clear();
        self.attempts = 0;
        self.deadline = None;
        self.feedback = None;
    }
}
