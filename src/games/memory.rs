use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::matcher::find_mentions;
use super::quorum::{Deadline, ScanGate, ScanStatus};
use super::{candidates, Feedback, GameKind, GameOutcome, GameRound};
use crate::catalog::Catalog;
use crate::config::GamesConfig;
use crate::marker::MarkerId;

#[derive(Debug, Clone)]
enum Phase {
    Scan(ScanGate),
    /// sequence[index] を until まで見せる
    Showing { index: usize, until: Deadline },
    Answering { deadline: Deadline },
    Finished(GameOutcome),
}

/// 「記憶」: 順番に見せたマーカーを同じ順番で言う。1ゲーム1回勝負。
pub struct MemoryGame {
    config: GamesConfig,
    catalog: Arc<Catalog>,
    rng: StdRng,
    phase: Phase,
    sequence: Vec<MarkerId>,
    responses: Vec<MarkerId>,
    feedback: Option<Feedback>,
}

impl MemoryGame {
    pub fn new(config: &GamesConfig, catalog: Arc<Catalog>, rng: StdRng, now: Instant) -> Self {
        Self {
            config: config.clone(),
            catalog,
            rng,
            phase: Phase::Scan(ScanGate::new(config.memory_scan, now)),
            sequence: Vec::new(),
            responses: Vec::new(),
            feedback: None,
        }
    }

    pub fn sequence(&self) -> &[MarkerId] {
        &self.sequence
    }

    pub fn responses(&self) -> &[MarkerId] {
        &self.responses
    }

    fn names(&self, ids: &[MarkerId]) -> String {
        ids.iter()
            .map(|id| self.catalog.name(*id).unwrap_or("?"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn finish(&mut self, correct: bool) {
        let mut lines = Vec::new();
        if correct {
            lines.push("¡Secuencia correcta!".to_string());
        } else {
            lines.push("Secuencia incorrecta".to_string());
            lines.push(format!("La secuencia era: {}", self.names(&self.sequence)));
        }
        info!("memory finished: correct={}", correct);
        self.phase = Phase::Finished(GameOutcome {
            score: u32::from(correct),
            total: 1,
            attempts: 1,
            success: correct,
            lines,
        });
    }
}

impl GameRound for MemoryGame {
    fn kind(&self) -> GameKind {
        GameKind::Memory
    }

    fn update(&mut self, now: Instant, visible: &BTreeSet<MarkerId>) {
        match &mut self.phase {
            Phase::Scan(gate) => {
                let catalog = &self.catalog;
                gate.observe(visible.iter().copied().filter(|id| catalog.is_food(*id)));
                if let ScanStatus::Complete(ids) = gate.poll(now) {
                    let mut seq: Vec<MarkerId> = ids.into_iter().take(self.config.memory_length).collect();
                    seq.shuffle(&mut self.rng);
                    debug!("memory sequence: {:?}", seq);
                    self.sequence = seq;
                    self.phase = Phase::Showing {
                        index: 0,
                        until: Deadline::after(now, self.config.memory_item_secs),
                    };
                }
            }
            Phase::Showing { index, until } => {
                if until.expired(now) {
                    let next = *index + 1;
                    if next < self.sequence.len() {
                        self.phase = Phase::Showing {
                            index: next,
                            until: Deadline::after(now, self.config.memory_item_secs),
                        };
                    } else {
                        self.phase = Phase::Answering {
                            deadline: Deadline::after(now, self.config.memory_answer_timeout_secs),
                        };
                    }
                }
            }
            Phase::Answering { deadline } => {
                if deadline.expired(now) {
                    self.finish(false);
                }
            }
            Phase::Finished(_) => {}
        }
    }

    fn handle_utterance(&mut self, text: &str, now: Instant) {
        if !matches!(self.phase, Phase::Answering { .. }) {
            return;
        }
        let mentioned = {
            let cands = candidates(&self.catalog, self.catalog.ids().filter(|id| self.catalog.is_food(*id)));
            find_mentions(text, &cands)
        };
        if mentioned.is_empty() {
            self.feedback = Some(Feedback::new("No se entendió, habla más claro", now));
            return;
        }
        for id in mentioned {
            let index = self.responses.len();
            self.responses.push(id);
            // 比較位置で1つでも違えば失敗
            if self.sequence.get(index) != Some(&id) {
                self.finish(false);
                return;
            }
            if self.responses.len() == self.sequence.len() {
                self.finish(true);
                return;
            }
        }
        self.feedback = Some(Feedback::new(format!("{} de {}", self.responses.len(), self.sequence.len()), now));
    }

    fn render_markers(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId> {
        match &self.phase {
            Phase::Scan(_) => visible.iter().copied().filter(|id| self.catalog.is_food(*id)).collect(),
            Phase::Showing { index, .. } => self
                .sequence
                .get(*index)
                .filter(|id| visible.contains(id))
                .map(|id| vec![*id])
                .unwrap_or_default(),
            Phase::Answering { .. } | Phase::Finished(_) => Vec::new(),
        }
    }

    fn should_listen(&self) -> bool {
        matches!(self.phase, Phase::Answering { .. })
    }

    fn messages(&self, now: Instant) -> Vec<String> {
        let mut lines = vec![GameKind::Memory.title().to_string()];
        match &self.phase {
            Phase::Scan(gate) => {
                lines.push("Muestra tus marcadores a la cámara".to_string());
                lines.push(format!("Detectados: {} (mínimo {})", gate.seen().len(), gate.required()));
            }
            Phase::Showing { index, .. } => {
                lines.push(format!("¡Memoriza! {}/{}", index + 1, self.sequence.len()));
            }
            Phase::Answering { deadline } => {
                lines.push("Di los nombres en el mismo orden".to_string());
                lines.push(format!("Tiempo: {}s", deadline.remaining_secs(now)));
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
        self.phase = Phase::Scan(ScanGate::new(self.config.memory_scan, now));
        self.sequence.clear();
        self.responses.clear();
        self.feedback = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::time::Duration;

    fn set(ids: &[MarkerId]) -> BTreeSet<MarkerId> {
        ids.iter().copied().collect()
    }

    /// スキャンと提示を終えて回答待ちにする
    fn answering(t0: Instant) -> (MemoryGame, Instant) {
        let mut g = MemoryGame::new(
            &GamesConfig::default(),
            Arc::new(Catalog::default()),
            StdRng::seed_from_u64(5),
            t0,
        );
        g.update(t0, &set(&[1, 4, 5]));
        let mut t = t0 + Duration::from_secs(10);
        g.update(t, &set(&[]));
        for _ in 0..3 {
            t += Duration::from_secs(3);
            g.update(t, &set(&[]));
        }
        assert!(g.should_listen(), "three items shown, now answering");
        (g, t)
    }

    fn name(id: MarkerId) -> &'static str {
        match id {
            1 => "pera",
            4 => "manzana",
            5 => "naranja",
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_scan_then_sequence_of_three() {
        let (g, _) = answering(Instant::now());
        let mut s = g.sequence().to_vec();
        s.sort();
        assert_eq!(s, vec![1, 4, 5]);
    }

    #[test]
    fn test_showing_renders_one_at_a_time() {
        let t0 = Instant::now();
        let mut g = MemoryGame::new(
            &GamesConfig::default(),
            Arc::new(Catalog::default()),
            StdRng::seed_from_u64(5),
            t0,
        );
        g.update(t0, &set(&[1, 4, 5]));
        g.update(t0 + Duration::from_secs(10), &set(&[1, 4, 5]));
        let first = g.sequence()[0];
        assert_eq!(g.render_markers(&set(&[1, 4, 5])), vec![first]);
        assert!(!g.should_listen());
    }

    #[test]
    fn test_same_order_wins() {
        let (mut g, t) = answering(Instant::now());
        let seq = g.sequence().to_vec();
        g.handle_utterance(name(seq[0]), t);
        assert!(g.outcome().is_none());
        g.handle_utterance(&format!("{} y {}", name(seq[1]), name(seq[2])), t);
        let o = g.outcome().expect("finished");
        assert!(o.success);
        assert_eq!((o.score, o.total), (1, 1));
    }

    #[test]
    fn test_order_mismatch_fails_whole_round() {
        let (mut g, t) = answering(Instant::now());
        let seq = g.sequence().to_vec();
        // [X, Y, Z] に対して [Y, X, Z]
        let spoken = format!("{} {} {}", name(seq[1]), name(seq[0]), name(seq[2]));
        g.handle_utterance(&spoken, t);
        let o = g.outcome().expect("mismatch ends the round");
        assert!(!o.success);
        assert_eq!(o.score, 0);
    }

    #[test]
    fn test_timeout_fails() {
        let (mut g, t) = answering(Instant::now());
        g.update(t + Duration::from_secs(30), &set(&[]));
        assert_eq!(g.outcome().map(|o| o.success), Some(false));
    }

    #[test]
    fn test_unrecognized_utterance_ignored() {
        let (mut g, t) = answering(Instant::now());
        g.handle_utterance("eh no me acuerdo", t);
        assert!(g.outcome().is_none());
        assert!(g.responses().is_empty());
    }
}
