use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::matcher::matches_with;
use super::quorum::{Deadline, ScanGate, ScanStatus};
use super::{grade_line, Feedback, GameKind, GameOutcome, GameRound};
use crate::catalog::Catalog;
use crate::config::GamesConfig;
use crate::marker::MarkerId;

#[derive(Debug, Clone)]
enum Phase {
    Scan(ScanGate),
    /// 現在のマーカーが見えるのを待つ
    Waiting { current: MarkerId },
    Asking { current: MarkerId, deadline: Deadline },
    Finished(GameOutcome),
}

/// 「見つけて名前を言う」: 1枚ずつ見せて名前を答える
pub struct DiscoverGame {
    config: GamesConfig,
    catalog: Arc<Catalog>,
    rng: StdRng,
    phase: Phase,
    pending: VecDeque<MarkerId>,
    answered: BTreeSet<MarkerId>,
    attempts: u32,
    correct: u32,
    feedback: Option<Feedback>,
    scan_note: Option<String>,
}

impl DiscoverGame {
    pub fn new(config: &GamesConfig, catalog: Arc<Catalog>, rng: StdRng, now: Instant) -> Self {
        Self {
            config: config.clone(),
            catalog,
            rng,
            phase: Phase::Scan(ScanGate::new(config.discover_scan, now)),
            pending: VecDeque::new(),
            answered: BTreeSet::new(),
            attempts: 0,
            correct: 0,
            feedback: None,
            scan_note: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current(&self) -> Option<MarkerId> {
        match self.phase {
            Phase::Waiting { current } | Phase::Asking { current, .. } => Some(current),
            _ => None,
        }
    }

    fn name_of(&self, id: MarkerId) -> String {
        self.catalog.name(id).unwrap_or("?").to_string()
    }

    /// 次のマーカーへ。キューが空なら終了。
    fn advance(&mut self) {
        match self.pending.pop_front() {
            Some(next) => {
                debug!("discover: next marker {}", next);
                self.phase = Phase::Waiting { current: next };
            }
            None => self.finish(),
        }
    }

    fn finish(&mut self) {
        let total = self.attempts;
        let score = self.correct;
        let success = total > 0 && score as f32 >= self.config.success_ratio * total as f32;
        let lines = vec![
            format!("Has acertado {} de {}", score, total),
            grade_line(score, total).to_string(),
        ];
        info!("discover finished: {}/{}", score, total);
        self.phase = Phase::Finished(GameOutcome { score, total, attempts: total, success, lines });
    }
}

impl GameRound for DiscoverGame {
    fn kind(&self) -> GameKind {
        GameKind::Discover
    }

    fn update(&mut self, now: Instant, visible: &BTreeSet<MarkerId>) {
        if self.feedback.as_ref().is_some_and(|f| f.active(now)) {
            return;
        }
        match &mut self.phase {
            Phase::Scan(gate) => {
                gate.observe(visible.iter().copied().filter(|id| self.catalog.is_food(*id)));
                match gate.poll(now) {
                    ScanStatus::Complete(ids) => {
                        let mut ids = ids;
                        ids.shuffle(&mut self.rng);
                        self.pending = ids.into();
                        self.scan_note = None;
                        self.advance();
                    }
                    ScanStatus::Restarted => {
                        self.scan_note = Some("No se detectaron marcadores. Volvemos a buscar.".to_string());
                    }
                    _ => {}
                }
            }
            Phase::Waiting { current } => {
                if visible.contains(current) {
                    let current = *current;
                    self.phase = Phase::Asking {
                        current,
                        deadline: Deadline::after(now, self.config.discover_item_timeout_secs),
                    };
                }
            }
            Phase::Asking { current, deadline } => {
                if !visible.contains(current) {
                    // 見えなくなったら質問をリセット
                    let current = *current;
                    self.phase = Phase::Waiting { current };
                } else if deadline.expired(now) {
                    let id = *current;
                    let name = self.name_of(id);
                    self.feedback = Some(Feedback::new(format!("¡Tiempo! Era {}", name), now));
                    self.advance();
                }
            }
            Phase::Finished(_) => {}
        }
    }

    fn handle_utterance(&mut self, text: &str, now: Instant) {
        let Phase::Asking { current, .. } = self.phase else {
            return;
        };
        let name = self.name_of(current);
        let extra = self.catalog.synonyms_for(&name).to_vec();
        self.attempts += 1;
        self.answered.insert(current);
        if matches_with(text, &name, &extra) {
            self.correct += 1;
            self.feedback = Some(Feedback::new(format!("¡Correcto! Es {}", name), now));
        } else {
            self.feedback = Some(Feedback::new(format!("No, es {}", name), now));
        }
        self.advance();
    }

    fn render_markers(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId> {
        match &self.phase {
            Phase::Scan(_) => visible.iter().copied().filter(|id| self.catalog.is_food(*id)).collect(),
            Phase::Waiting { current } | Phase::Asking { current, .. } => {
                if visible.contains(current) {
                    vec![*current]
                } else {
                    Vec::new()
                }
            }
            Phase::Finished(_) => Vec::new(),
        }
    }

    fn should_listen(&self) -> bool {
        matches!(self.phase, Phase::Asking { .. })
    }

    fn messages(&self, now: Instant) -> Vec<String> {
        let mut lines = vec![GameKind::Discover.title().to_string()];
        if let Some(f) = self.feedback.as_ref().filter(|f| f.active(now)) {
            lines.push(f.text.clone());
            return lines;
        }
        match &self.phase {
            Phase::Scan(gate) => {
                lines.push("Muestra tus marcadores a la cámara".to_string());
                lines.push(format!("Detectados: {}", gate.seen().len()));
                if let Some(note) = &self.scan_note {
                    lines.push(note.clone());
                }
            }
            Phase::Waiting { .. } => lines.push("Enseña el siguiente marcador".to_string()),
            Phase::Asking { deadline, .. } => {
                lines.push("¿Qué es esto?".to_string());
                lines.push(format!("Tiempo: {}s", deadline.remaining_secs(now)));
            }
            Phase::Finished(outcome) => lines.extend(outcome.lines.iter().cloned()),
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
        self.phase = Phase::Scan(ScanGate::new(self.config.discover_scan, now));
        self.pending.clear();
        self.answered.clear();
        self.attempts = 0;
        self.correct = 0;
        self.feedback = None;
        self.scan_note = None;
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

    fn game(now: Instant) -> DiscoverGame {
        DiscoverGame::new(&GamesConfig::default(), Arc::new(Catalog::default()), StdRng::seed_from_u64(7), now)
    }

    fn scanned(t0: Instant, ids: &[MarkerId]) -> (DiscoverGame, Instant) {
        let mut g = game(t0);
        g.update(t0, &set(ids));
        let t = t0 + Duration::from_secs(10);
        g.update(t, &set(&[]));
        (g, t)
    }

    #[test]
    fn test_scan_ignores_non_food_markers() {
        let t0 = Instant::now();
        let mut g = game(t0);
        g.update(t0, &set(&[0, 99]));
        g.update(t0 + Duration::from_secs(10), &set(&[]));
        assert!(g.current().is_none(), "mascot and unknown ids do not count");
        assert!(g.render_markers(&set(&[0, 1])) == vec![1]);
    }

    #[test]
    fn test_correct_answer_scores() {
        let t0 = Instant::now();
        let (mut g, t) = scanned(t0, &[1]);
        assert_eq!(g.current(), Some(1));
        assert!(!g.should_listen(), "waits until marker is visible");
        g.update(t, &set(&[1]));
        assert!(g.should_listen());
        g.handle_utterance("creo que es una pera", t);
        let o = g.outcome().expect("single marker game finishes");
        assert_eq!((o.score, o.total), (1, 1));
        assert!(o.success);
    }

    #[test]
    fn test_timeout_moves_on_without_attempt() {
        let t0 = Instant::now();
        let (mut g, t) = scanned(t0, &[1, 4]);
        let first = g.current().unwrap();
        g.update(t, &set(&[1, 4]));
        let late = t + Duration::from_secs(15);
        g.update(late, &set(&[1, 4]));
        assert_ne!(g.current(), Some(first), "moved to next marker");
        assert_eq!(g.attempts(), 0, "timeout is not an attempt");

        // フィードバック表示中は進まない
        let after = late + Duration::from_secs(1);
        g.update(after, &set(&[1, 4]));
        g.handle_utterance("manzana", after);
        let o = g.outcome().expect("queue empty");
        assert_eq!(o.total, 1);
    }

    #[test]
    fn test_losing_marker_resets_question() {
        let t0 = Instant::now();
        let (mut g, t) = scanned(t0, &[4]);
        g.update(t, &set(&[4]));
        assert!(g.should_listen());
        g.update(t + Duration::from_secs(1), &set(&[]));
        assert!(!g.should_listen());
        g.handle_utterance("manzana", t + Duration::from_secs(2));
        assert!(g.outcome().is_none(), "answers ignored while marker hidden");
    }

    #[test]
    fn test_wrong_answer_counts_attempt() {
        let t0 = Instant::now();
        let (mut g, t) = scanned(t0, &[4]);
        g.update(t, &set(&[4]));
        g.handle_utterance("pera", t);
        let o = g.outcome().unwrap();
        assert_eq!((o.score, o.total), (0, 1));
        assert!(!o.success);
    }

    #[test]
    fn test_restart_returns_to_scan() {
        let t0 = Instant::now();
        let (mut g, t) = scanned(t0, &[4]);
        g.update(t, &set(&[4]));
        g.handle_utterance("manzana", t);
        assert!(g.outcome().is_some());
        g.restart(t);
        assert!(g.outcome().is_none());
        assert!(g.current().is_none());
    }
}
