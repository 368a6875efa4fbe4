//! スキャン窓・締め切りの共通ユーティリティ

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::config::ScanConfig;
use crate::marker::MarkerId;

/// 締め切り
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(now: Instant, secs: f32) -> Self {
        Self { at: now + Duration::from_secs_f32(secs.max(0.0)) }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }

    /// 表示用の残り秒（切り上げ）
    pub fn remaining_secs(&self, now: Instant) -> u64 {
        let r = self.remaining(now);
        r.as_secs() + u64::from(r.subsec_nanos() > 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanStatus {
    /// 窓の途中
    Scanning { remaining_secs: u64 },
    /// 窓が終わったが数が足りない（猶予中）
    Short { seen: usize, remaining_secs: u64 },
    /// 猶予も切れたのでやり直した
    Restarted,
    /// 必要数を満たした（昇順）
    Complete(Vec<MarkerId>),
}

/// 一定時間マーカーを集め、必要数に届かなければ猶予のあとやり直す
#[derive(Debug, Clone)]
pub struct ScanGate {
    config: ScanConfig,
    started: Instant,
    seen: BTreeSet<MarkerId>,
}

impl ScanGate {
    pub fn new(config: ScanConfig, now: Instant) -> Self {
        Self { config, started: now, seen: BTreeSet::new() }
    }

    pub fn observe<I: IntoIterator<Item = MarkerId>>(&mut self, visible: I) {
        self.seen.extend(visible);
    }

    pub fn seen(&self) -> &BTreeSet<MarkerId> {
        &self.seen
    }

    pub fn required(&self) -> usize {
        self.config.required
    }

    pub fn restart(&mut self, now: Instant) {
        self.started = now;
        self.seen.clear();
    }

    pub fn poll(&mut self, now: Instant) -> ScanStatus {
        let window = Deadline::after(self.started, self.config.window_secs);
        if !window.expired(now) {
            return ScanStatus::Scanning { remaining_secs: window.remaining_secs(now) };
        }
        if self.seen.len() >= self.config.required {
            return ScanStatus::Complete(self.seen.iter().copied().collect());
        }
        let grace = Deadline::after(self.started, self.config.window_secs + self.config.grace_secs);
        if grace.expired(now) {
            self.restart(now);
            return ScanStatus::Restarted;
        }
        ScanStatus::Short { seen: self.seen.len(), remaining_secs: grace.remaining_secs(now) }
    }
}
