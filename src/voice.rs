//! 音声入力スレッドと描画ループの受け渡し
//!
//! 音声スレッドは `listening && mic_ready` の間だけ認識器を呼び、
//! 認識結果を最新1件だけ `VoiceLink` に置く（上書き、キューなし）。
//! 描画ループはフェーズが変わるたびに epoch を進め、古いフェーズで
//! 聞き始めた発話は捨てられる。

use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("no speech before timeout")]
    NoSpeechTimeout,

    #[error("audio could not be understood")]
    UnintelligibleAudio,

    #[error("speech service error: {0}")]
    Service(String),
}

/// 1回の聞き取りの待ち時間と発話の長さの上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenWindow {
    pub timeout: Duration,
    pub phrase_limit: Duration,
}

impl ListenWindow {
    pub fn normal(config: &VoiceConfig) -> Self {
        Self {
            timeout: Duration::from_secs_f32(config.listen_timeout_secs),
            phrase_limit: Duration::from_secs_f32(config.phrase_limit_secs),
        }
    }

    /// 名前を聞くとき
    pub fn long(config: &VoiceConfig) -> Self {
        Self {
            timeout: Duration::from_secs_f32(config.name_listen_timeout_secs),
            phrase_limit: Duration::from_secs_f32(config.name_phrase_limit_secs),
        }
    }
}

pub trait SpeechRecognizer: Send {
    fn listen(&mut self, window: ListenWindow) -> Result<String, SpeechError>;
}

/// 音声合成の差し替え口
pub trait Announcer: Send {
    fn announce(&mut self, text: &str);
}

/// ログに出すだけのアナウンサー。話している間はマイクを止める。
pub struct LogAnnouncer {
    link: Arc<VoiceLink>,
}

impl LogAnnouncer {
    pub fn new(link: Arc<VoiceLink>) -> Self {
        Self { link }
    }
}

impl Announcer for LogAnnouncer {
    fn announce(&mut self, text: &str) {
        self.link.set_mic_ready(false);
        info!("[tts] {}", text);
        self.link.set_mic_ready(true);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Utterance {
    text: String,
    epoch: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 2スレッド間で共有するフラグと受け渡し口
#[derive(Debug)]
pub struct VoiceLink {
    running: AtomicBool,
    listening: AtomicBool,
    mic_ready: AtomicBool,
    long_window: AtomicBool,
    epoch: AtomicU64,
    utterance: Mutex<Option<Utterance>>,
    error: Mutex<Option<String>>,
}

impl Default for VoiceLink {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceLink {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            mic_ready: AtomicBool::new(true),
            long_window: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            utterance: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// 聞き取りを止めたときは未処理の発話も捨てる
    pub fn set_listening(&self, on: bool) {
        let was = self.listening.swap(on, Ordering::Relaxed);
        if was && !on {
            self.advance_epoch();
        }
    }

    pub fn is_mic_ready(&self) -> bool {
        self.mic_ready.load(Ordering::Relaxed)
    }

    pub fn set_mic_ready(&self, ready: bool) {
        self.mic_ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_long_window(&self, long: bool) {
        self.long_window.store(long, Ordering::Relaxed);
    }

    pub fn wants_long_window(&self) -> bool {
        self.long_window.load(Ordering::Relaxed)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// フェーズ遷移のたびに呼ぶ
    pub fn advance_epoch(&self) {
        let mut slot = lock(&self.utterance);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *slot = None;
    }

    /// `epoch` は聞き始めた時点の値。その後にフェーズが変わっていたら捨てる。
    pub fn publish(&self, epoch: u64, text: impl Into<String>) -> bool {
        let mut slot = lock(&self.utterance);
        if epoch != self.epoch() {
            debug!("dropping stale utterance (epoch {} != {})", epoch, self.epoch());
            return false;
        }
        *slot = Some(Utterance { text: text.into(), epoch });
        true
    }

    pub fn take_utterance(&self) -> Option<String> {
        let mut slot = lock(&self.utterance);
        match slot.take() {
            Some(u) if u.epoch == self.epoch() => Some(u.text),
            _ => None,
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *lock(&self.error) = Some(message.into());
    }

    pub fn take_error(&self) -> Option<String> {
        lock(&self.error).take()
    }
}

/// 認識器を呼び続けるバックグラウンドスレッド
pub struct VoiceIngestService {
    link: Arc<VoiceLink>,
    handle: Option<JoinHandle<()>>,
}

impl VoiceIngestService {
    pub fn spawn(
        mut recognizer: Box<dyn SpeechRecognizer>,
        link: Arc<VoiceLink>,
        config: VoiceConfig,
    ) -> Result<Self> {
        let thread_link = Arc::clone(&link);
        let handle = thread::Builder::new()
            .name("voice".to_string())
            .spawn(move || run_loop(recognizer.as_mut(), &thread_link, &config))
            .context("failed to spawn voice thread")?;
        info!("voice ingest started");
        Ok(Self { link, handle: Some(handle) })
    }

    pub fn link(&self) -> &Arc<VoiceLink> {
        &self.link
    }

    /// 実行フラグを下ろし、現在の聞き取りが終わるのを待つ
    pub fn stop(&mut self) {
        self.link.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("voice thread panicked");
            }
            info!("voice ingest stopped");
        }
    }
}

impl Drop for VoiceIngestService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(recognizer: &mut dyn SpeechRecognizer, link: &VoiceLink, config: &VoiceConfig) {
    let idle = Duration::from_millis(config.idle_poll_ms);
    let backoff = Duration::from_secs_f32(config.error_backoff_secs);
    while link.is_running() {
        if !(link.is_listening() && link.is_mic_ready()) {
            thread::sleep(idle);
            continue;
        }
        let window = if link.wants_long_window() {
            ListenWindow::long(config)
        } else {
            ListenWindow::normal(config)
        };
        let epoch = link.epoch();
        match recognizer.listen(window) {
            Ok(text) => {
                let text = text.trim().to_lowercase();
                if text.is_empty() {
                    continue;
                }
                debug!("[voice] heard '{}'", text);
                link.publish(epoch, text);
            }
            Err(SpeechError::NoSpeechTimeout) => {
                debug!("[voice] no speech");
            }
            Err(SpeechError::UnintelligibleAudio) => {
                link.set_error("No se entendió, habla más claro.");
            }
            Err(e) => {
                warn!("[voice] {}", e);
                link.set_error("Error con el servicio de reconocimiento. Reintentando...");
                thread::sleep(backoff);
            }
        }
    }
}

/// 標準入力の1行を1発話として扱う。空行は聞き取れなかった扱い。
pub struct ConsoleRecognizer {
    lines: Receiver<String>,
}

impl ConsoleRecognizer {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn stdin reader")?;
        Ok(Self { lines: rx })
    }
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn listen(&mut self, window: ListenWindow) -> Result<String, SpeechError> {
        match self.lines.recv_timeout(window.timeout) {
            Ok(line) if line.trim().is_empty() => Err(SpeechError::UnintelligibleAudio),
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(SpeechError::NoSpeechTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(SpeechError::Service("stdin closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Scripted {
        replies: VecDeque<Result<String, SpeechError>>,
        calls: Arc<AtomicUsize>,
    }

    impl SpeechRecognizer for Scripted {
        fn listen(&mut self, _window: ListenWindow) -> Result<String, SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.replies.pop_front().unwrap_or(Err(SpeechError::NoSpeechTimeout))
        }
    }

    fn fast_config() -> VoiceConfig {
        VoiceConfig { idle_poll_ms: 5, error_backoff_secs: 0.01, ..VoiceConfig::default() }
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> Option<T> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if let Some(v) = f() {
                return Some(v);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_last_write_wins() {
        let link = VoiceLink::new();
        let e = link.epoch();
        assert!(link.publish(e, "pera"));
        assert!(link.publish(e, "manzana"));
        assert_eq!(link.take_utterance().as_deref(), Some("manzana"));
        assert_eq!(link.take_utterance(), None, "consumed once");
    }

    #[test]
    fn test_stale_epoch_dropped() {
        let link = VoiceLink::new();
        let e = link.epoch();
        link.advance_epoch();
        assert!(!link.publish(e, "registrarme"));
        assert_eq!(link.take_utterance(), None);
    }

    #[test]
    fn test_stop_listening_discards_pending() {
        let link = VoiceLink::new();
        link.set_listening(true);
        link.publish(link.epoch(), "pera");
        link.set_listening(false);
        assert_eq!(link.take_utterance(), None);
    }

    #[test]
    fn test_service_publishes_only_while_listening() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recognizer = Scripted {
            replies: VecDeque::from(vec![
                Err(SpeechError::UnintelligibleAudio),
                Ok("  Iniciar Sesión ".to_string()),
            ]),
            calls: Arc::clone(&calls),
        };
        let link = Arc::new(VoiceLink::new());
        let mut service = VoiceIngestService::spawn(Box::new(recognizer), Arc::clone(&link), fast_config()).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "idle while not listening");

        link.set_listening(true);
        let text = wait_for(|| link.take_utterance());
        assert_eq!(text.as_deref(), Some("iniciar sesión"));
        assert_eq!(link.take_error().as_deref(), Some("No se entendió, habla más claro."));

        service.stop();
        assert!(!link.is_running());
    }

    #[test]
    fn test_mic_not_ready_pauses_listening() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recognizer = Scripted { replies: VecDeque::new(), calls: Arc::clone(&calls) };
        let link = Arc::new(VoiceLink::new());
        link.set_listening(true);
        link.set_mic_ready(false);
        let mut service = VoiceIngestService::spawn(Box::new(recognizer), Arc::clone(&link), fast_config()).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        service.stop();
    }
}
